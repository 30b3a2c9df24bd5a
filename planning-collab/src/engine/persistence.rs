//! Persistence publisher: one task per open planning.
//!
//! ```text
//!  actor ──Applied/Conflict/Flush──► publisher ──spawn_blocking──► PlanningStore
//!    ▲                                   │
//!    └──────Feedback (status, reconcile)─┘
//! ```
//!
//! Every accepted operation is appended as soon as it arrives. The document
//! itself is saved once no operation arrived for `save_debounce`, on explicit
//! flush, and when the actor shuts down. A save carries the version last seen
//! in storage; on `VersionConflict` the publisher fetches what is stored,
//! asks the actor to fold in the foreign operations, and saves the merged
//! result against the fresh version.
//!
//! Folding re-sequences the foreign operations. Their log entries are only
//! rewritten once a save at or beyond the new seq has landed, so the log never
//! disagrees with the stored document about which operation holds a seq.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::conflict::PlanningConflict;
use crate::model::{Planning, PlanningId};
use crate::operation::Operation;
use crate::session::SaveStatus;
use crate::storage::{PlanningStore, StoreError, StoredPlanning};

pub(crate) enum PersistMessage {
    Applied { planning: Planning, operation: Operation },
    Conflict(PlanningConflict),
    Flush { reply: oneshot::Sender<()> },
}

/// Messages from the publisher back to its actor.
pub(crate) enum Feedback {
    Status { status: SaveStatus, saved_version: Option<u64> },
    Reconcile { stored: StoredPlanning, reply: oneshot::Sender<Planning> },
}

/// Run a store call on the blocking pool.
pub(crate) async fn blocking<T, F>(store: &Arc<dyn PlanningStore>, f: F) -> Result<T, StoreError>
where
    F: FnOnce(&dyn PlanningStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
}

pub(crate) struct PersistenceHandle {
    pub tx: mpsc::UnboundedSender<PersistMessage>,
    pub task: JoinHandle<()>,
}

pub(crate) fn spawn(
    planning_id: PlanningId,
    stored_version: u64,
    store: Arc<dyn PlanningStore>,
    config: CollabConfig,
    feedback: mpsc::Sender<Feedback>,
) -> PersistenceHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let publisher = Publisher {
        planning_id,
        store,
        config,
        rx,
        feedback,
        latest: None,
        stored_version,
        deadline: None,
        consecutive_failures: 0,
        reconciled: HashSet::new(),
        deferred: Vec::new(),
    };
    PersistenceHandle { tx, task: tokio::spawn(publisher.run()) }
}

struct Publisher {
    planning_id: PlanningId,
    store: Arc<dyn PlanningStore>,
    config: CollabConfig,
    rx: mpsc::UnboundedReceiver<PersistMessage>,
    feedback: mpsc::Sender<Feedback>,
    /// Newest document state not yet known to be saved
    latest: Option<Planning>,
    /// Version currently in storage, as far as this publisher knows
    stored_version: u64,
    deadline: Option<Instant>,
    consecutive_failures: u32,
    /// Ids found in the stored log during reconciliation
    reconciled: HashSet<Uuid>,
    /// Re-sequenced operations waiting for a save that covers their seq
    deferred: Vec<Operation>,
}

impl Publisher {
    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(PersistMessage::Applied { planning, operation }) => self.on_applied(planning, operation).await,
                    Some(PersistMessage::Conflict(conflict)) => self.record_conflict(conflict).await,
                    Some(PersistMessage::Flush { reply }) => {
                        self.save().await;
                        let _ = reply.send(());
                    }
                    None => break,
                },
                _ = sleep_until(self.deadline), if self.deadline.is_some() => {
                    self.deadline = None;
                    self.save().await;
                }
            }
        }

        // Teardown flush
        self.save().await;
        if let Some(unsaved) = &self.latest {
            log::error!(
                "Planning {} closed with unsaved version {} (stored: {})",
                self.planning_id,
                unsaved.version,
                self.stored_version
            );
        }
        if !self.deferred.is_empty() {
            log::warn!(
                "Planning {} closed with {} reconciled operations still logged under their old seq",
                self.planning_id,
                self.deferred.len()
            );
        }
        log::debug!("Persistence publisher for {} stopped", self.planning_id);
    }

    async fn on_applied(&mut self, planning: Planning, operation: Operation) {
        if self.reconciled.remove(&operation.id) && operation.seq > self.stored_version {
            self.deferred.push(operation);
        } else {
            self.append(operation).await;
        }
        if planning.version > self.stored_version {
            self.latest = Some(planning);
            self.deadline = Some(Instant::now() + self.config.save_debounce);
        }
    }

    /// Rewrite the log entries of re-sequenced operations now covered by a save.
    async fn append_deferred(&mut self) {
        let stored_version = self.stored_version;
        let (ready, waiting): (Vec<Operation>, Vec<Operation>) =
            self.deferred.drain(..).partition(|op| op.seq <= stored_version);
        self.deferred = waiting;
        for operation in ready {
            self.append(operation).await;
        }
    }

    async fn append(&mut self, operation: Operation) {
        let planning_id = self.planning_id;
        for attempt in 1..=self.config.max_save_attempts.max(1) {
            let op = operation.clone();
            match blocking(&self.store, move |s| s.append_operation(planning_id, &op)).await {
                Ok(fresh) => {
                    if !fresh {
                        log::trace!("Operation {} already in the log of {planning_id}", operation.id);
                    }
                    return;
                }
                Err(e) if e.is_transient() && attempt < self.config.max_save_attempts => {
                    log::warn!("Append of {} to {planning_id} failed (attempt {attempt}): {e}", operation.id);
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                }
                Err(e) => {
                    log::error!("Giving up appending {} to {planning_id}: {e}", operation.id);
                    return;
                }
            }
        }
    }

    async fn record_conflict(&self, conflict: PlanningConflict) {
        let id = conflict.id;
        if let Err(e) = blocking(&self.store, move |s| s.record_conflict(&conflict)).await {
            log::error!("Failed to persist conflict {id} for {}: {e}", self.planning_id);
        }
    }

    /// Save `latest` if it is ahead of storage. Retries transient failures
    /// with exponential backoff; on giving up, re-arms the timer.
    async fn save(&mut self) {
        let Some(mut planning) = self.latest.clone() else {
            return;
        };
        let planning_id = self.planning_id;

        for attempt in 1..=self.config.max_save_attempts.max(1) {
            let expected = self.stored_version;
            let doc = planning.clone();
            let result = blocking(&self.store, move |s| s.save_planning(planning_id, &doc, expected)).await;

            match result {
                Ok(()) => {
                    log::debug!("Saved planning {planning_id} at version {}", planning.version);
                    self.stored_version = planning.version;
                    self.consecutive_failures = 0;
                    if self.latest.as_ref().is_some_and(|l| l.version <= planning.version) {
                        self.latest = None;
                    }
                    self.notify(SaveStatus::Saved, Some(planning.version)).await;
                    self.append_deferred().await;
                    return;
                }
                Err(StoreError::VersionConflict { expected, actual }) => {
                    log::info!("Stale save of {planning_id}: expected {expected}, stored {actual}; reconciling");
                    match self.reconcile().await {
                        Some((stored_version, merged)) => {
                            self.stored_version = stored_version;
                            planning = merged;
                        }
                        None => break,
                    }
                }
                Err(e) if e.is_transient() => {
                    self.consecutive_failures += 1;
                    let status = if self.consecutive_failures >= self.config.save_failure_threshold {
                        if self.consecutive_failures == self.config.save_failure_threshold {
                            log::error!(
                                "Saving planning {planning_id} failed {} times in a row: {e}",
                                self.consecutive_failures
                            );
                        }
                        SaveStatus::Failing { consecutive_failures: self.consecutive_failures }
                    } else {
                        log::warn!("Save of {planning_id} failed (attempt {attempt}): {e}");
                        SaveStatus::Retrying { attempt }
                    };
                    self.notify(status, None).await;
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    log::error!("Save of {planning_id} failed permanently: {e}");
                    self.notify(SaveStatus::Failing { consecutive_failures: self.consecutive_failures }, None)
                        .await;
                    break;
                }
            }
        }

        // Memory stays authoritative; try again later.
        self.deadline = Some(Instant::now() + self.config.save_backoff_max);
    }

    /// Fetch the stored document and have the actor merge foreign operations.
    /// Returns the stored version to save against and the merged document.
    async fn reconcile(&mut self) -> Option<(u64, Planning)> {
        let planning_id = self.planning_id;
        let stored = match blocking(&self.store, move |s| s.get_planning(planning_id)).await {
            Ok(stored) => stored,
            Err(e) => {
                log::error!("Reconcile of {planning_id} could not load stored copy: {e}");
                return None;
            }
        };
        let stored_version = stored.planning.version;
        self.reconciled.extend(stored.operations.iter().map(|op| op.id));

        let (reply, rx) = oneshot::channel();
        if self.feedback.send(Feedback::Reconcile { stored, reply }).await.is_err() {
            log::warn!("Actor for {planning_id} is gone, cannot reconcile");
            return None;
        }
        match rx.await {
            Ok(merged) => Some((stored_version, merged)),
            Err(_) => None,
        }
    }

    async fn notify(&self, status: SaveStatus, saved_version: Option<u64>) {
        if self.feedback.send(Feedback::Status { status, saved_version }).await.is_err() {
            log::debug!("Save status for {} dropped, actor gone", self.planning_id);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
