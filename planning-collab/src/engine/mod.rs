//! Collaboration engine: a supervising registry of document actors.
//!
//! ```text
//!                 ┌──────────────────────────────┐
//! join/submit ──► │ PlanningRegistry             │
//!                 │  planning_id → DocumentHandle│
//!                 └──────────────┬───────────────┘
//!                                │ bounded mpsc
//!                  ┌─────────────┴─────────────┐
//!                  ▼                           ▼
//!           DocumentActor (A)           DocumentActor (B)
//!            ├── event pump ──► Transport
//!            └── persistence publisher ──► PlanningStore
//! ```
//!
//! The first join loads a planning from storage and starts its actor. When
//! the last participant leaves, the actor flushes and stops. Operations on
//! different plannings never wait on each other.

mod actor;
pub mod events;
pub mod window;
mod persistence;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::conflict::PlanningConflict;
use crate::error::{CollabError, Result};
use crate::identity::CurrentUser;
use crate::model::{Planning, PlanningId, UserId};
use crate::operation::{Operation, TextField};
use crate::session::{LockState, PlanningSession, SaveStatus, SelectionRange};
use crate::storage::{PlanningStore, StoreError};
use crate::transport::Transport;

use actor::{Command, DocumentActor, DocumentHandle};
use persistence::blocking;

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// The operation as applied: rebased, clamped and carrying its seq.
    pub operation: Operation,
    /// Planning version after the call.
    pub version: u64,
    /// The id had already been applied; nothing changed.
    pub duplicate: bool,
    /// Conflicts recorded while merging this operation.
    pub conflicts: Vec<PlanningConflict>,
}

/// State handed to a client on join or resync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningSnapshot {
    pub planning: Planning,
    pub session: PlanningSession,
    /// Operations after the requested version, oldest first.
    pub operations: Vec<Operation>,
    /// The requested version is outside the transform window; replace local
    /// state with `planning` instead of replaying `operations`.
    pub requires_reset: bool,
    pub unresolved_conflicts: Vec<PlanningConflict>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStats {
    pub planning_id: PlanningId,
    pub version: u64,
    pub participants: usize,
    pub window_len: usize,
    pub window_floor: u64,
    pub unresolved_conflicts: usize,
    pub save_status: SaveStatus,
    pub has_unsaved_changes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub open_plannings: usize,
    pub participants: usize,
    pub documents: Vec<DocumentStats>,
}

/// One planning's entry in the registry.
///
/// The registry map is only locked to find or insert a slot. Opening,
/// joining, leaving and closing a planning are serialized on the slot's own
/// `lifecycle` lock, so a slow load or teardown flush holds up that planning
/// alone.
#[derive(Default)]
struct DocumentSlot {
    lifecycle: Mutex<Lifecycle>,
    /// Handle of the running actor, readable without waiting on `lifecycle`
    handle: RwLock<Option<DocumentHandle>>,
}

#[derive(Default)]
struct Lifecycle {
    task: Option<JoinHandle<()>>,
    /// Removed from the registry; a new slot must be created to reopen
    retired: bool,
}

impl DocumentSlot {
    fn current(&self) -> Option<DocumentHandle> {
        self.handle.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set(&self, handle: DocumentHandle) {
        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn take(&self) -> Option<DocumentHandle> {
        self.handle.write().unwrap_or_else(PoisonError::into_inner).take()
    }
}

pub struct PlanningRegistry {
    store: Arc<dyn PlanningStore>,
    transport: Arc<dyn Transport>,
    config: CollabConfig,
    documents: Mutex<HashMap<PlanningId, Arc<DocumentSlot>>>,
}

fn store_error(planning_id: PlanningId, e: StoreError) -> CollabError {
    match e {
        StoreError::NotFound(_) => CollabError::DocumentNotFound(planning_id),
        other => CollabError::Store(other),
    }
}

impl PlanningRegistry {
    pub fn new(store: Arc<dyn PlanningStore>, transport: Arc<dyn Transport>, config: CollabConfig) -> Self {
        Self { store, transport, config, documents: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Persist a new planning. It opens on first join.
    pub async fn create_planning(&self, planning: Planning) -> Result<Planning> {
        if planning.title.trim().is_empty() {
            return Err(CollabError::Validation("planning title is empty".into()));
        }
        let doc = planning.clone();
        blocking(&self.store, move |s| s.create_planning(&doc)).await?;
        log::info!("Created planning {} for family {}", planning.id, planning.family_id);
        Ok(planning)
    }

    async fn slot(&self, planning_id: PlanningId) -> Arc<DocumentSlot> {
        self.documents.lock().await.entry(planning_id).or_default().clone()
    }

    async fn existing_slot(&self, planning_id: PlanningId) -> Option<Arc<DocumentSlot>> {
        self.documents.lock().await.get(&planning_id).cloned()
    }

    /// Join a planning, opening it if needed. Returns the current snapshot.
    pub async fn join(&self, planning_id: PlanningId, user: &CurrentUser) -> Result<PlanningSnapshot> {
        loop {
            let slot = self.slot(planning_id).await;
            let mut lifecycle = slot.lifecycle.lock().await;
            if lifecycle.retired {
                // Closed while we waited; start over with a fresh slot.
                continue;
            }

            let (handle, opened_here) = match slot.current() {
                Some(handle) if !handle.is_closed() => (handle, false),
                _ => match self.open(planning_id).await {
                    Ok((handle, task)) => {
                        slot.set(handle.clone());
                        lifecycle.task = Some(task);
                        (handle, true)
                    }
                    Err(e) => {
                        self.retire(planning_id, &slot, &mut lifecycle).await;
                        return Err(e);
                    }
                },
            };

            let user = user.clone();
            let result = handle.request(|reply| Command::Join { user, reply }).await?;
            if result.is_err() && opened_here {
                self.close(planning_id, &slot, &mut lifecycle).await;
            }
            return result;
        }
    }

    async fn open(&self, planning_id: PlanningId) -> Result<(DocumentHandle, JoinHandle<()>)> {
        let stored = blocking(&self.store, move |s| s.get_planning(planning_id))
            .await
            .map_err(|e| store_error(planning_id, e))?;
        let conflicts = blocking(&self.store, move |s| s.list_conflicts(planning_id))
            .await
            .map_err(|e| store_error(planning_id, e))?;

        Ok(DocumentActor::spawn(stored, conflicts, self.store.clone(), self.transport.clone(), self.config.clone()))
    }

    /// Stop the actor, wait for its teardown flush, then drop the slot from
    /// the registry. Callers hold the slot's lifecycle lock throughout, so a
    /// concurrent join reopens only after the flush is done.
    async fn close(&self, planning_id: PlanningId, slot: &Arc<DocumentSlot>, lifecycle: &mut Lifecycle) {
        if let Some(handle) = slot.take() {
            if handle.request(|reply| Command::Shutdown { reply }).await.is_err() {
                log::warn!("Actor for {planning_id} was already stopped");
            }
        }
        if let Some(task) = lifecycle.task.take() {
            if let Err(e) = task.await {
                log::error!("Actor for {planning_id} panicked: {e}");
            }
        }
        self.retire(planning_id, slot, lifecycle).await;
    }

    async fn retire(&self, planning_id: PlanningId, slot: &Arc<DocumentSlot>, lifecycle: &mut Lifecycle) {
        lifecycle.retired = true;
        let mut documents = self.documents.lock().await;
        if documents.get(&planning_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            documents.remove(&planning_id);
        }
    }

    /// Leave a planning. The last participant out flushes and closes it.
    pub async fn leave(&self, planning_id: PlanningId, user_id: UserId) -> Result<()> {
        let slot = self.existing_slot(planning_id).await.ok_or(CollabError::NotOpen(planning_id))?;
        let mut lifecycle = slot.lifecycle.lock().await;
        let handle = match slot.current() {
            Some(handle) if !lifecycle.retired => handle,
            _ => return Err(CollabError::NotOpen(planning_id)),
        };

        let now_empty = handle.request(|reply| Command::Leave { user_id, reply }).await??;
        if now_empty {
            self.close(planning_id, &slot, &mut lifecycle).await;
        }
        Ok(())
    }

    async fn handle(&self, planning_id: PlanningId) -> Result<DocumentHandle> {
        let slot = self.existing_slot(planning_id).await.ok_or(CollabError::NotOpen(planning_id))?;
        match slot.current() {
            Some(handle) if handle.is_closed() => Err(CollabError::ActorUnavailable(planning_id)),
            Some(handle) => Ok(handle),
            None => Err(CollabError::NotOpen(planning_id)),
        }
    }

    pub async fn is_open(&self, planning_id: PlanningId) -> bool {
        self.existing_slot(planning_id)
            .await
            .is_some_and(|slot| slot.current().is_some())
    }

    pub async fn submit(&self, operation: Operation) -> Result<SubmitReceipt> {
        let handle = self.handle(operation.planning_id).await?;
        handle.request(|reply| Command::Submit { operation, reply }).await?
    }

    pub async fn acquire_lock(&self, planning_id: PlanningId, user_id: UserId, reason: Option<String>) -> Result<LockState> {
        let handle = self.handle(planning_id).await?;
        handle.request(|reply| Command::AcquireLock { user_id, reason, reply }).await?
    }

    /// Release the lock. `Ok(false)` when the planning was not locked.
    pub async fn release_lock(&self, planning_id: PlanningId, user_id: UserId) -> Result<bool> {
        let handle = self.handle(planning_id).await?;
        handle.request(|reply| Command::ReleaseLock { user_id, reply }).await?
    }

    pub async fn update_cursor(
        &self,
        planning_id: PlanningId,
        user_id: UserId,
        field: TextField,
        position: usize,
        selection: Option<SelectionRange>,
    ) -> Result<()> {
        let handle = self.handle(planning_id).await?;
        handle
            .request(|reply| Command::UpdateCursor { user_id, field, position, selection, reply })
            .await?
    }

    /// Record that `user_id` has integrated everything up to `version`.
    pub async fn acknowledge(&self, planning_id: PlanningId, user_id: UserId, version: u64) -> Result<()> {
        let handle = self.handle(planning_id).await?;
        handle.request(|reply| Command::Acknowledge { user_id, version, reply }).await?
    }

    pub async fn snapshot(&self, planning_id: PlanningId) -> Result<PlanningSnapshot> {
        let handle = self.handle(planning_id).await?;
        handle.request(|reply| Command::Snapshot { since: None, reply }).await?
    }

    /// Snapshot plus every operation after `since`, for reconnecting clients.
    pub async fn resync(&self, planning_id: PlanningId, since: u64) -> Result<PlanningSnapshot> {
        let handle = self.handle(planning_id).await?;
        handle.request(|reply| Command::Snapshot { since: Some(since), reply }).await?
    }

    /// Unresolved conflicts. Closed plannings are read from storage.
    pub async fn conflicts(&self, planning_id: PlanningId) -> Result<Vec<PlanningConflict>> {
        match self.handle(planning_id).await {
            Ok(handle) => handle.request(|reply| Command::Conflicts { unresolved_only: true, reply }).await?,
            Err(CollabError::NotOpen(_)) => {
                let all = blocking(&self.store, move |s| s.list_conflicts(planning_id))
                    .await
                    .map_err(|e| store_error(planning_id, e))?;
                Ok(all.into_iter().filter(|c| !c.resolved).collect())
            }
            Err(e) => Err(e),
        }
    }

    /// Every conflict of an open planning, resolved ones included.
    pub async fn conflict_history(&self, planning_id: PlanningId) -> Result<Vec<PlanningConflict>> {
        let handle = self.handle(planning_id).await?;
        handle.request(|reply| Command::Conflicts { unresolved_only: false, reply }).await?
    }

    pub async fn resolve_conflict(
        &self,
        planning_id: PlanningId,
        conflict_id: Uuid,
        user_id: UserId,
        note: impl Into<String>,
    ) -> Result<PlanningConflict> {
        let handle = self.handle(planning_id).await?;
        let note = note.into();
        handle
            .request(|reply| Command::ResolveConflict { conflict_id, user_id, note, reply })
            .await?
    }

    /// Save now instead of waiting for the debounce.
    pub async fn flush(&self, planning_id: PlanningId) -> Result<()> {
        let handle = self.handle(planning_id).await?;
        handle.request(|reply| Command::Flush { reply }).await
    }

    pub async fn stats(&self) -> RegistryStats {
        let slots: Vec<Arc<DocumentSlot>> = self.documents.lock().await.values().cloned().collect();
        let handles: Vec<DocumentHandle> = slots.iter().filter_map(|slot| slot.current()).collect();
        let mut stats = RegistryStats { open_plannings: handles.len(), ..RegistryStats::default() };
        for handle in handles {
            if let Ok(doc) = handle.request(|reply| Command::Stats { reply }).await {
                stats.participants += doc.participants;
                stats.documents.push(doc);
            }
        }
        stats
    }

    /// Flush and stop every open planning, all at once.
    pub async fn shutdown(&self) {
        let slots: Vec<(PlanningId, Arc<DocumentSlot>)> =
            self.documents.lock().await.iter().map(|(id, slot)| (*id, slot.clone())).collect();
        log::info!("Shutting down {} open plannings", slots.len());

        join_all(slots.iter().map(|(planning_id, slot)| async move {
            let mut lifecycle = slot.lifecycle.lock().await;
            if !lifecycle.retired {
                self.close(*planning_id, slot, &mut lifecycle).await;
            }
        }))
        .await;
    }
}
