//! Document actor: the single owner of one open planning.
//!
//! Every command for a planning goes through one bounded queue and is
//! handled to completion before the next, so the pipeline below never races
//! with itself:
//!
//! ```text
//! submit ─► validate ─► dedupe ─► permission ─► lock ─► base version
//!                                                           │
//!   persist ◄─ broadcast ◄─ log ◄─ apply ◄─ clamp ◄─ fold ◄─┘
//! ```
//!
//! Publishing and saving happen on their own tasks; the actor only enqueues.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::events::{
    self, ConflictRecorded, CursorMoved, LockChanged, OperationApplied, ParticipantJoined, ParticipantLeft,
    SaveStatusChanged,
};
use super::window::TransformWindow;
use super::persistence::{self, Feedback, PersistMessage, PersistenceHandle};
use super::{DocumentStats, PlanningSnapshot, SubmitReceipt};
use crate::config::CollabConfig;
use crate::conflict::{ConflictKind, ConflictLog, PlanningConflict};
use crate::error::{CollabError, Result};
use crate::identity::CurrentUser;
use crate::model::{now_millis, Planning, PlanningId, UserId};
use crate::operation::{AttributeOp, Operation, OperationKind, TextField};
use crate::reducer::{self, field_len};
use crate::session::{
    CollaboratorCursor, CursorCoalescer, CursorColor, CursorDecision, LockState, PlanningSession, SelectionRange,
};
use crate::storage::{PlanningStore, StoredPlanning};
use crate::transform::transform_against;
use crate::transport::{planning_channel, EventType, RealtimeEvent, Transport};

type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum Command {
    Submit { operation: Operation, reply: Reply<SubmitReceipt> },
    Join { user: CurrentUser, reply: Reply<PlanningSnapshot> },
    /// Replies whether the session is now empty.
    Leave { user_id: UserId, reply: Reply<bool> },
    AcquireLock { user_id: UserId, reason: Option<String>, reply: Reply<LockState> },
    ReleaseLock { user_id: UserId, reply: Reply<bool> },
    UpdateCursor {
        user_id: UserId,
        field: TextField,
        position: usize,
        selection: Option<SelectionRange>,
        reply: Reply<()>,
    },
    /// Fired by a cursor timer when a coalescing window closes.
    FlushCursor { user_id: UserId },
    Acknowledge { user_id: UserId, version: u64, reply: Reply<()> },
    Snapshot { since: Option<u64>, reply: Reply<PlanningSnapshot> },
    Conflicts { unresolved_only: bool, reply: Reply<Vec<PlanningConflict>> },
    ResolveConflict { conflict_id: Uuid, user_id: UserId, note: String, reply: Reply<PlanningConflict> },
    Stats { reply: oneshot::Sender<DocumentStats> },
    Flush { reply: oneshot::Sender<()> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Registry-side handle to a running actor.
#[derive(Clone)]
pub(crate) struct DocumentHandle {
    planning_id: PlanningId,
    tx: mpsc::Sender<Command>,
}

impl DocumentHandle {
    /// Send a command and wait for its reply.
    pub async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CollabError::ActorUnavailable(self.planning_id))?;
        rx.await.map_err(|_| CollabError::ActorUnavailable(self.planning_id))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub(crate) struct DocumentActor {
    planning: Planning,
    session: PlanningSession,
    window: TransformWindow,
    conflicts: ConflictLog,
    coalescer: CursorCoalescer,
    cursor_timers: HashMap<UserId, JoinHandle<()>>,
    /// Last version confirmed in storage
    saved_version: u64,
    config: CollabConfig,
    commands: mpsc::Receiver<Command>,
    self_tx: mpsc::WeakSender<Command>,
    feedback: mpsc::Receiver<Feedback>,
    persistence: Option<PersistenceHandle>,
    events: Option<mpsc::Sender<RealtimeEvent>>,
    pump: Option<JoinHandle<()>>,
}

impl DocumentActor {
    /// Load state into a new actor and start it. Operations that reached the
    /// log but not the saved document are replayed first.
    pub fn spawn(
        stored: StoredPlanning,
        conflicts: Vec<PlanningConflict>,
        store: Arc<dyn PlanningStore>,
        transport: Arc<dyn Transport>,
        config: CollabConfig,
    ) -> (DocumentHandle, JoinHandle<()>) {
        let saved_version = stored.planning.version;
        let mut replay: Vec<Operation> = stored.operations_after(saved_version).cloned().collect();
        replay.sort_by_key(|op| op.seq);

        let StoredPlanning { planning, operations } = stored;
        let planning_id = planning.id;
        let mut current = planning;
        let mut replayed = Vec::new();
        for op in replay {
            if op.seq != current.version + 1 {
                log::warn!("Stopping replay of {planning_id} at gap before seq {}", op.seq);
                break;
            }
            current = reducer::apply(current, &op);
            replayed.push(op);
        }
        if !replayed.is_empty() {
            log::info!("Replayed {} unsaved operations for {planning_id}", replayed.len());
        }

        let (tx, commands) = mpsc::channel(config.command_capacity.max(1));
        let (feedback_tx, feedback) = mpsc::channel(16);
        let persistence = persistence::spawn(planning_id, saved_version, store, config.clone(), feedback_tx);
        for op in &replayed {
            let _ = persistence.tx.send(PersistMessage::Applied { planning: current.clone(), operation: op.clone() });
        }
        let (events, pump) = events::spawn_pump(transport, planning_channel(planning_id), config.command_capacity * 4);

        let mut session = PlanningSession::new(planning_id, current.version);
        if !replayed.is_empty() {
            session.mark_applied(current.version);
        }

        let actor = DocumentActor {
            window: TransformWindow::from_stored(&operations, current.version),
            planning: current,
            session,
            conflicts: ConflictLog::from_existing(conflicts),
            coalescer: CursorCoalescer::new(config.cursor_interval),
            cursor_timers: HashMap::new(),
            saved_version,
            config,
            commands,
            self_tx: tx.downgrade(),
            feedback,
            persistence: Some(persistence),
            events: Some(events),
            pump: Some(pump),
        };

        let task = tokio::spawn(actor.run());
        (DocumentHandle { planning_id, tx }, task)
    }

    async fn run(mut self) {
        log::info!("Opened planning {} at version {}", self.planning.id, self.planning.version);
        let mut shutdown_reply = None;

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                Some(feedback) = self.feedback.recv() => self.on_feedback(feedback).await,
            }
        }

        self.teardown().await;
        log::info!("Closed planning {} at version {}", self.planning.id, self.planning.version);
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { operation, reply } => {
                let result = self.submit(operation).await;
                let _ = reply.send(result);
            }
            Command::Join { user, reply } => {
                let result = self.join(user).await;
                let _ = reply.send(result);
            }
            Command::Leave { user_id, reply } => {
                let result = self.leave(user_id).await;
                let _ = reply.send(result);
            }
            Command::AcquireLock { user_id, reason, reply } => {
                let result = self.acquire_lock(user_id, reason).await;
                let _ = reply.send(result);
            }
            Command::ReleaseLock { user_id, reply } => {
                let result = self.release_lock(user_id).await;
                let _ = reply.send(result);
            }
            Command::UpdateCursor { user_id, field, position, selection, reply } => {
                let result = self.update_cursor(user_id, field, position, selection).await;
                let _ = reply.send(result);
            }
            Command::FlushCursor { user_id } => self.flush_cursor(user_id).await,
            Command::Acknowledge { user_id, version, reply } => {
                let result = self.acknowledge(user_id, version);
                let _ = reply.send(result);
            }
            Command::Snapshot { since, reply } => {
                let _ = reply.send(Ok(self.snapshot(since)));
            }
            Command::Conflicts { unresolved_only, reply } => {
                let conflicts = if unresolved_only {
                    self.conflicts.unresolved().into_iter().cloned().collect()
                } else {
                    self.conflicts.all().to_vec()
                };
                let _ = reply.send(Ok(conflicts));
            }
            Command::ResolveConflict { conflict_id, user_id, note, reply } => {
                let result = self.resolve_conflict(conflict_id, user_id, note).await;
                let _ = reply.send(result);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Flush { reply } => match &self.persistence {
                Some(p) => {
                    if let Err(mpsc::error::SendError(PersistMessage::Flush { reply })) =
                        p.tx.send(PersistMessage::Flush { reply })
                    {
                        let _ = reply.send(());
                    }
                }
                None => {
                    let _ = reply.send(());
                }
            },
            Command::Shutdown { reply } => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    // ─── Operation pipeline ───────────────────────────────────────────

    async fn submit(&mut self, operation: Operation) -> Result<SubmitReceipt> {
        operation.validate()?;
        if operation.planning_id != self.planning.id {
            return Err(CollabError::Validation(format!(
                "operation {} targets planning {}, not {}",
                operation.id, operation.planning_id, self.planning.id
            )));
        }

        if let Some(seq) = self.window.seq_of(operation.id) {
            log::debug!("Duplicate operation {} (seq {seq}) on {}", operation.id, self.planning.id);
            let accepted = self.window.get(operation.id).cloned().unwrap_or_else(|| {
                let mut op = operation;
                op.seq = seq;
                op
            });
            return Ok(SubmitReceipt {
                operation: accepted,
                version: self.planning.version,
                duplicate: true,
                conflicts: Vec::new(),
            });
        }

        self.check_permission(&operation).await?;
        self.session.check_lock(operation.author)?;

        let current = self.planning.version;
        if operation.base_version > current {
            return Err(CollabError::Validation(format!(
                "operation {} is based on version {} but planning {} is at {current}",
                operation.id, operation.base_version, self.planning.id
            )));
        }
        if !self.window.covers(operation.base_version) {
            return Err(CollabError::VersionMismatch { base: operation.base_version, oldest: self.window.floor() });
        }

        let author = operation.author;
        let base = operation.base_version;
        let (accepted, conflicts) = self.integrate(operation).await?;

        self.session.touch(author, now_millis());
        self.session.acknowledge(author, base);
        self.trim_window();

        Ok(SubmitReceipt { operation: accepted, version: self.planning.version, duplicate: false, conflicts })
    }

    /// Fold, clamp, apply, log, broadcast and persist one operation that
    /// already passed the gatekeeping checks.
    async fn integrate(&mut self, mut operation: Operation) -> Result<(Operation, Vec<PlanningConflict>)> {
        let incoming = operation.clone();
        operation.seq = self.planning.version + 1;

        let (mut rebased, ambiguities) = transform_against(&operation, self.window.since(operation.base_version));
        if let Some(field) = rebased.kind.field() {
            rebased.clamp_to(field_len(&self.planning, field));
        }
        self.check_targets(&rebased)?;

        self.planning = reducer::apply(self.planning.clone(), &rebased);
        let version = self.planning.version;
        debug_assert_eq!(version, rebased.seq);
        self.window.push(rebased.clone());
        self.session.mark_applied(version);

        log::debug!(
            "Applied {} {} by {} to {} at version {version}",
            rebased.kind.name(),
            rebased.id,
            rebased.author,
            self.planning.id
        );

        let applied = OperationApplied { operation: rebased.clone(), version };
        self.emit(EventType::OperationApplied, rebased.author, &applied).await;
        self.persist(PersistMessage::Applied { planning: self.planning.clone(), operation: rebased.clone() });

        let mut conflicts = Vec::new();
        for (other_id, ambiguity) in ambiguities {
            let Some(other) = self.window.get(other_id).cloned() else {
                continue;
            };
            let conflict = PlanningConflict::from_ambiguity(self.planning.id, &ambiguity, incoming.clone(), other);
            conflicts.push(self.record_conflict(conflict).await);
        }

        Ok((rebased, conflicts))
    }

    async fn check_permission(&mut self, operation: &Operation) -> Result<()> {
        match self.planning.role_of(operation.author) {
            Some(role) if role.can_edit() => Ok(()),
            role => {
                let description = match role {
                    Some(role) => format!("user {} with role {role:?} tried to edit", operation.author),
                    None => format!("user {} is not a collaborator", operation.author),
                };
                let conflict = PlanningConflict::new(
                    self.planning.id,
                    ConflictKind::PermissionDenied,
                    vec![operation.clone()],
                    description,
                );
                self.record_conflict(conflict).await;
                Err(CollabError::PermissionDenied { planning_id: self.planning.id, user_id: operation.author })
            }
        }
    }

    /// Attribute operations must reference tasks that exist, unless the task
    /// was removed by an operation the author had not seen yet.
    fn check_targets(&self, operation: &Operation) -> Result<()> {
        let OperationKind::Attribute { change } = &operation.kind else {
            return Ok(());
        };
        match change {
            AttributeOp::TaskAdded { task } if self.planning.has_task(task.id) => Err(CollabError::Validation(
                format!("task {} already exists in planning {}", task.id, self.planning.id),
            )),
            AttributeOp::TaskUpdated { task_id, .. }
            | AttributeOp::TaskDeleted { task_id }
            | AttributeOp::CommentAdded { task_id, .. }
                if !self.planning.has_task(*task_id) =>
            {
                let deleted_concurrently = self.window.since(operation.base_version).any(|op| {
                    matches!(
                        &op.kind,
                        OperationKind::Attribute { change: AttributeOp::TaskDeleted { task_id: t } } if t == task_id
                    )
                });
                if deleted_concurrently {
                    Ok(())
                } else {
                    Err(CollabError::Validation(format!(
                        "task {task_id} does not exist in planning {}",
                        self.planning.id
                    )))
                }
            }
            _ => Ok(()),
        }
    }

    /// Drop window entries every participant has integrated and storage has
    /// caught up with, within the hard cap.
    fn trim_window(&mut self) {
        let acknowledged = self.session.min_acknowledged().unwrap_or(self.planning.version);
        self.window.trim(acknowledged.min(self.saved_version), self.config.transform_window_cap);
    }

    // ─── Session ──────────────────────────────────────────────────────

    async fn join(&mut self, user: CurrentUser) -> Result<PlanningSnapshot> {
        let role = self.planning.role_of(user.user_id).ok_or(CollabError::PermissionDenied {
            planning_id: self.planning.id,
            user_id: user.user_id,
        })?;
        let participant = self.session.join(user.user_id, &user.user_name, role, now_millis()).clone();
        log::info!("{} ({}) joined planning {} as {role:?}", user.user_name, user.user_id, self.planning.id);

        self.emit(EventType::ParticipantJoined, user.user_id, &ParticipantJoined { participant }).await;
        Ok(self.snapshot(None))
    }

    async fn leave(&mut self, user_id: UserId) -> Result<bool> {
        let (removed, released) = self.session.leave(user_id);
        if removed.is_none() {
            return Err(CollabError::NotParticipant { planning_id: self.planning.id, user_id });
        }
        if let Some(timer) = self.cursor_timers.remove(&user_id) {
            timer.abort();
        }
        self.coalescer.forget(user_id);
        log::info!("{user_id} left planning {}", self.planning.id);

        self.emit(EventType::ParticipantLeft, user_id, &ParticipantLeft { user_id }).await;
        if released {
            log::info!("Lock on {} released because its holder left", self.planning.id);
            let lock = LockChanged { lock: self.session.lock.clone() };
            self.emit(EventType::LockChanged, user_id, &lock).await;
        }
        self.trim_window();
        Ok(self.session.is_empty())
    }

    fn require_participant(&self, user_id: UserId) -> Result<()> {
        match self.session.participant(user_id) {
            Some(_) => Ok(()),
            None => Err(CollabError::NotParticipant { planning_id: self.planning.id, user_id }),
        }
    }

    async fn acquire_lock(&mut self, user_id: UserId, reason: Option<String>) -> Result<LockState> {
        self.require_participant(user_id)?;
        let lock = self.session.acquire_lock(user_id, reason, now_millis())?.clone();
        log::info!("{user_id} locked planning {} ({:?})", self.planning.id, lock.reason);
        self.emit(EventType::LockChanged, user_id, &LockChanged { lock: lock.clone() }).await;
        Ok(lock)
    }

    async fn release_lock(&mut self, user_id: UserId) -> Result<bool> {
        let released = self.session.release_lock(user_id)?;
        if released {
            log::info!("{user_id} released the lock on {}", self.planning.id);
            let lock = LockChanged { lock: self.session.lock.clone() };
            self.emit(EventType::LockChanged, user_id, &lock).await;
        }
        Ok(released)
    }

    async fn update_cursor(
        &mut self,
        user_id: UserId,
        field: TextField,
        position: usize,
        selection: Option<SelectionRange>,
    ) -> Result<()> {
        let len = field_len(&self.planning, field);
        let selection = selection.map(|s| {
            let start = s.start.min(len);
            SelectionRange { start, end: s.end.clamp(start, len) }
        });
        let cursor = CollaboratorCursor {
            user_id,
            field,
            position: position.min(len),
            selection,
            color: CursorColor::from_uuid(user_id),
            timestamp: now_millis(),
        };
        self.session.update_cursor(cursor.clone())?;

        match self.coalescer.offer(cursor.clone(), Instant::now()) {
            CursorDecision::Send => self.emit(EventType::CursorMoved, user_id, &CursorMoved { cursor }).await,
            CursorDecision::Deferred { wait, schedule: true } => self.arm_cursor_timer(user_id, wait),
            CursorDecision::Deferred { .. } => {}
        }
        Ok(())
    }

    fn arm_cursor_timer(&mut self, user_id: UserId, wait: Duration) {
        let tx = self.self_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::FlushCursor { user_id }).await;
            }
        });
        if let Some(previous) = self.cursor_timers.insert(user_id, timer) {
            previous.abort();
        }
    }

    async fn flush_cursor(&mut self, user_id: UserId) {
        self.cursor_timers.remove(&user_id);
        if let Some(cursor) = self.coalescer.take_pending(user_id, Instant::now()) {
            self.emit(EventType::CursorMoved, user_id, &CursorMoved { cursor }).await;
        }
    }

    fn acknowledge(&mut self, user_id: UserId, version: u64) -> Result<()> {
        self.require_participant(user_id)?;
        self.session.acknowledge(user_id, version);
        self.trim_window();
        Ok(())
    }

    fn snapshot(&self, since: Option<u64>) -> PlanningSnapshot {
        let version = self.planning.version;
        let since = since.unwrap_or(version);
        let replayable = since <= version && self.window.covers(since);
        let operations = if replayable { self.window.since(since).cloned().collect() } else { Vec::new() };
        PlanningSnapshot {
            planning: self.planning.clone(),
            session: self.session.clone(),
            operations,
            requires_reset: !replayable,
            unresolved_conflicts: self.conflicts.unresolved().into_iter().cloned().collect(),
        }
    }

    fn stats(&self) -> DocumentStats {
        DocumentStats {
            planning_id: self.planning.id,
            version: self.planning.version,
            participants: self.session.participants.len(),
            window_len: self.window.len(),
            window_floor: self.window.floor(),
            unresolved_conflicts: self.conflicts.unresolved().len(),
            save_status: self.session.save_status,
            has_unsaved_changes: self.session.has_unsaved_changes,
        }
    }

    // ─── Conflicts ────────────────────────────────────────────────────

    async fn record_conflict(&mut self, conflict: PlanningConflict) -> PlanningConflict {
        let recorded = self.conflicts.record(conflict).clone();
        self.publish_conflict(&recorded).await;
        recorded
    }

    async fn publish_conflict(&mut self, conflict: &PlanningConflict) {
        let payload = ConflictRecorded { conflict: conflict.clone() };
        self.emit(EventType::ConflictRecorded, Uuid::nil(), &payload).await;
        self.persist(PersistMessage::Conflict(conflict.clone()));
    }

    async fn resolve_conflict(&mut self, conflict_id: Uuid, user_id: UserId, note: String) -> Result<PlanningConflict> {
        match self.planning.role_of(user_id) {
            Some(role) if role.can_edit() => {}
            _ => return Err(CollabError::PermissionDenied { planning_id: self.planning.id, user_id }),
        }
        let resolved = self
            .conflicts
            .resolve(conflict_id, user_id, note)
            .cloned()
            .ok_or_else(|| CollabError::Validation(format!("unknown conflict {conflict_id}")))?;
        log::info!("{user_id} resolved conflict {conflict_id} on {}", self.planning.id);
        self.publish_conflict(&resolved).await;
        Ok(resolved)
    }

    // ─── Persistence feedback ─────────────────────────────────────────

    async fn on_feedback(&mut self, feedback: Feedback) {
        match feedback {
            Feedback::Status { status, saved_version } => {
                match saved_version {
                    Some(version) => {
                        self.saved_version = self.saved_version.max(version);
                        self.session.mark_saved(version, now_millis());
                        self.trim_window();
                    }
                    None => self.session.save_status = status,
                }
                let payload = SaveStatusChanged {
                    status: self.session.save_status,
                    has_unsaved_changes: self.session.has_unsaved_changes,
                    last_saved: self.session.last_saved,
                };
                self.emit(EventType::SaveStatusChanged, Uuid::nil(), &payload).await;
            }
            Feedback::Reconcile { stored, reply } => {
                let merged = self.reconcile(stored).await;
                let _ = reply.send(merged);
            }
        }
    }

    /// Fold operations that another writer stored into this session, then
    /// hand back the merged document for saving.
    async fn reconcile(&mut self, stored: StoredPlanning) -> Planning {
        let foreign: Vec<Operation> = stored
            .operations
            .iter()
            .filter(|op| self.window.seq_of(op.id).is_none())
            .cloned()
            .collect();

        let mut merged = 0;
        for op in &foreign {
            let mut op = op.clone();
            op.seq = 0;
            op.base_version = op.base_version.clamp(self.window.floor(), self.planning.version);
            match self.integrate(op).await {
                Ok(_) => merged += 1,
                Err(e) => log::warn!("Skipped foreign operation during reconcile of {}: {e}", self.planning.id),
            }
        }

        let description = format!(
            "stored copy was at version {} while this session expected {}",
            stored.planning.version, self.saved_version
        );
        let conflict = PlanningConflict::new(self.planning.id, ConflictKind::VersionMismatch, foreign, description)
            .auto_resolved(format!("merged {merged} foreign operations"));
        self.record_conflict(conflict).await;
        log::info!("Reconciled {} with {merged} foreign operations", self.planning.id);

        self.planning.clone()
    }

    // ─── Plumbing ─────────────────────────────────────────────────────

    async fn emit<T: Serialize>(&self, event_type: EventType, user_id: UserId, payload: &T) {
        let Some(events) = &self.events else {
            return;
        };
        if let Some(event) = events::build(event_type, user_id, payload) {
            if events.send(event).await.is_err() {
                log::warn!("Event pump for {} is gone, dropped {event_type:?}", self.planning.id);
            }
        }
    }

    fn persist(&self, message: PersistMessage) {
        if let Some(p) = &self.persistence {
            if p.tx.send(message).is_err() {
                log::error!("Persistence publisher for {} is gone", self.planning.id);
            }
        }
    }

    async fn teardown(&mut self) {
        for (_, timer) in self.cursor_timers.drain() {
            timer.abort();
        }

        if let Some(PersistenceHandle { tx, task }) = self.persistence.take() {
            drop(tx);
            // Keep answering the publisher until its final save is done.
            while let Some(feedback) = self.feedback.recv().await {
                self.on_feedback(feedback).await;
            }
            if let Err(e) = task.await {
                log::error!("Persistence publisher for {} panicked: {e}", self.planning.id);
            }
        }

        self.events = None;
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
    }
}
