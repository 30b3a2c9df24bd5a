//! Event payloads and the per-document publishing task.
//!
//! The actor never awaits the transport directly. It hands events to a
//! bounded queue drained by one pump task per document, which keeps publish
//! order and applies backpressure only when the pump falls far behind.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::conflict::PlanningConflict;
use crate::model::UserId;
use crate::operation::Operation;
use crate::session::{CollaboratorCursor, LockState, Participant, SaveStatus};
use crate::transport::{EventType, RealtimeEvent, Transport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationApplied {
    pub operation: Operation,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantJoined {
    pub participant: Participant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantLeft {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorMoved {
    pub cursor: CollaboratorCursor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockChanged {
    pub lock: LockState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecorded {
    pub conflict: PlanningConflict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveStatusChanged {
    pub status: SaveStatus,
    pub has_unsaved_changes: bool,
    pub last_saved: Option<u64>,
}

/// Build a realtime event, logging instead of failing when the payload
/// cannot be encoded.
pub(crate) fn build<T: Serialize>(event_type: EventType, user_id: UserId, payload: &T) -> Option<RealtimeEvent> {
    match RealtimeEvent::new(event_type, user_id, payload) {
        Ok(event) => Some(event),
        Err(e) => {
            log::error!("Dropping {event_type:?} event: {e}");
            None
        }
    }
}

/// Start the publishing task for one channel.
pub(crate) fn spawn_pump(
    transport: Arc<dyn Transport>,
    channel: String,
    capacity: usize,
) -> (mpsc::Sender<RealtimeEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<RealtimeEvent>(capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let event_type = event.event_type;
            match transport.publish(&channel, event).await {
                Ok(reached) => log::trace!("{event_type:?} on {channel} reached {reached} subscribers"),
                Err(e) => log::warn!("Publishing {event_type:?} on {channel} failed: {e}"),
            }
        }
        log::debug!("Event pump for {channel} stopped");
    });
    (tx, handle)
}
