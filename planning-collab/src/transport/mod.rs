//! Transport collaborator: publish/subscribe of realtime events.
//!
//! The engine only depends on the [`Transport`] trait. Delivery is
//! at-least-once and unordered across channels; within one channel a single
//! publisher's events arrive in publish order.
//!
//! [`LocalTransport`] is the in-process implementation used by the
//! WebSocket server and the tests.

pub mod broadcast;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::{now_millis, PlanningId, UserId};

pub use broadcast::{LocalTransport, TransportStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OperationApplied,
    ParticipantJoined,
    ParticipantLeft,
    CursorMoved,
    LockChanged,
    ConflictRecorded,
    SaveStatusChanged,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::OperationApplied,
        EventType::ParticipantJoined,
        EventType::ParticipantLeft,
        EventType::CursorMoved,
        EventType::LockChanged,
        EventType::ConflictRecorded,
        EventType::SaveStatusChanged,
    ];
}

/// Event delivered to subscribers of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: u64,
    /// Originating user; nil for events raised by the engine itself.
    pub user_id: UserId,
    pub data: serde_json::Value,
}

impl RealtimeEvent {
    pub fn new<T: Serialize>(event_type: EventType, user_id: UserId, data: &T) -> Result<Self, TransportError> {
        let data = serde_json::to_value(data).map_err(|e| TransportError::Encode(e.to_string()))?;
        Ok(Self { event_type, timestamp: now_millis(), user_id, data })
    }

    /// Decode the payload into a concrete type.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_value(self.data.clone()).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// Channel name for a planning document.
pub fn planning_channel(planning_id: PlanningId) -> String {
    format!("planning:{planning_id}")
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Failed to encode event: {0}")]
    Encode(String),
    #[error("Failed to decode event: {0}")]
    Decode(String),
    #[error("Channel closed: {0}")]
    Closed(String),
}

/// A live subscription. Dropping it (or calling [`Subscription::unsubscribe`])
/// ends it; the publisher prunes the closed receiver on its next publish.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    channel: String,
    receiver: mpsc::Receiver<Arc<RealtimeEvent>>,
}

impl Subscription {
    pub(crate) fn new(id: Uuid, channel: String, receiver: mpsc::Receiver<Arc<RealtimeEvent>>) -> Self {
        Self { id, channel, receiver }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next event, or `None` once the transport dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<RealtimeEvent>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<RealtimeEvent>> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

/// Pub/sub collaborator used by the engine to fan out events.
pub trait Transport: Send + Sync + 'static {
    /// Subscribe to `event_types` on `channel`. An empty slice means all types.
    fn subscribe(&self, channel: &str, event_types: &[EventType]) -> Subscription;

    /// Publish an event. Resolves with the number of subscribers reached.
    fn publish<'a>(&'a self, channel: &'a str, event: RealtimeEvent) -> BoxFuture<'a, Result<usize, TransportError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_uses_type_key() {
        let event = RealtimeEvent::new(EventType::CursorMoved, Uuid::nil(), &serde_json::json!({"position": 3})).unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "cursor_moved");
        assert_eq!(json["data"]["position"], 3);
    }

    #[test]
    fn test_payload_decode_error() {
        let event = RealtimeEvent::new(EventType::LockChanged, Uuid::nil(), &"not a number").unwrap();
        let decoded: Result<u64, _> = event.payload();
        assert!(matches!(decoded, Err(TransportError::Decode(_))));
    }

    #[test]
    fn test_planning_channel_name() {
        let id = Uuid::nil();
        assert_eq!(planning_channel(id), "planning:00000000-0000-0000-0000-000000000000");
    }
}
