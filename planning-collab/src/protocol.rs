//! JSON wire protocol for the WebSocket front-end.
//!
//! Every frame is a text message holding one JSON object with a `type` tag:
//! ```text
//! → {"type":"join","planning_id":"…","user":{"user_id":"…","user_name":"Ana","user_role":"family"}}
//! ← {"type":"joined","snapshot":{…}}
//! → {"type":"submit","operation":{…}}
//! ← {"type":"receipt","receipt":{…}}
//! ← {"type":"event","event":{"type":"operation_applied",…}}
//! ```
//!
//! A connection works on one planning at a time. Messages after `join`
//! address that planning; joining another one leaves the first.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::conflict::PlanningConflict;
use crate::engine::{PlanningSnapshot, RegistryStats, SubmitReceipt};
use crate::error::CollabError;
use crate::identity::CurrentUser;
use crate::model::{Planning, PlanningId};
use crate::operation::{Operation, TextField};
use crate::session::{LockState, SelectionRange};
use crate::storage::StoreError;
use crate::transport::RealtimeEvent;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Decode(String),
    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Create {
        planning: Planning,
    },
    Join {
        planning_id: PlanningId,
        user: CurrentUser,
    },
    Snapshot,
    /// Reconnect after missing events: everything after `since`.
    Resync {
        since: u64,
    },
    Submit {
        operation: Operation,
    },
    Cursor {
        field: TextField,
        position: usize,
        #[serde(default)]
        selection: Option<SelectionRange>,
    },
    Lock {
        #[serde(default)]
        reason: Option<String>,
    },
    Release,
    Acknowledge {
        version: u64,
    },
    Conflicts,
    ResolveConflict {
        conflict_id: Uuid,
        #[serde(default)]
        note: String,
    },
    Leave,
    Stats,
    Ping,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Machine-readable error category carried by [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    LockConflict,
    VersionMismatch,
    PermissionDenied,
    NotFound,
    NotOpen,
    NotJoined,
    Unavailable,
    Storage,
    Transport,
    Protocol,
}

impl From<&CollabError> for ErrorCode {
    fn from(err: &CollabError) -> Self {
        match err {
            CollabError::Validation(_) => ErrorCode::Validation,
            CollabError::LockConflict { .. } => ErrorCode::LockConflict,
            CollabError::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            CollabError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            CollabError::DocumentNotFound(_) | CollabError::Store(StoreError::NotFound(_)) => ErrorCode::NotFound,
            CollabError::NotOpen(_) => ErrorCode::NotOpen,
            CollabError::NotParticipant { .. } => ErrorCode::NotJoined,
            CollabError::ActorUnavailable(_) => ErrorCode::Unavailable,
            CollabError::Store(_) => ErrorCode::Storage,
            CollabError::Transport(_) => ErrorCode::Transport,
        }
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Created {
        planning: Planning,
    },
    Joined {
        snapshot: PlanningSnapshot,
    },
    Snapshot {
        snapshot: PlanningSnapshot,
    },
    Receipt {
        receipt: SubmitReceipt,
    },
    Locked {
        lock: LockState,
    },
    Released {
        released: bool,
    },
    Conflicts {
        conflicts: Vec<PlanningConflict>,
    },
    ConflictResolved {
        conflict: PlanningConflict,
    },
    Left {
        planning_id: PlanningId,
    },
    Stats {
        stats: RegistryStats,
    },
    /// Accepted with nothing to report (cursor, acknowledge).
    Ack,
    /// Realtime event from another participant.
    Event {
        event: RealtimeEvent,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(err: &CollabError) -> Self {
        ServerMessage::Error { code: err.into(), message: err.to_string() }
    }

    pub fn protocol_error(err: &ProtocolError) -> Self {
        ServerMessage::Error { code: ErrorCode::Protocol, message: err.to_string() }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::UserRole;
    use crate::operation::OperationKind;

    #[test]
    fn test_join_frame_shape() {
        let planning_id = Uuid::new_v4();
        let user = CurrentUser::new(Uuid::new_v4(), "Ana", UserRole::Family);
        let text = ClientMessage::Join { planning_id, user: user.clone() }.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["type"], "join");
        assert_eq!(value["user"]["user_role"], "family");
        assert_eq!(ClientMessage::decode(&text).unwrap(), ClientMessage::Join { planning_id, user });
    }

    #[test]
    fn test_submit_carries_operation() {
        let op = Operation::new(Uuid::new_v4(), Uuid::new_v4(), 3, OperationKind::insert(TextField::Title, 0, "urgent "));
        let text = ClientMessage::Submit { operation: op.clone() }.encode().unwrap();
        match ClientMessage::decode(&text).unwrap() {
            ClientMessage::Submit { operation } => assert_eq!(operation, op),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_optional_fields_default() {
        let msg = ClientMessage::decode(r#"{"type":"lock"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Lock { reason: None });

        let msg = ClientMessage::decode(r#"{"type":"cursor","field":"description","position":4}"#).unwrap();
        assert_eq!(msg, ClientMessage::Cursor { field: TextField::Description, position: 4, selection: None });
    }

    #[test]
    fn test_unknown_type_is_decode_error() {
        let err = ClientMessage::decode(r#"{"type":"teleport"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn test_error_codes() {
        let holder = Uuid::new_v4();
        let err = CollabError::LockConflict { planning_id: Uuid::nil(), locked_by: holder, reason: None };
        match ServerMessage::error(&err) {
            ServerMessage::Error { code, message } => {
                assert_eq!(code, ErrorCode::LockConflict);
                assert!(message.contains(&holder.to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }

        let missing = CollabError::Store(StoreError::NotFound(Uuid::nil()));
        assert_eq!(ErrorCode::from(&missing), ErrorCode::NotFound);
        assert_eq!(ErrorCode::from(&CollabError::VersionMismatch { base: 1, oldest: 4 }), ErrorCode::VersionMismatch);
    }

    #[test]
    fn test_server_frame_tag() {
        let text = ServerMessage::Pong.encode().unwrap();
        assert_eq!(text, r#"{"type":"pong"}"#);
        assert_eq!(ServerMessage::decode(&text).unwrap(), ServerMessage::Pong);
    }
}
