//! Error taxonomy for the collaboration engine.
//!
//! Transform ambiguities have no variant here: they are recorded in the
//! conflict log and never surface as an `Err`.

use thiserror::Error;
use uuid::Uuid;

use crate::storage::StoreError;
use crate::transport::TransportError;

#[derive(Debug, Clone, Error)]
pub enum CollabError {
    /// Malformed operation, rejected before it touches any state.
    #[error("Invalid operation: {0}")]
    Validation(String),

    /// The document is locked by somebody else.
    #[error("Planning {planning_id} is locked by {locked_by}")]
    LockConflict {
        planning_id: Uuid,
        locked_by: Uuid,
        reason: Option<String>,
    },

    /// The operation was based on a version that is no longer transformable.
    /// The client has to resync from a snapshot.
    #[error("Version mismatch: based on {base}, oldest transformable is {oldest}")]
    VersionMismatch { base: u64, oldest: u64 },

    #[error("User {user_id} may not edit planning {planning_id}")]
    PermissionDenied { planning_id: Uuid, user_id: Uuid },

    #[error("Planning not found: {0}")]
    DocumentNotFound(Uuid),

    /// No session is open for this planning.
    #[error("Planning {0} has no open session")]
    NotOpen(Uuid),

    #[error("User {user_id} has not joined planning {planning_id}")]
    NotParticipant { planning_id: Uuid, user_id: Uuid },

    /// The document actor stopped before answering.
    #[error("Document actor for {0} is unavailable")]
    ActorUnavailable(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T, E = CollabError> = std::result::Result<T, E>;
