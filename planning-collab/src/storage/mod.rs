//! Durable storage for plannings, their operation log and conflicts.
//!
//! ```text
//! ┌───────────────┐  save / append   ┌──────────────────┐
//! │ Persistence   │ ───────────────► │ PlanningStore    │
//! │ publisher     │ ◄─────────────── │ (Memory | Rocks) │
//! └───────────────┘  get (on join /  └────────┬─────────┘
//!                    reconcile)               │
//!                                             ▼
//!                     CF "plannings": latest saved document
//!                     CF "operations": append-only operation log
//!                     CF "conflicts": conflict records
//!                     CF "metadata": counters and op-id index
//! ```
//!
//! The trait is synchronous. The engine calls it from `spawn_blocking` so a
//! slow disk never stalls a document actor.

pub mod memory;
pub mod rocks;

use thiserror::Error;
use uuid::Uuid;

use crate::conflict::PlanningConflict;
use crate::model::{Planning, PlanningId};
use crate::operation::Operation;

pub use memory::MemoryStore;
pub use rocks::{PlanningMetadata, RocksStore, StoreConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Planning not found: {0}")]
    NotFound(Uuid),
    #[error("Planning already exists: {0}")]
    AlreadyExists(Uuid),
    #[error("Stale write: expected stored version {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    /// Failure injected by [`MemoryStore::fail_next_saves`].
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Errors worth retrying with backoff. Conflicts and missing documents
    /// need a different reaction.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Unavailable(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A planning as it sits in storage: the last saved document plus every
/// operation appended for it, in append order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPlanning {
    pub planning: Planning,
    pub operations: Vec<Operation>,
}

impl StoredPlanning {
    /// Operations whose seq is above `version`.
    pub fn operations_after(&self, version: u64) -> impl Iterator<Item = &Operation> {
        self.operations.iter().filter(move |op| op.seq > version)
    }
}

pub trait PlanningStore: Send + Sync + 'static {
    /// Store a brand new planning. Fails with `AlreadyExists` if the id is taken.
    fn create_planning(&self, planning: &Planning) -> Result<(), StoreError>;

    fn get_planning(&self, id: PlanningId) -> Result<StoredPlanning, StoreError>;

    /// Replace the stored document if its version still equals
    /// `expected_version`; otherwise `VersionConflict`.
    fn save_planning(&self, id: PlanningId, planning: &Planning, expected_version: u64) -> Result<(), StoreError>;

    /// Append to the operation log; returns whether a new entry was added.
    ///
    /// An id already in the log is never appended twice. If it comes back
    /// with a different seq (it was re-sequenced while reconciling with
    /// another writer) the logged copy is replaced in place.
    fn append_operation(&self, id: PlanningId, operation: &Operation) -> Result<bool, StoreError>;

    /// Insert or update a conflict record.
    fn record_conflict(&self, conflict: &PlanningConflict) -> Result<(), StoreError>;

    fn list_conflicts(&self, id: PlanningId) -> Result<Vec<PlanningConflict>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Database("io".into()).is_transient());
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::VersionConflict { expected: 1, actual: 2 }.is_transient());
        assert!(!StoreError::NotFound(Uuid::nil()).is_transient());
    }
}
