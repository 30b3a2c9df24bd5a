//! # planning-collab: Real-time collaborative editing of funeral plannings
//!
//! Several participants (a family, a funeral director, invited editors) edit
//! the same planning concurrently. Concurrent edits are merged with
//! operational transformation against a server-assigned sequence, so every
//! replica converges without a central lock.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON frames   ┌────────────────┐
//! │ Client      │ ◄─────────────► │ PlanningServer │
//! │ (per user)  │    WebSocket    └───────┬────────┘
//! └─────────────┘                         │
//!                                         ▼
//!                               ┌──────────────────┐
//!                               │ PlanningRegistry │
//!                               └───────┬──────────┘
//!                                       │ one actor per open planning
//!                         ┌─────────────┼──────────────┐
//!                         ▼             ▼              ▼
//!                   transform +    session,       persistence
//!                   reducer        locks, cursors  publisher
//!                         │                            │
//!                         ▼                            ▼
//!                   LocalTransport               PlanningStore
//!                   (fan-out)                    (RocksDB / memory)
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Planning document, tasks, timeline, collaborators
//! - [`operation`]: Operations and their validation
//! - [`transform`]: Pairwise operational transform
//! - [`reducer`]: Pure apply step
//! - [`session`]: Participants, advisory lock, cursors, save status
//! - [`conflict`]: Conflict log
//! - [`engine`]: Registry and per-document actors
//! - [`storage`]: `PlanningStore` trait, RocksDB and in-memory stores
//! - [`transport`]: Publish/subscribe of realtime events
//! - [`protocol`] / [`server`]: WebSocket front-end

pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod identity;
pub mod model;
pub mod operation;
pub mod protocol;
pub mod reducer;
pub mod server;
pub mod session;
pub mod storage;
pub mod transform;
pub mod transport;

// Re-exports for convenience
pub use config::CollabConfig;
pub use conflict::{ConflictKind, ConflictLog, PlanningConflict, Resolution};
pub use engine::{DocumentStats, PlanningRegistry, PlanningSnapshot, RegistryStats, SubmitReceipt};
pub use error::{CollabError, Result};
pub use identity::{CurrentUser, UserRole};
pub use model::{
    Collaborator, CollaboratorRole, Planning, PlanningId, PlanningStatus, PlanningTask, TaskPriority,
    TaskStatus, TimelineEntry, UserId,
};
pub use operation::{AttributeOp, Operation, OperationKind, OrderKey, TaskPatch, TextField};
pub use protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage};
pub use reducer::apply;
pub use server::{PlanningServer, ServerConfig, ServerStats};
pub use session::{CollaboratorCursor, LockState, Participant, PlanningSession, SaveStatus, SelectionRange};
pub use storage::{MemoryStore, PlanningStore, RocksStore, StoreConfig, StoreError, StoredPlanning};
pub use transform::{transform, Ambiguity};
pub use transport::{EventType, LocalTransport, RealtimeEvent, Subscription, Transport, TransportError};
