//! Conflict log: operation pairs that merged deterministically but need a
//! human to look at them.
//!
//! Recording never fails and never blocks the pipeline. Ambiguity conflicts
//! stay open until somebody resolves them; conflicts repaired by the
//! persistence reconciler are recorded already resolved, for audit.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{now_millis, PlanningId, UserId};
use crate::operation::Operation;
use crate::transform::Ambiguity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    ConcurrentEdit,
    VersionMismatch,
    PermissionDenied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved_by: Option<UserId>,
    pub resolved_at: u64,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanningConflict {
    pub id: Uuid,
    pub planning_id: PlanningId,
    pub operations: Vec<Operation>,
    pub kind: ConflictKind,
    pub description: String,
    pub detected_at: u64,
    pub resolved: bool,
    pub resolution: Option<Resolution>,
}

impl PlanningConflict {
    pub fn new(planning_id: PlanningId, kind: ConflictKind, operations: Vec<Operation>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            planning_id,
            operations,
            kind,
            description: description.into(),
            detected_at: now_millis(),
            resolved: false,
            resolution: None,
        }
    }

    /// A concurrent-edit conflict from a transform ambiguity.
    pub fn from_ambiguity(planning_id: PlanningId, ambiguity: &Ambiguity, incoming: Operation, applied: Operation) -> Self {
        Self::new(planning_id, ConflictKind::ConcurrentEdit, vec![incoming, applied], ambiguity.description())
    }

    fn resolve_with(&mut self, resolved_by: Option<UserId>, note: impl Into<String>) {
        self.resolved = true;
        self.resolution = Some(Resolution { resolved_by, resolved_at: now_millis(), note: note.into() });
    }

    /// Mark as resolved by the system itself.
    pub fn auto_resolved(mut self, note: impl Into<String>) -> Self {
        self.resolve_with(None, note);
        self
    }
}

/// In-memory conflict list for one planning.
#[derive(Debug, Default, Clone)]
pub struct ConflictLog {
    conflicts: Vec<PlanningConflict>,
}

impl ConflictLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_existing(conflicts: Vec<PlanningConflict>) -> Self {
        Self { conflicts }
    }

    pub fn record(&mut self, conflict: PlanningConflict) -> &PlanningConflict {
        log::warn!(
            "{:?} conflict {} on planning {}: {}",
            conflict.kind,
            conflict.id,
            conflict.planning_id,
            conflict.description
        );
        self.conflicts.push(conflict);
        &self.conflicts[self.conflicts.len() - 1]
    }

    pub fn unresolved(&self) -> Vec<&PlanningConflict> {
        self.conflicts.iter().filter(|c| !c.resolved).collect()
    }

    pub fn all(&self) -> &[PlanningConflict] {
        &self.conflicts
    }

    pub fn get(&self, id: Uuid) -> Option<&PlanningConflict> {
        self.conflicts.iter().find(|c| c.id == id)
    }

    /// Manually resolve a conflict. Returns the updated conflict, or `None`
    /// if the id is unknown. Resolving twice keeps the first resolution.
    pub fn resolve(&mut self, id: Uuid, user_id: UserId, note: impl Into<String>) -> Option<&PlanningConflict> {
        let conflict = self.conflicts.iter_mut().find(|c| c.id == id)?;
        if !conflict.resolved {
            conflict.resolve_with(Some(user_id), note);
        }
        Some(&*conflict)
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }
}
