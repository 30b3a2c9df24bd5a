//! Operations: the unit of change submitted to a planning.
//!
//! Text operations address a [`TextField`] by character position. Attribute
//! operations carry a structured payload and commute with each other.
//!
//! Every operation gets a server-assigned `seq` when it is accepted. The
//! triple `(seq, author, id)` is the total order used for tie-breaking;
//! wall-clock timestamps are informational only.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{CollabError, Result};
use crate::model::{
    now_millis, PlanningId, PlanningStatus, PlanningTask, TaskComment, TaskId, TaskPriority,
    TaskStatus, TimelineEntry, UserId,
};

/// Text fields of a planning that accept positional operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextField {
    Title,
    Description,
}

/// Partial update of a task. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self { title: Some(title.into()), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.assignee.is_none()
            && self.due_date.is_none()
            && self.priority.is_none()
            && self.status.is_none()
            && self.category.is_none()
    }

    /// Last-writer-wins merge of every set field into `task`.
    pub fn apply_to(&self, task: &mut PlanningTask) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(assignee) = self.assignee {
            task.assignee = Some(assignee);
        }
        if let Some(due) = self.due_date {
            task.due_date = Some(due);
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(category) = &self.category {
            task.category = Some(category.clone());
        }
    }
}

/// Structured, non-positional mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AttributeOp {
    TaskAdded { task: PlanningTask },
    TaskUpdated { task_id: TaskId, patch: TaskPatch },
    TaskDeleted { task_id: TaskId },
    /// Upsert of a timeline entry by id.
    TimelineUpdated { entry: TimelineEntry },
    StatusChanged { status: PlanningStatus },
    CommentAdded { task_id: TaskId, comment: TaskComment },
}

impl AttributeOp {
    /// The task this mutation targets, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            AttributeOp::TaskAdded { task } => Some(task.id),
            AttributeOp::TaskUpdated { task_id, .. }
            | AttributeOp::TaskDeleted { task_id }
            | AttributeOp::CommentAdded { task_id, .. } => Some(*task_id),
            AttributeOp::TimelineUpdated { .. } | AttributeOp::StatusChanged { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AttributeOp::TaskAdded { .. } => "task_added",
            AttributeOp::TaskUpdated { .. } => "task_updated",
            AttributeOp::TaskDeleted { .. } => "task_deleted",
            AttributeOp::TimelineUpdated { .. } => "timeline_updated",
            AttributeOp::StatusChanged { .. } => "status_changed",
            AttributeOp::CommentAdded { .. } => "comment_added",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    Insert {
        field: TextField,
        position: usize,
        text: String,
    },
    Delete {
        field: TextField,
        position: usize,
        length: usize,
    },
    Retain {
        field: TextField,
        length: usize,
    },
    /// Styling over a range. The plain-text model keeps no marks, so this
    /// only travels through transform and the log.
    Format {
        field: TextField,
        position: usize,
        length: usize,
        attributes: BTreeMap<String, String>,
    },
    Attribute {
        change: AttributeOp,
    },
}

impl OperationKind {
    pub fn insert(field: TextField, position: usize, text: impl Into<String>) -> Self {
        OperationKind::Insert { field, position, text: text.into() }
    }

    pub fn delete(field: TextField, position: usize, length: usize) -> Self {
        OperationKind::Delete { field, position, length }
    }

    pub fn attribute(change: AttributeOp) -> Self {
        OperationKind::Attribute { change }
    }

    /// The text field addressed by a positional operation.
    pub fn field(&self) -> Option<TextField> {
        match self {
            OperationKind::Insert { field, .. }
            | OperationKind::Delete { field, .. }
            | OperationKind::Retain { field, .. }
            | OperationKind::Format { field, .. } => Some(*field),
            OperationKind::Attribute { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Insert { .. } => "insert",
            OperationKind::Delete { .. } => "delete",
            OperationKind::Retain { .. } => "retain",
            OperationKind::Format { .. } => "format",
            OperationKind::Attribute { .. } => "attribute",
        }
    }
}

/// Total order over operations: server sequence, then author, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub seq: u64,
    pub author: UserId,
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub planning_id: PlanningId,
    pub author: UserId,
    /// Last planning version the author had integrated.
    pub base_version: u64,
    /// Server-assigned sequence number; 0 until accepted.
    #[serde(default)]
    pub seq: u64,
    /// Author wall-clock time in epoch milliseconds.
    pub timestamp: u64,
    #[serde(flatten)]
    pub kind: OperationKind,
}

impl Operation {
    pub fn new(planning_id: PlanningId, author: UserId, base_version: u64, kind: OperationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            planning_id,
            author,
            base_version,
            seq: 0,
            timestamp: now_millis(),
            kind,
        }
    }

    pub fn order_key(&self) -> OrderKey {
        OrderKey { seq: self.seq, author: self.author, id: self.id }
    }

    /// Structural checks that do not need document state.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(CollabError::Validation(format!("{} {}: {msg}", self.kind.name(), self.id)));
        match &self.kind {
            OperationKind::Insert { text, .. } if text.is_empty() => invalid("empty insert"),
            OperationKind::Delete { length: 0, .. } => invalid("zero-length delete"),
            OperationKind::Format { length: 0, .. } => invalid("zero-length format"),
            OperationKind::Format { attributes, .. } if attributes.is_empty() => {
                invalid("format without attributes")
            }
            OperationKind::Attribute { change } => match change {
                AttributeOp::TaskAdded { task } if task.title.trim().is_empty() => {
                    invalid("task title is empty")
                }
                AttributeOp::TaskUpdated { patch, .. } if patch.is_empty() => invalid("empty task patch"),
                AttributeOp::TaskUpdated { patch, .. }
                    if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) =>
                {
                    invalid("task title is empty")
                }
                AttributeOp::CommentAdded { comment, .. } if comment.body.trim().is_empty() => {
                    invalid("comment body is empty")
                }
                AttributeOp::TimelineUpdated { entry } if entry.title.trim().is_empty() => {
                    invalid("timeline entry title is empty")
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Clamp position and length so the operation stays inside a field of
    /// `len` characters.
    pub fn clamp_to(&mut self, len: usize) {
        match &mut self.kind {
            OperationKind::Insert { position, .. } => *position = (*position).min(len),
            OperationKind::Delete { position, length, .. }
            | OperationKind::Format { position, length, .. } => {
                *position = (*position).min(len);
                *length = (*length).min(len - *position);
            }
            OperationKind::Retain { length, .. } => *length = (*length).min(len),
            OperationKind::Attribute { .. } => {}
        }
    }

    /// Whether applying this operation changes nothing, e.g. an insert that
    /// was absorbed by a concurrent delete.
    pub fn is_noop(&self) -> bool {
        match &self.kind {
            OperationKind::Insert { text, .. } => text.is_empty(),
            OperationKind::Delete { length, .. } => *length == 0,
            OperationKind::Retain { .. } => true,
            OperationKind::Format { length, .. } => *length == 0,
            OperationKind::Attribute { .. } => false,
        }
    }
}
