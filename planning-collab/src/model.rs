//! Planning document model.
//!
//! Everything here is plain data. Mutation happens exclusively through
//! [`crate::reducer::apply`], so these types carry no locking or interior
//! mutability.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

pub type PlanningId = Uuid;
pub type UserId = Uuid;
pub type TaskId = Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollaboratorRole {
    Owner,
    Editor,
    Viewer,
}

impl CollaboratorRole {
    /// Whether this role may submit operations.
    pub fn can_edit(&self) -> bool {
        !matches!(self, CollaboratorRole::Viewer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanningStatus {
    Draft,
    Active,
    Completed,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub user_id: UserId,
    pub role: CollaboratorRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskComment {
    pub id: Uuid,
    pub author: UserId,
    pub body: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanningTask {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub assignee: Option<UserId>,
    /// Due date in epoch milliseconds.
    pub due_date: Option<u64>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub category: Option<String>,
    pub created_by: UserId,
    pub created_at: u64,
    pub updated_at: u64,
    pub comments: Vec<TaskComment>,
}

impl PlanningTask {
    /// A pending, medium-priority task with a fresh id.
    pub fn new(title: impl Into<String>, created_by: UserId) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            assignee: None,
            due_date: None,
            priority: TaskPriority::Medium,
            status: TaskStatus::Pending,
            category: None,
            created_by,
            created_at: now,
            updated_at: now,
            comments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: Uuid,
    pub title: String,
    /// Scheduled time in epoch milliseconds.
    pub scheduled_at: u64,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub completed: bool,
}

/// The shared document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Planning {
    pub id: PlanningId,
    pub family_id: UserId,
    pub director_id: UserId,
    pub title: String,
    pub description: String,
    pub tasks: Vec<PlanningTask>,
    pub timeline: Vec<TimelineEntry>,
    pub collaborators: Vec<Collaborator>,
    pub status: PlanningStatus,
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Planning {
    /// New draft owned by a family and a director, both with the owner role.
    pub fn new(title: impl Into<String>, family_id: UserId, director_id: UserId) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            family_id,
            director_id,
            title: title.into(),
            description: String::new(),
            tasks: Vec::new(),
            timeline: Vec::new(),
            collaborators: vec![
                Collaborator { user_id: family_id, role: CollaboratorRole::Owner },
                Collaborator { user_id: director_id, role: CollaboratorRole::Owner },
            ],
            status: PlanningStatus::Draft,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Add or replace a collaborator entry.
    pub fn with_collaborator(mut self, user_id: UserId, role: CollaboratorRole) -> Self {
        match self.collaborators.iter_mut().find(|c| c.user_id == user_id) {
            Some(existing) => existing.role = role,
            None => self.collaborators.push(Collaborator { user_id, role }),
        }
        self
    }

    /// Role of a user on this planning, if any.
    pub fn role_of(&self, user_id: UserId) -> Option<CollaboratorRole> {
        if user_id == self.family_id || user_id == self.director_id {
            return Some(CollaboratorRole::Owner);
        }
        self.collaborators
            .iter()
            .find(|c| c.user_id == user_id)
            .map(|c| c.role)
    }

    pub fn task(&self, task_id: TaskId) -> Option<&PlanningTask> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn has_task(&self, task_id: TaskId) -> bool {
        self.task(task_id).is_some()
    }
}
