//! The apply step: `(Planning, &Operation) -> Planning`.
//!
//! Pure and synchronous. Positions are clamped again here so that an
//! operation that slipped past the pipeline's clamp can never panic on a
//! string boundary.

use crate::model::{Planning, PlanningStatus};
use crate::operation::{AttributeOp, Operation, OperationKind, TextField};

/// Apply an accepted operation. Bumps the version by exactly one.
pub fn apply(mut planning: Planning, op: &Operation) -> Planning {
    match &op.kind {
        OperationKind::Attribute { change } => apply_attribute(&mut planning, change, op.timestamp),
        kind => {
            if let Some(field) = kind.field() {
                apply_text(field_mut(&mut planning, field), kind);
            }
        }
    }

    if planning.status == PlanningStatus::Draft
        && !matches!(
            op.kind,
            OperationKind::Attribute { change: AttributeOp::StatusChanged { .. } }
        )
    {
        planning.status = PlanningStatus::Active;
    }

    planning.version += 1;
    planning.updated_at = planning.updated_at.max(op.timestamp);
    planning
}

pub fn field_mut(planning: &mut Planning, field: TextField) -> &mut String {
    match field {
        TextField::Title => &mut planning.title,
        TextField::Description => &mut planning.description,
    }
}

/// Character length of a text field.
pub fn field_len(planning: &Planning, field: TextField) -> usize {
    match field {
        TextField::Title => planning.title.chars().count(),
        TextField::Description => planning.description.chars().count(),
    }
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(i, _)| i)
}

/// Apply a positional operation to a string. Non-text kinds are ignored.
pub fn apply_text(text: &mut String, kind: &OperationKind) {
    match kind {
        OperationKind::Insert { position, text: inserted, .. } => {
            let at = byte_offset(text, *position);
            text.insert_str(at, inserted);
        }
        OperationKind::Delete { position, length, .. } => {
            let start = byte_offset(text, *position);
            let end = byte_offset(text, position.saturating_add(*length));
            text.replace_range(start..end, "");
        }
        OperationKind::Retain { .. } | OperationKind::Format { .. } | OperationKind::Attribute { .. } => {}
    }
}

fn apply_attribute(planning: &mut Planning, change: &AttributeOp, timestamp: u64) {
    match change {
        AttributeOp::TaskAdded { task } => {
            if planning.has_task(task.id) {
                log::debug!("task {} already present in planning {}", task.id, planning.id);
            } else {
                planning.tasks.push(task.clone());
            }
        }
        AttributeOp::TaskUpdated { task_id, patch } => {
            if let Some(task) = planning.tasks.iter_mut().find(|t| t.id == *task_id) {
                patch.apply_to(task);
                task.updated_at = task.updated_at.max(timestamp);
            }
        }
        AttributeOp::TaskDeleted { task_id } => {
            planning.tasks.retain(|t| t.id != *task_id);
        }
        AttributeOp::TimelineUpdated { entry } => {
            match planning.timeline.iter_mut().find(|e| e.id == entry.id) {
                Some(existing) => *existing = entry.clone(),
                None => planning.timeline.push(entry.clone()),
            }
            planning
                .timeline
                .sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
        }
        AttributeOp::StatusChanged { status } => {
            planning.status = *status;
        }
        AttributeOp::CommentAdded { task_id, comment } => {
            if let Some(task) = planning.tasks.iter_mut().find(|t| t.id == *task_id) {
                if !task.comments.iter().any(|c| c.id == comment.id) {
                    task.comments.push(comment.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PlanningTask, TaskComment, TaskStatus, TimelineEntry};
    use crate::operation::TaskPatch;
    use uuid::Uuid;

    fn planning() -> Planning {
        Planning::new("Farewell", Uuid::new_v4(), Uuid::new_v4()).with_description("Plan the ceremony")
    }

    fn op(planning: &Planning, kind: OperationKind) -> Operation {
        Operation::new(planning.id, planning.family_id, planning.version, kind)
    }

    #[test]
    fn test_insert_unicode_by_character() {
        let mut text = "café au lait".to_string();
        apply_text(&mut text, &OperationKind::insert(TextField::Description, 4, "!"));
        assert_eq!(text, "café! au lait");
    }

    #[test]
    fn test_delete_past_end_is_clamped() {
        let mut text = "abc".to_string();
        apply_text(&mut text, &OperationKind::delete(TextField::Description, 1, 99));
        assert_eq!(text, "a");
    }

    #[test]
    fn test_first_operation_activates_draft() {
        let p = planning();
        let insert = op(&p, OperationKind::insert(TextField::Description, 0, "urgent "));
        let next = apply(p, &insert);
        assert_eq!(next.status, PlanningStatus::Active);
        assert_eq!(next.version, 1);
        assert_eq!(next.description, "urgent Plan the ceremony");
    }

    #[test]
    fn test_status_change_on_draft_wins_over_activation() {
        let p = planning();
        let archive = op(&p, OperationKind::attribute(AttributeOp::StatusChanged { status: PlanningStatus::Archived }));
        assert_eq!(apply(p, &archive).status, PlanningStatus::Archived);
    }

    #[test]
    fn test_task_lifecycle() {
        let p = planning();
        let task = PlanningTask::new("Book venue", p.family_id);
        let task_id = task.id;

        let p = apply(p.clone(), &op(&p, OperationKind::attribute(AttributeOp::TaskAdded { task: task.clone() })));
        // duplicate add keeps ids unique
        let p = apply(p.clone(), &op(&p, OperationKind::attribute(AttributeOp::TaskAdded { task })));
        assert_eq!(p.tasks.len(), 1);

        let patch = TaskPatch::status(TaskStatus::InProgress);
        let p = apply(p.clone(), &op(&p, OperationKind::attribute(AttributeOp::TaskUpdated { task_id, patch })));
        assert_eq!(p.tasks[0].status, TaskStatus::InProgress);

        let comment = TaskComment { id: Uuid::new_v4(), author: p.director_id, body: "Called them".into(), created_at: 1 };
        let p = apply(p.clone(), &op(&p, OperationKind::attribute(AttributeOp::CommentAdded { task_id, comment })));
        assert_eq!(p.tasks[0].comments.len(), 1);

        let p = apply(p.clone(), &op(&p, OperationKind::attribute(AttributeOp::TaskDeleted { task_id })));
        assert!(p.tasks.is_empty());
        assert_eq!(p.version, 5);
    }

    #[test]
    fn test_update_of_missing_task_only_bumps_version() {
        let p = planning();
        let before = p.tasks.clone();
        let update = op(
            &p,
            OperationKind::attribute(AttributeOp::TaskUpdated { task_id: Uuid::new_v4(), patch: TaskPatch::title("x") }),
        );
        let next = apply(p, &update);
        assert_eq!(next.tasks, before);
        assert_eq!(next.version, 1);
    }

    #[test]
    fn test_timeline_upsert_keeps_schedule_order() {
        let p = planning();
        let late = TimelineEntry { id: Uuid::new_v4(), title: "Reception".into(), scheduled_at: 200, location: None, notes: None, completed: false };
        let early = TimelineEntry { id: Uuid::new_v4(), title: "Service".into(), scheduled_at: 100, location: None, notes: None, completed: false };

        let p = apply(p.clone(), &op(&p, OperationKind::attribute(AttributeOp::TimelineUpdated { entry: late.clone() })));
        let p = apply(p.clone(), &op(&p, OperationKind::attribute(AttributeOp::TimelineUpdated { entry: early })));
        assert_eq!(p.timeline[0].title, "Service");

        let moved = TimelineEntry { scheduled_at: 50, ..late };
        let p = apply(p.clone(), &op(&p, OperationKind::attribute(AttributeOp::TimelineUpdated { entry: moved })));
        assert_eq!(p.timeline.len(), 2);
        assert_eq!(p.timeline[0].title, "Reception");
    }
}
