//! Operational transform.
//!
//! `transform(a, b)` returns the operation to apply instead of `a` once `b`
//! has already been applied. The function is pure: no clocks, no state, no
//! I/O. Given the same pair it always produces the same result, so every
//! replica that folds the same operations converges.
//!
//! ```text
//!            base
//!           /    \
//!          a      b
//!         /        \
//!   T(b, a)        T(a, b)
//!         \        /
//!          converged
//! ```
//!
//! Positional rules only apply to two text operations on the same field.
//! Attribute operations commute and pass through unchanged; the pair is
//! only inspected for intent conflicts that need a human.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::{AttributeOp, Operation, OperationKind, OrderKey};

/// A pair that was merged deterministically but lost part of someone's intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ambiguity {
    /// An insert landed strictly inside a range deleted concurrently and was
    /// swallowed by the delete.
    InsertInsideDelete,
    /// A task was deleted while someone else edited or commented on it.
    DeleteRacesTaskEdit { task_id: Uuid },
    /// Two different planning statuses were chosen concurrently.
    ConcurrentStatusChange,
}

impl Ambiguity {
    pub fn description(&self) -> String {
        match self {
            Ambiguity::InsertInsideDelete => {
                "text inserted inside a concurrently deleted range was dropped".to_string()
            }
            Ambiguity::DeleteRacesTaskEdit { task_id } => {
                format!("task {task_id} was deleted while being edited")
            }
            Ambiguity::ConcurrentStatusChange => {
                "planning status was changed concurrently; the later change won".to_string()
            }
        }
    }
}

/// Result of [`transform_checked`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    pub operation: Operation,
    pub ambiguity: Option<Ambiguity>,
}

/// Rebase `a` over the already-applied `b`.
pub fn transform(a: &Operation, b: &Operation) -> Operation {
    transform_checked(a, b).operation
}

/// Rebase `a` over `b` and report whether the pair needs manual review.
pub fn transform_checked(a: &Operation, b: &Operation) -> Transformed {
    let mut operation = a.clone();
    let ambiguity = if a.kind.field().is_some() && a.kind.field() == b.kind.field() {
        transform_text(&mut operation.kind, a.order_key(), &b.kind, b.order_key())
    } else {
        attribute_ambiguity(&a.kind, &b.kind)
    };
    Transformed { operation, ambiguity }
}

/// Fold `op` through every operation in `applied`, in order.
pub fn transform_against<'a, I>(op: &Operation, applied: I) -> (Operation, Vec<(Uuid, Ambiguity)>)
where
    I: IntoIterator<Item = &'a Operation>,
{
    let mut current = op.clone();
    let mut ambiguities = Vec::new();
    for other in applied {
        let Transformed { operation, ambiguity } = transform_checked(&current, other);
        if let Some(ambiguity) = ambiguity {
            ambiguities.push((other.id, ambiguity));
        }
        current = operation;
    }
    (current, ambiguities)
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Whether an insert at `b_pos` goes before an insert at `a_pos`.
fn inserted_before(a_pos: usize, a_key: OrderKey, b_pos: usize, b_key: OrderKey) -> bool {
    b_pos < a_pos || (b_pos == a_pos && b_key < a_key)
}

/// Shift a `[pos, pos + len)` range over a concurrent insert of `ins_len`
/// characters at `ins_pos`. Returns `true` if the insert fell inside.
fn range_over_insert(pos: &mut usize, len: &mut usize, ins_pos: usize, ins_len: usize) -> bool {
    if ins_pos <= *pos {
        *pos += ins_len;
        false
    } else if ins_pos >= *pos + *len {
        false
    } else {
        *len += ins_len;
        ins_len > 0
    }
}

/// Shrink a `[pos, pos + len)` range over a concurrent delete of
/// `[del_pos, del_pos + del_len)`.
fn range_over_delete(pos: &mut usize, len: &mut usize, del_pos: usize, del_len: usize) {
    let start = *pos;
    let end = *pos + *len;
    let del_end = del_pos + del_len;

    if start >= del_end {
        *pos = start - del_len;
    } else if end <= del_pos {
        // entirely before the delete
    } else {
        let overlap = end.min(del_end) - start.max(del_pos);
        *pos = start.min(del_pos);
        *len = len.saturating_sub(overlap);
    }
}

fn transform_text(
    a: &mut OperationKind,
    a_key: OrderKey,
    b: &OperationKind,
    b_key: OrderKey,
) -> Option<Ambiguity> {
    match (a, b) {
        (
            OperationKind::Insert { position, .. },
            OperationKind::Insert { position: b_pos, text: b_text, .. },
        ) => {
            if inserted_before(*position, a_key, *b_pos, b_key) {
                *position += char_len(b_text);
            }
            None
        }

        (
            OperationKind::Insert { position, text, .. },
            OperationKind::Delete { position: b_pos, length: b_len, .. },
        ) => {
            if *position <= *b_pos {
                None
            } else if *position >= b_pos + b_len {
                *position -= b_len;
                None
            } else {
                *position = *b_pos;
                let swallowed = !text.is_empty();
                text.clear();
                swallowed.then_some(Ambiguity::InsertInsideDelete)
            }
        }

        (
            OperationKind::Delete { position, length, .. },
            OperationKind::Insert { position: b_pos, text: b_text, .. },
        ) => range_over_insert(position, length, *b_pos, char_len(b_text))
            .then_some(Ambiguity::InsertInsideDelete),

        (
            OperationKind::Format { position, length, .. },
            OperationKind::Insert { position: b_pos, text: b_text, .. },
        ) => {
            range_over_insert(position, length, *b_pos, char_len(b_text));
            None
        }

        (
            OperationKind::Delete { position, length, .. } | OperationKind::Format { position, length, .. },
            OperationKind::Delete { position: b_pos, length: b_len, .. },
        ) => {
            range_over_delete(position, length, *b_pos, *b_len);
            None
        }

        // Retain and format never move text, and retain is never moved.
        _ => None,
    }
}

fn attribute_ambiguity(a: &OperationKind, b: &OperationKind) -> Option<Ambiguity> {
    let (OperationKind::Attribute { change: a }, OperationKind::Attribute { change: b }) = (a, b) else {
        return None;
    };

    match (a, b) {
        (AttributeOp::TaskDeleted { task_id }, other) | (other, AttributeOp::TaskDeleted { task_id })
            if matches!(
                other,
                AttributeOp::TaskUpdated { .. } | AttributeOp::CommentAdded { .. }
            ) && other.task_id() == Some(*task_id) =>
        {
            Some(Ambiguity::DeleteRacesTaskEdit { task_id: *task_id })
        }
        (AttributeOp::StatusChanged { status: x }, AttributeOp::StatusChanged { status: y }) if x != y => {
            Some(Ambiguity::ConcurrentStatusChange)
        }
        _ => None,
    }
}
