//! Identity supplied by the host application.
//!
//! Authentication happens elsewhere; the engine trusts the `CurrentUser` it
//! is handed and only uses it to stamp operations and label presence.

use serde::{Deserialize, Serialize};

use crate::model::{PlanningId, UserId};
use crate::operation::{Operation, OperationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Family,
    Director,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub user_id: UserId,
    pub user_name: String,
    pub user_role: UserRole,
}

impl CurrentUser {
    pub fn new(user_id: UserId, user_name: impl Into<String>, user_role: UserRole) -> Self {
        Self { user_id, user_name: user_name.into(), user_role }
    }

    /// Build an operation authored by this user on top of `base_version`.
    pub fn stamp(&self, planning_id: PlanningId, base_version: u64, kind: OperationKind) -> Operation {
        Operation::new(planning_id, self.user_id, base_version, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::TextField;
    use uuid::Uuid;

    #[test]
    fn test_stamp_sets_author_and_base() {
        let user = CurrentUser::new(Uuid::new_v4(), "Maria", UserRole::Family);
        let planning = Uuid::new_v4();
        let op = user.stamp(planning, 7, OperationKind::insert(TextField::Title, 0, "A"));

        assert_eq!(op.author, user.user_id);
        assert_eq!(op.planning_id, planning);
        assert_eq!(op.base_version, 7);
        assert_eq!(op.seq, 0);
    }
}
