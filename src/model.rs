//! Core records mirrored from TimeCamp and the team's Slack configuration.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A TimeCamp task. `parent_id` of 0 (or `None`) marks a root task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub archived: bool,
}

impl Task {
    /// Parent id with the source's `0` sentinel folded into `None`.
    pub fn parent(&self) -> Option<i64> {
        self.parent_id.filter(|p| *p != 0)
    }
}

/// A single time entry. Identity is the source-assigned `id`; the source
/// system is authoritative, so re-fetching overwrites local fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: i64,
    pub task_id: i64,
    pub user_id: i64,
    pub date: NaiveDate,
    pub duration_secs: i64,
    pub description: String,
}

/// A TimeCamp user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedUser {
    pub id: i64,
    pub email: String,
    pub display_name: String,
}

/// A project as configured for notification routing. `source_task_id` is the
/// TimeCamp task that represents the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub source_task_id: i64,
}

impl Project {
    /// Shallow membership: the task itself or its immediate parent is the
    /// project's source task.
    pub fn covers(&self, task_id: i64, parent_id: Option<i64>) -> bool {
        self.source_task_id == task_id || parent_id == Some(self.source_task_id)
    }
}

/// A Slack user eligible to receive threshold alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub slack_user_id: String,
    pub name: String,
}

/// Whether an upsert actually wrote anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

/// Per-user, per-task total for a reporting period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserTaskTotal {
    pub user_id: i64,
    pub user_name: String,
    pub task_id: i64,
    pub task_name: String,
    pub duration_secs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_parent_is_root() {
        let task = Task {
            id: 1,
            parent_id: Some(0),
            name: "Root".into(),
            archived: false,
        };
        assert_eq!(task.parent(), None);
    }

    #[test]
    fn project_covers_task_and_direct_child_only() {
        let project = Project {
            id: 1,
            name: "P1".into(),
            source_task_id: 500,
        };
        assert!(project.covers(500, None));
        assert!(project.covers(501, Some(500)));
        assert!(!project.covers(502, Some(501)));
        assert!(!project.covers(600, None));
    }

    #[test]
    fn upsert_outcome_changed() {
        assert!(UpsertOutcome::Inserted.changed());
        assert!(UpsertOutcome::Updated.changed());
        assert!(!UpsertOutcome::Unchanged.changed());
    }
}
