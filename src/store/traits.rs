//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::DatabaseError;
use crate::model::{Project, Recipient, Task, TimeEntry, TrackedUser, UpsertOutcome, UserTaskTotal};
use crate::threshold::level::{LedgerOutcome, ThresholdLevel, ThresholdRecord};

/// Backend-agnostic database trait covering the TimeCamp mirror, the
/// threshold ledger and notification routing.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Cheap round-trip to verify the store is reachable.
    async fn ping(&self) -> Result<(), DatabaseError>;

    // ── Tasks & users ───────────────────────────────────────────────

    async fn upsert_task(&self, task: &Task) -> Result<UpsertOutcome, DatabaseError>;

    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError>;

    async fn upsert_user(&self, user: &TrackedUser) -> Result<UpsertOutcome, DatabaseError>;

    // ── Time entries ────────────────────────────────────────────────

    /// Insert or overwrite an entry by id. `modified_at` is only stamped when
    /// the row is inserted or one of its fields changes.
    async fn upsert_time_entry(&self, entry: &TimeEntry) -> Result<UpsertOutcome, DatabaseError>;

    /// Total seconds tracked on a task with `from <= date <= to`.
    async fn sum_durations(
        &self,
        task_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<i64, DatabaseError>;

    /// Total seconds ever tracked on a task.
    async fn sum_durations_all_time(&self, task_id: i64) -> Result<i64, DatabaseError>;

    /// Net change in a task's tracked seconds since `since`, from the
    /// duration change log. Edits that leave durations alone add nothing and
    /// shrinking an entry counts negative.
    async fn sum_recent_growth(
        &self,
        task_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64, DatabaseError>;

    /// Latest entry date for a task, if any entries exist.
    async fn latest_entry_date(&self, task_id: i64) -> Result<Option<NaiveDate>, DatabaseError>;

    /// Per-user, per-task totals over a date range (inclusive).
    async fn user_task_totals(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<UserTaskTotal>, DatabaseError>;

    /// Delete entries whose task no longer exists and whose date is before
    /// `older_than`. Returns the number of rows removed.
    async fn delete_orphaned_time_entries(
        &self,
        older_than: NaiveDate,
    ) -> Result<usize, DatabaseError>;

    // ── Threshold ledger ────────────────────────────────────────────

    /// Highest level already recorded for a task.
    async fn max_recorded_threshold(
        &self,
        task_id: i64,
    ) -> Result<Option<ThresholdLevel>, DatabaseError>;

    /// Insert or update the `(task_id, level)` ledger row.
    async fn upsert_threshold_record(
        &self,
        task_id: i64,
        level: ThresholdLevel,
        percentage: f64,
        entry_date: NaiveDate,
    ) -> Result<(), DatabaseError>;

    /// Atomically read the highest recorded level for `task_id` and record
    /// `level` only if nothing at or above it is recorded yet.
    ///
    /// Implementations must serialise concurrent callers for the same task so
    /// that at most one of them observes `LedgerOutcome::Recorded`.
    async fn record_threshold_crossing(
        &self,
        task_id: i64,
        level: ThresholdLevel,
        percentage: f64,
        entry_date: NaiveDate,
    ) -> Result<LedgerOutcome, DatabaseError>;

    async fn list_threshold_records(
        &self,
        task_id: i64,
    ) -> Result<Vec<ThresholdRecord>, DatabaseError>;

    // ── Notification routing ────────────────────────────────────────

    /// Create or rename the project bound to `source_task_id`.
    async fn upsert_project(
        &self,
        name: &str,
        source_task_id: i64,
    ) -> Result<Project, DatabaseError>;

    async fn list_projects(&self) -> Result<Vec<Project>, DatabaseError>;

    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>, DatabaseError>;

    async fn upsert_recipient(&self, recipient: &Recipient) -> Result<(), DatabaseError>;

    /// Remove a recipient and their project assignments.
    async fn remove_recipient(&self, slack_user_id: &str) -> Result<bool, DatabaseError>;

    async fn list_recipients(&self) -> Result<Vec<Recipient>, DatabaseError>;

    async fn assign_project(&self, slack_user_id: &str, project_id: i64)
    -> Result<(), DatabaseError>;

    async fn unassign_project(
        &self,
        slack_user_id: &str,
        project_id: i64,
    ) -> Result<bool, DatabaseError>;

    async fn user_project_assignments(
        &self,
        slack_user_id: &str,
    ) -> Result<Vec<Project>, DatabaseError>;
}
