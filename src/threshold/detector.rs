//! Threshold crossing detection.
//!
//! Two independent paths share this module:
//! - **First crossing**: ledger-gated. A level is alerted at most once per
//!   task; the decide-then-record step is a single store transaction.
//! - **Persistent violation**: for tasks already over 100%, re-alerts each
//!   time recent entries push usage further up. It never reads or writes the
//!   ledger, so it repeats for as long as usage keeps climbing.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, ThresholdError};
use crate::model::Task;
use crate::store::Database;
use crate::threshold::aggregation::{DateWindow, UsageQueries};
use crate::threshold::estimation::Estimation;
use crate::threshold::level::{LedgerOutcome, ThresholdLevel};

/// Detector tuning.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Calendar days counted as the current sync window.
    pub window_days: u32,
    /// Upper bound for any single store query.
    pub query_timeout: Duration,
    /// Recency window for the persistent-violation path.
    pub persistent_window: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_days: 2,
            query_timeout: Duration::from_secs(15),
            persistent_window: Duration::from_secs(3600),
        }
    }
}

/// Which path produced a crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossingKind {
    /// The task reached `level` for the first time.
    FirstCrossing,
    /// The task was already over budget and got worse.
    PersistentViolation,
}

/// A detected crossing, ready for fan-out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdCrossing {
    pub task_id: i64,
    pub parent_id: Option<i64>,
    pub task_name: String,
    pub current_secs: i64,
    pub previous_secs: i64,
    pub percentage: f64,
    pub level: ThresholdLevel,
    pub kind: CrossingKind,
    pub entry_date: NaiveDate,
}

/// Per-task result: `Ok(None)` means the task was skipped on purpose.
type TaskCheck = Result<Option<ThresholdCrossing>, DatabaseError>;

pub struct ThresholdDetector {
    store: Arc<dyn Database>,
    usage: UsageQueries,
    config: DetectorConfig,
}

impl ThresholdDetector {
    pub fn new(store: Arc<dyn Database>, config: DetectorConfig) -> Self {
        let usage = UsageQueries::new(Arc::clone(&store), config.query_timeout);
        Self {
            store,
            usage,
            config,
        }
    }

    /// Run both paths over `task_ids`.
    ///
    /// Per-task failures are logged and skipped. A store that cannot be
    /// reached fails the whole call.
    pub async fn detect(
        &self,
        task_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<Vec<ThresholdCrossing>, ThresholdError> {
        self.usage
            .bounded(self.store.ping())
            .await
            .map_err(ThresholdError::StoreUnavailable)?;

        let mut crossings = self.detect_first_crossings(task_ids, now.date_naive()).await?;

        // A task that just reached 100% already gets its 100% line.
        let just_full: BTreeSet<i64> = crossings
            .iter()
            .filter(|c| c.level == ThresholdLevel::Full)
            .map(|c| c.task_id)
            .collect();
        let still_growing: Vec<i64> = unique(task_ids)
            .into_iter()
            .filter(|id| !just_full.contains(id))
            .collect();

        crossings.extend(self.detect_persistent_violations(&still_growing, now).await?);
        Ok(crossings)
    }

    /// Ledger-gated path: at most one event per `(task, level)` ever.
    pub async fn detect_first_crossings(
        &self,
        task_ids: &[i64],
        today: NaiveDate,
    ) -> Result<Vec<ThresholdCrossing>, ThresholdError> {
        let window = DateWindow::ending_at(today, self.config.window_days);
        let mut crossings = Vec::new();

        for task_id in unique(task_ids) {
            let check = self.check_first_crossing(task_id, window, today).await;
            if let Some(crossing) = settle(task_id, "first_crossing", check)? {
                info!(
                    task_id,
                    level = %crossing.level,
                    percentage = crossing.percentage,
                    "Threshold crossed"
                );
                crossings.push(crossing);
            }
        }

        Ok(crossings)
    }

    /// Ungated path: tasks already over 100% whose tracked time grew inside the
    /// recency window.
    pub async fn detect_persistent_violations(
        &self,
        task_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<Vec<ThresholdCrossing>, ThresholdError> {
        let window = chrono::Duration::from_std(self.config.persistent_window)
            .unwrap_or(chrono::Duration::hours(1));
        let since = now - window;
        let mut crossings = Vec::new();

        for task_id in unique(task_ids) {
            let check = self.check_persistent_violation(task_id, since, now.date_naive()).await;
            if let Some(crossing) = settle(task_id, "persistent_violation", check)? {
                info!(
                    task_id,
                    percentage = crossing.percentage,
                    "Over-budget task still growing"
                );
                crossings.push(crossing);
            }
        }

        Ok(crossings)
    }

    async fn check_first_crossing(
        &self,
        task_id: i64,
        window: DateWindow,
        today: NaiveDate,
    ) -> TaskCheck {
        let Some((task, estimation)) = self.estimated_task(task_id).await? else {
            return Ok(None);
        };

        let usage = self.usage.task_usage(task_id, window).await?;
        let percentage = estimation.usage_percent(usage.cumulative_secs);
        let Some(level) = ThresholdLevel::highest_reached(percentage) else {
            return Ok(None);
        };

        let entry_date = self
            .usage
            .bounded(self.store.latest_entry_date(task_id))
            .await?
            .unwrap_or(today);

        let outcome = match self.claim(task_id, level, percentage, entry_date).await {
            Err(DatabaseError::Conflict(reason)) => {
                debug!(task_id, %reason, "Ledger contention, retrying once");
                self.claim(task_id, level, percentage, entry_date).await?
            }
            other => other?,
        };

        match outcome {
            LedgerOutcome::Recorded => Ok(Some(ThresholdCrossing {
                task_id,
                parent_id: task.parent(),
                task_name: task.name,
                current_secs: usage.cumulative_secs,
                previous_secs: usage.previous_secs(),
                percentage,
                level,
                kind: CrossingKind::FirstCrossing,
                entry_date,
            })),
            LedgerOutcome::Refreshed | LedgerOutcome::Superseded { .. } => {
                debug!(task_id, %level, ?outcome, "Level already notified");
                Ok(None)
            }
        }
    }

    async fn check_persistent_violation(
        &self,
        task_id: i64,
        since: DateTime<Utc>,
        today: NaiveDate,
    ) -> TaskCheck {
        let growth_secs = self.usage.recent_growth_secs(task_id, since).await?;
        if growth_secs <= 0 {
            return Ok(None);
        }

        let Some((task, estimation)) = self.estimated_task(task_id).await? else {
            return Ok(None);
        };

        let current_secs = self
            .usage
            .bounded(self.store.sum_durations_all_time(task_id))
            .await?;
        let previous_secs = (current_secs - growth_secs).max(0);
        let percentage = estimation.usage_percent(current_secs);
        let previous_percentage = estimation.usage_percent(previous_secs);

        let max = ThresholdLevel::Full;
        if previous_percentage < max.percent() as f64 || percentage <= previous_percentage {
            return Ok(None);
        }

        let entry_date = self
            .usage
            .bounded(self.store.latest_entry_date(task_id))
            .await?
            .unwrap_or(today);

        Ok(Some(ThresholdCrossing {
            task_id,
            parent_id: task.parent(),
            task_name: task.name,
            current_secs,
            previous_secs,
            percentage,
            level: max,
            kind: CrossingKind::PersistentViolation,
            entry_date,
        }))
    }

    /// Load a task and its estimation; `None` when either is unusable.
    async fn estimated_task(
        &self,
        task_id: i64,
    ) -> Result<Option<(Task, Estimation)>, DatabaseError> {
        let Some(task) = self.usage.bounded(self.store.get_task(task_id)).await? else {
            debug!(task_id, "Task not in store, skipping");
            return Ok(None);
        };

        match Estimation::parse(&task.name) {
            Ok(estimation) => Ok(Some((task, estimation))),
            Err(reason) => {
                debug!(task_id, task = %task.name, %reason, "No usable estimation, skipping");
                Ok(None)
            }
        }
    }

    async fn claim(
        &self,
        task_id: i64,
        level: ThresholdLevel,
        percentage: f64,
        entry_date: NaiveDate,
    ) -> Result<LedgerOutcome, DatabaseError> {
        self.usage
            .bounded(
                self.store
                    .record_threshold_crossing(task_id, level, percentage, entry_date),
            )
            .await
    }
}

/// Sorted, de-duplicated task ids.
fn unique(task_ids: &[i64]) -> BTreeSet<i64> {
    task_ids.iter().copied().collect()
}

/// Turn a per-task result into a batch decision: connection failures abort,
/// everything else is logged and skipped.
fn settle(
    task_id: i64,
    path: &'static str,
    check: TaskCheck,
) -> Result<Option<ThresholdCrossing>, ThresholdError> {
    match check {
        Ok(found) => Ok(found),
        Err(e) if e.is_connection_failure() => Err(ThresholdError::StoreUnavailable(e)),
        Err(e) => {
            warn!(task_id, path, error = %e, "Threshold check failed for task, skipping");
            Ok(None)
        }
    }
}
