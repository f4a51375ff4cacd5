//! Sync job: mirror TimeCamp into the local store, then hand every task in
//! the fetched batch to the threshold monitor.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::store::Database;
use crate::threshold::ThresholdMonitor;
use crate::timecamp::TimeSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Incremental,
    Full,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Incremental => "incremental",
            SyncMode::Full => "full",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub lookback_days: u32,
    pub full_lookback_days: u32,
    pub orphan_retention_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lookback_days: 2,
            full_lookback_days: 90,
            orphan_retention_days: 30,
        }
    }
}

/// What one sync run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub tasks: usize,
    pub users: usize,
    pub entries: usize,
    /// Tasks with at least one inserted or edited entry.
    pub touched_tasks: usize,
    /// Tasks handed to the threshold check: every task in the fetched batch.
    pub checked_tasks: usize,
    pub alerts_sent: usize,
    pub orphans_removed: usize,
}

pub struct Syncer {
    source: Arc<dyn TimeSource>,
    store: Arc<dyn Database>,
    monitor: Arc<ThresholdMonitor>,
    config: SyncConfig,
}

impl Syncer {
    pub fn new(
        source: Arc<dyn TimeSource>,
        store: Arc<dyn Database>,
        monitor: Arc<ThresholdMonitor>,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            store,
            monitor,
            config,
        }
    }

    pub async fn run(&self, mode: SyncMode) -> Result<SyncReport, SyncError> {
        self.run_at(mode, Utc::now().date_naive()).await
    }

    /// Run a sync as if today were `today`.
    pub async fn run_at(&self, mode: SyncMode, today: NaiveDate) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let lookback = match mode {
            SyncMode::Incremental => self.config.lookback_days,
            SyncMode::Full => self.config.full_lookback_days,
        };
        let from = today - Duration::days(i64::from(lookback.max(1)) - 1);
        info!(%run_id, mode = mode.as_str(), %from, %today, "Sync started");

        let mut report = SyncReport {
            run_id,
            mode,
            tasks: 0,
            users: 0,
            entries: 0,
            touched_tasks: 0,
            checked_tasks: 0,
            alerts_sent: 0,
            orphans_removed: 0,
        };

        let tasks = self
            .source
            .fetch_tasks()
            .await
            .map_err(|source| SyncError::Fetch { what: "tasks", source })?;
        for task in &tasks {
            self.store
                .upsert_task(task)
                .await
                .map_err(|source| SyncError::Store { what: "task", source })?;
        }
        report.tasks = tasks.len();

        let users = self
            .source
            .fetch_users()
            .await
            .map_err(|source| SyncError::Fetch { what: "users", source })?;
        for user in &users {
            self.store
                .upsert_user(user)
                .await
                .map_err(|source| SyncError::Store { what: "user", source })?;
        }
        report.users = users.len();

        let entries = self
            .source
            .fetch_time_entries(from, today)
            .await
            .map_err(|source| SyncError::Fetch { what: "time entries", source })?;
        // Tasks with only unchanged entries are checked too, so a failed or
        // disabled threshold pass is picked up by the next cycle.
        let mut touched = BTreeSet::new();
        let mut checked = BTreeSet::new();
        for entry in &entries {
            let outcome = self
                .store
                .upsert_time_entry(entry)
                .await
                .map_err(|source| SyncError::Store { what: "time entry", source })?;
            if outcome.changed() {
                touched.insert(entry.task_id);
            }
            checked.insert(entry.task_id);
        }
        report.entries = entries.len();
        report.touched_tasks = touched.len();
        report.checked_tasks = checked.len();

        if mode == SyncMode::Full {
            let cutoff = today - Duration::days(i64::from(self.config.orphan_retention_days));
            report.orphans_removed = match self.store.delete_orphaned_time_entries(cutoff).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(%run_id, error = %e, "Orphan cleanup failed");
                    0
                }
            };
        }

        let checked: Vec<i64> = checked.into_iter().collect();
        let summary = self.monitor.notify_time_entries_synced(&checked).await?;
        report.alerts_sent = summary.delivery.messages_sent;

        info!(
            %run_id,
            tasks = report.tasks,
            users = report.users,
            entries = report.entries,
            touched = report.touched_tasks,
            checked = report.checked_tasks,
            alerts = report.alerts_sent,
            orphans = report.orphans_removed,
            "Sync finished"
        );
        Ok(report)
    }
}
