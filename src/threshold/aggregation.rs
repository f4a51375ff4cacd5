//! Duration aggregation over the store, with bounded query time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::DatabaseError;
use crate::store::Database;

/// Inclusive calendar-date window attributed to the current sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    /// The `days` calendar days ending at `today`. Zero is treated as one.
    pub fn ending_at(today: NaiveDate, days: u32) -> Self {
        let span = i64::from(days.max(1)) - 1;
        Self {
            from: today - chrono::Duration::days(span),
            to: today,
        }
    }
}

/// Cumulative and in-window seconds for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskUsage {
    pub task_id: i64,
    pub cumulative_secs: i64,
    pub window_secs: i64,
}

impl TaskUsage {
    /// Time tracked before the current window.
    pub fn previous_secs(&self) -> i64 {
        (self.cumulative_secs - self.window_secs).max(0)
    }
}

/// Read-side queries used by the detector.
pub struct UsageQueries {
    store: Arc<dyn Database>,
    timeout: Duration,
}

impl UsageQueries {
    pub fn new(store: Arc<dyn Database>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn task_usage(
        &self,
        task_id: i64,
        window: DateWindow,
    ) -> Result<TaskUsage, DatabaseError> {
        let cumulative_secs = self
            .bounded(self.store.sum_durations_all_time(task_id))
            .await?;
        let window_secs = self
            .bounded(self.store.sum_durations(task_id, window.from, window.to))
            .await?;
        Ok(TaskUsage {
            task_id,
            cumulative_secs,
            window_secs,
        })
    }

    /// Net seconds added to a task since `since`.
    pub async fn recent_growth_secs(
        &self,
        task_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        self.bounded(self.store.sum_recent_growth(task_id, since))
            .await
    }

    /// Apply the query timeout to any store call.
    pub async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, DatabaseError>>,
    ) -> Result<T, DatabaseError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DatabaseError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TimeEntry;
    use crate::store::LibSqlBackend;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn window_spans_days_inclusive() {
        let w = DateWindow::ending_at(date("2026-03-10"), 3);
        assert_eq!(w.from, date("2026-03-08"));
        assert_eq!(w.to, date("2026-03-10"));

        let single = DateWindow::ending_at(date("2026-03-10"), 0);
        assert_eq!(single.from, single.to);
    }

    #[tokio::test]
    async fn usage_splits_cumulative_and_window() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        for (id, day, secs) in [(1, "2026-03-01", 3600), (2, "2026-03-10", 1800)] {
            store
                .upsert_time_entry(&TimeEntry {
                    id,
                    task_id: 5,
                    user_id: 1,
                    date: date(day),
                    duration_secs: secs,
                    description: String::new(),
                })
                .await
                .unwrap();
        }

        let queries = UsageQueries::new(store, Duration::from_secs(5));
        let usage = queries
            .task_usage(5, DateWindow::ending_at(date("2026-03-10"), 2))
            .await
            .unwrap();
        assert_eq!(usage.cumulative_secs, 5400);
        assert_eq!(usage.window_secs, 1800);
        assert_eq!(usage.previous_secs(), 3600);
    }

    #[tokio::test]
    async fn slow_query_times_out() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queries = UsageQueries::new(store, Duration::from_millis(10));
        let result: Result<i64, _> = queries
            .bounded(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(DatabaseError::Timeout(_))));
    }
}
