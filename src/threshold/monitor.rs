//! Sync-triggered entry point for the threshold engine.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::ThresholdError;
use crate::threshold::detector::{CrossingKind, ThresholdDetector};
use crate::threshold::fanout::{FanoutReport, NotificationFanout};

/// Outcome of one post-sync threshold pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThresholdRunSummary {
    pub tasks_checked: usize,
    pub first_crossings: usize,
    pub persistent_violations: usize,
    pub delivery: FanoutReport,
}

impl ThresholdRunSummary {
    pub fn crossings(&self) -> usize {
        self.first_crossings + self.persistent_violations
    }
}

/// Runs detection then fan-out for the tasks a sync batch touched.
pub struct ThresholdMonitor {
    detector: ThresholdDetector,
    fanout: NotificationFanout,
    enabled: AtomicBool,
}

impl ThresholdMonitor {
    pub fn new(detector: ThresholdDetector, fanout: NotificationFanout, enabled: bool) -> Self {
        Self {
            detector,
            fanout,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Toggle alerting at runtime. Returns the previous state.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::Relaxed)
    }

    /// Called once per sync batch with the ids of tasks that had entries
    /// inserted or updated.
    pub async fn notify_time_entries_synced(
        &self,
        task_ids: &[i64],
    ) -> Result<ThresholdRunSummary, ThresholdError> {
        if task_ids.is_empty() {
            return Ok(ThresholdRunSummary::default());
        }
        if !self.is_enabled() {
            debug!(tasks = task_ids.len(), "Threshold alerts disabled, skipping check");
            return Ok(ThresholdRunSummary::default());
        }

        let crossings = self.detector.detect(task_ids, Utc::now()).await?;

        let mut summary = ThresholdRunSummary {
            tasks_checked: task_ids.len(),
            ..Default::default()
        };
        for crossing in &crossings {
            match crossing.kind {
                CrossingKind::FirstCrossing => summary.first_crossings += 1,
                CrossingKind::PersistentViolation => summary.persistent_violations += 1,
            }
        }

        summary.delivery = self.fanout.deliver(&crossings).await?;

        if summary.crossings() > 0 {
            info!(
                tasks = summary.tasks_checked,
                first = summary.first_crossings,
                persistent = summary.persistent_violations,
                sent = summary.delivery.messages_sent,
                "Threshold check complete"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DatabaseError, MessagingError};
    use crate::model::{Task, TimeEntry};
    use crate::slack::{Messenger, SlackMessage};
    use crate::store::{Database, LibSqlBackend};
    use crate::threshold::{DetectorConfig, ThresholdCrossing};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Inbox {
        messages: Mutex<Vec<(String, Vec<ThresholdCrossing>)>>,
    }

    #[async_trait]
    impl Messenger for Inbox {
        async fn send_message(
            &self,
            recipient: &str,
            _project_label: &str,
            crossings: &[ThresholdCrossing],
        ) -> Result<(), MessagingError> {
            self.messages
                .lock()
                .await
                .push((recipient.to_string(), crossings.to_vec()));
            Ok(())
        }

        async fn post(&self, _channel: &str, _message: &SlackMessage) -> Result<(), MessagingError> {
            Ok(())
        }
    }

    fn monitor(store: Arc<dyn Database>, inbox: Arc<Inbox>) -> Arc<ThresholdMonitor> {
        let detector = ThresholdDetector::new(Arc::clone(&store), DetectorConfig::default());
        let fanout = NotificationFanout::new(store, inbox, Duration::ZERO);
        Arc::new(ThresholdMonitor::new(detector, fanout, true))
    }

    async fn seeded_store() -> Arc<dyn Database> {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store
            .upsert_task(&Task {
                id: 7,
                parent_id: None,
                name: "Bug [5-5]".into(),
                archived: false,
            })
            .await
            .unwrap();
        store
            .upsert_time_entry(&TimeEntry {
                id: 1,
                task_id: 7,
                user_id: 1,
                date: Utc::now().date_naive(),
                duration_secs: 18_000,
                description: String::new(),
            })
            .await
            .unwrap();
        store
            .upsert_recipient(&crate::model::Recipient {
                slack_user_id: "U1".into(),
                name: "one".into(),
            })
            .await
            .unwrap();
        store
    }

    /// A store whose every call fails, to prove empty input never touches it.
    struct PoisonStore;

    macro_rules! poisoned {
        ($($name:ident($($arg:ident: $ty:ty),*) -> $ret:ty;)*) => {
            #[async_trait]
            impl Database for PoisonStore {
                $(async fn $name(&self, $($arg: $ty),*) -> Result<$ret, DatabaseError> {
                    $(let _ = $arg;)*
                    Err(DatabaseError::Pool("store touched".into()))
                })*
            }
        };
    }

    poisoned! {
        init_schema() -> ();
        ping() -> ();
        upsert_task(task: &Task) -> crate::model::UpsertOutcome;
        get_task(id: i64) -> Option<Task>;
        upsert_user(user: &crate::model::TrackedUser) -> crate::model::UpsertOutcome;
        upsert_time_entry(entry: &TimeEntry) -> crate::model::UpsertOutcome;
        sum_durations(task_id: i64, from: chrono::NaiveDate, to: chrono::NaiveDate) -> i64;
        sum_durations_all_time(task_id: i64) -> i64;
        sum_recent_growth(task_id: i64, since: chrono::DateTime<Utc>) -> i64;
        latest_entry_date(task_id: i64) -> Option<chrono::NaiveDate>;
        user_task_totals(from: chrono::NaiveDate, to: chrono::NaiveDate) -> Vec<crate::model::UserTaskTotal>;
        delete_orphaned_time_entries(older_than: chrono::NaiveDate) -> usize;
        max_recorded_threshold(task_id: i64) -> Option<crate::threshold::ThresholdLevel>;
        upsert_threshold_record(task_id: i64, level: crate::threshold::ThresholdLevel, percentage: f64, entry_date: chrono::NaiveDate) -> ();
        record_threshold_crossing(task_id: i64, level: crate::threshold::ThresholdLevel, percentage: f64, entry_date: chrono::NaiveDate) -> crate::threshold::LedgerOutcome;
        list_threshold_records(task_id: i64) -> Vec<crate::threshold::ThresholdRecord>;
        upsert_project(name: &str, source_task_id: i64) -> crate::model::Project;
        list_projects() -> Vec<crate::model::Project>;
        find_project_by_name(name: &str) -> Option<crate::model::Project>;
        upsert_recipient(recipient: &crate::model::Recipient) -> ();
        remove_recipient(slack_user_id: &str) -> bool;
        list_recipients() -> Vec<crate::model::Recipient>;
        assign_project(slack_user_id: &str, project_id: i64) -> ();
        unassign_project(slack_user_id: &str, project_id: i64) -> bool;
        user_project_assignments(slack_user_id: &str) -> Vec<crate::model::Project>;
    }

    #[tokio::test]
    async fn empty_batch_returns_without_store_access() {
        let monitor = monitor(Arc::new(PoisonStore), Arc::new(Inbox::default()));
        let summary = monitor.notify_time_entries_synced(&[]).await.unwrap();
        assert_eq!(summary, ThresholdRunSummary::default());
    }

    #[tokio::test]
    async fn unreachable_store_is_a_hard_error() {
        let monitor = monitor(Arc::new(PoisonStore), Arc::new(Inbox::default()));
        let err = monitor.notify_time_entries_synced(&[1]).await.unwrap_err();
        assert!(matches!(err, ThresholdError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn crossing_is_delivered_once() {
        let inbox = Arc::new(Inbox::default());
        let monitor = monitor(seeded_store().await, Arc::clone(&inbox));

        let first = monitor.notify_time_entries_synced(&[7]).await.unwrap();
        assert_eq!(first.first_crossings, 1);
        assert_eq!(first.delivery.messages_sent, 1);

        let second = monitor.notify_time_entries_synced(&[7]).await.unwrap();
        assert_eq!(second.first_crossings, 0);
        assert_eq!(inbox.messages.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn disabled_monitor_sends_nothing() {
        let inbox = Arc::new(Inbox::default());
        let monitor = monitor(seeded_store().await, Arc::clone(&inbox));

        assert!(monitor.set_enabled(false));
        let summary = monitor.notify_time_entries_synced(&[7]).await.unwrap();
        assert_eq!(summary.crossings(), 0);
        assert!(inbox.messages.lock().await.is_empty());
    }
}
