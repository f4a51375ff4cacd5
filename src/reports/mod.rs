//! Daily, weekly and monthly time digests.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::slack::{Messenger, SlackMessage, blocks};
use crate::store::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Daily,
    Weekly,
    Monthly,
}

impl ReportKind {
    /// Inclusive date range the report covers, relative to `today`.
    ///
    /// Daily is yesterday, weekly the previous Monday-Sunday week, monthly the
    /// previous calendar month.
    pub fn period(self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        match self {
            ReportKind::Daily => {
                let day = today.pred_opt().unwrap_or(today);
                (day, day)
            }
            ReportKind::Weekly => {
                let this_monday =
                    today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
                (this_monday - Duration::days(7), this_monday - Duration::days(1))
            }
            ReportKind::Monthly => {
                let first_of_month = today.with_day(1).unwrap_or(today);
                let last = first_of_month.pred_opt().unwrap_or(first_of_month);
                (last.with_day(1).unwrap_or(last), last)
            }
        }
    }

    fn title(self) -> &'static str {
        match self {
            ReportKind::Daily => "Daily time report",
            ReportKind::Weekly => "Weekly time report",
            ReportKind::Monthly => "Monthly time report",
        }
    }

    fn describe_period(self, from: NaiveDate, to: NaiveDate) -> String {
        match self {
            ReportKind::Daily => from.format("%A, %d %B %Y").to_string(),
            ReportKind::Weekly => format!("{} – {}", from.format("%d %b"), to.format("%d %b %Y")),
            ReportKind::Monthly => from.format("%B %Y").to_string(),
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReportKind::Daily => "daily",
            ReportKind::Weekly => "weekly",
            ReportKind::Monthly => "monthly",
        })
    }
}

impl FromStr for ReportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" | "day" => Ok(ReportKind::Daily),
            "weekly" | "week" => Ok(ReportKind::Weekly),
            "monthly" | "month" => Ok(ReportKind::Monthly),
            other => Err(format!("unknown report kind: {other}")),
        }
    }
}

/// Builds digests from the local mirror and posts them to Slack.
pub struct Reporter {
    store: Arc<dyn Database>,
    messenger: Arc<dyn Messenger>,
}

impl Reporter {
    pub fn new(store: Arc<dyn Database>, messenger: Arc<dyn Messenger>) -> Self {
        Self { store, messenger }
    }

    pub async fn build(&self, kind: ReportKind, today: NaiveDate) -> Result<Vec<SlackMessage>> {
        let (from, to) = kind.period(today);
        let totals = self.store.user_task_totals(from, to).await?;
        Ok(blocks::digest_messages(
            kind.title(),
            &kind.describe_period(from, to),
            &totals,
        ))
    }

    /// Build and post a digest. Returns the number of messages posted.
    pub async fn send(&self, kind: ReportKind, channel: &str, today: NaiveDate) -> Result<usize> {
        let messages = self.build(kind, today).await?;
        for message in &messages {
            self.messenger
                .post(channel, message)
                .await
                .map_err(Error::from)?;
        }
        info!(%kind, channel, messages = messages.len(), "Report posted");
        Ok(messages.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MessagingError;
    use crate::model::{Task, TimeEntry, TrackedUser};
    use crate::store::LibSqlBackend;
    use crate::threshold::ThresholdCrossing;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn daily_is_yesterday() {
        assert_eq!(
            ReportKind::Daily.period(d("2026-03-01")),
            (d("2026-02-28"), d("2026-02-28"))
        );
    }

    #[test]
    fn weekly_is_previous_monday_to_sunday() {
        // 2026-03-11 is a Wednesday.
        assert_eq!(
            ReportKind::Weekly.period(d("2026-03-11")),
            (d("2026-03-02"), d("2026-03-08"))
        );
        // Run on a Monday: the week that just ended.
        assert_eq!(
            ReportKind::Weekly.period(d("2026-03-09")),
            (d("2026-03-02"), d("2026-03-08"))
        );
    }

    #[test]
    fn monthly_is_previous_calendar_month() {
        assert_eq!(
            ReportKind::Monthly.period(d("2026-03-01")),
            (d("2026-02-01"), d("2026-02-28"))
        );
        assert_eq!(
            ReportKind::Monthly.period(d("2026-01-15")),
            (d("2025-12-01"), d("2025-12-31"))
        );
    }

    #[test]
    fn kind_parses_from_command_text() {
        assert_eq!("Weekly".parse::<ReportKind>(), Ok(ReportKind::Weekly));
        assert_eq!(" day ".parse::<ReportKind>(), Ok(ReportKind::Daily));
        assert!("yearly".parse::<ReportKind>().is_err());
    }

    #[derive(Default)]
    struct Channel {
        posted: Mutex<Vec<(String, SlackMessage)>>,
    }

    #[async_trait]
    impl Messenger for Channel {
        async fn send_message(
            &self,
            _recipient: &str,
            _project_label: &str,
            _crossings: &[ThresholdCrossing],
        ) -> std::result::Result<(), MessagingError> {
            Ok(())
        }

        async fn post(
            &self,
            channel: &str,
            message: &SlackMessage,
        ) -> std::result::Result<(), MessagingError> {
            self.posted
                .lock()
                .await
                .push((channel.to_string(), message.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn daily_report_covers_yesterday_only() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store
            .upsert_task(&Task {
                id: 1,
                parent_id: None,
                name: "Design".into(),
                archived: false,
            })
            .await
            .unwrap();
        store
            .upsert_user(&TrackedUser {
                id: 3,
                email: "ana@example.com".into(),
                display_name: "Ana".into(),
            })
            .await
            .unwrap();
        for (id, date, secs) in [(1, "2026-03-01", 5400), (2, "2026-03-02", 999)] {
            store
                .upsert_time_entry(&TimeEntry {
                    id,
                    task_id: 1,
                    user_id: 3,
                    date: d(date),
                    duration_secs: secs,
                    description: String::new(),
                })
                .await
                .unwrap();
        }

        let channel = Arc::new(Channel::default());
        let reporter = Reporter::new(store, channel.clone());
        let sent = reporter
            .send(ReportKind::Daily, "C1", d("2026-03-02"))
            .await
            .unwrap();

        assert_eq!(sent, 1);
        let posted = channel.posted.lock().await;
        assert_eq!(posted[0].0, "C1");
        assert!(posted[0].1.text.contains("1h 30m"));
    }

    #[tokio::test]
    async fn empty_period_still_posts() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let channel = Arc::new(Channel::default());
        let reporter = Reporter::new(store, channel.clone());

        let messages = reporter.build(ReportKind::Monthly, d("2026-03-05")).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].text.contains("no time tracked"));
    }
}
