//! Cron-driven background jobs.
//!
//! Schedules use the six-field `cron` syntax (seconds first) and are
//! evaluated in UTC.

use std::future::Future;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::{error, info};

use crate::error::ConfigError;

/// Parse a cron expression, naming the config key on failure.
pub fn parse_schedule(key: &str, expr: &str) -> Result<Schedule, ConfigError> {
    Schedule::from_str(expr).map_err(|e| ConfigError::InvalidSchedule {
        key: key.to_string(),
        message: format!("{expr:?}: {e}"),
    })
}

/// Next fire time strictly after `after`.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Run `job` at every fire time of `schedule` until the runtime shuts down.
///
/// Runs never overlap: the next fire time is computed after the previous run
/// returns. A failed run is logged and the schedule carries on.
pub fn spawn_cron_job<F, Fut>(
    name: &'static str,
    schedule: Schedule,
    job: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let Some(at) = next_fire(&schedule, now) else {
                info!(job = name, "Cron schedule has no further fire times, stopping");
                return;
            };
            let wait = (at - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            info!(job = name, scheduled_for = %at, "Cron job firing");
            if let Err(e) = job().await {
                error!(job = name, error = %e, "Cron job failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn default_schedules_parse() {
        for expr in [
            "0 */10 * * * *",
            "0 0 3 * * *",
            "0 0 8 * * Tue-Sat",
            "0 0 8 * * Mon",
            "0 0 8 1 * *",
        ] {
            parse_schedule("TEST_CRON", expr).unwrap();
        }
    }

    #[test]
    fn invalid_schedule_names_key() {
        let err = parse_schedule("SYNC_CRON", "every ten minutes").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSchedule { ref key, .. } if key == "SYNC_CRON"));
    }

    #[test]
    fn next_fire_respects_weekdays() {
        let schedule = parse_schedule("WEEKLY", "0 0 8 * * Mon").unwrap();
        // Wednesday 2026-03-11 12:00 UTC.
        let after = Utc.with_ymd_and_hms(2026, 3, 11, 12, 0, 0).unwrap();
        let next = next_fire(&schedule, after).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 8);
        assert_eq!(next.day(), 16);
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let schedule = parse_schedule("SYNC", "0 */10 * * * *").unwrap();
        let on_the_dot = Utc.with_ymd_and_hms(2026, 3, 11, 12, 10, 0).unwrap();
        let next = next_fire(&schedule, on_the_dot).unwrap();
        assert_eq!(next.minute(), 20);
    }

    #[tokio::test]
    async fn job_runs_on_schedule() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let schedule = parse_schedule("EVERY_SECOND", "* * * * * *").unwrap();
        let handle = spawn_cron_job("test", schedule, move || {
            let tx = tx.clone();
            async move {
                tx.send(()).ok();
                Ok::<(), anyhow::Error>(())
            }
        });

        tokio::time::timeout(std::time::Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        handle.abort();
    }
}
