//! Service configuration, loaded from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `TIMECAMP_API_TOKEN` | required |
//! | `TIMECAMP_API_URL` | `https://app.timecamp.com/third_party/api` |
//! | `SLACK_BOT_TOKEN` | required |
//! | `SLACK_API_URL` | `https://slack.com/api` |
//! | `SLACK_REPORT_CHANNEL` | unset (scheduled digests disabled) |
//! | `SLACK_VERIFICATION_TOKEN` | unset (slash commands unauthenticated) |
//! | `DATABASE_PATH` | `./data/timecamp-pulse.db` |
//! | `PORT` | `8080` |
//! | `SYNC_CRON` | `0 */10 * * * *` |
//! | `FULL_SYNC_CRON` | `0 0 3 * * *` |
//! | `DAILY_REPORT_CRON` | `0 0 8 * * Tue-Sat` |
//! | `WEEKLY_REPORT_CRON` | `0 0 8 * * Mon` |
//! | `MONTHLY_REPORT_CRON` | `0 0 8 1 * *` |
//! | `SYNC_LOOKBACK_DAYS` | `2` |
//! | `FULL_SYNC_LOOKBACK_DAYS` | `90` |
//! | `ORPHAN_RETENTION_DAYS` | `30` |
//! | `THRESHOLDS_ENABLED` | `true` |
//! | `NOTIFY_PACING_MS` | `1000` |
//! | `QUERY_TIMEOUT_SECS` | `15` |
//! | `PERSISTENT_WINDOW_MINUTES` | `60` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use cron::Schedule;
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::scheduler::parse_schedule;
use crate::sync::SyncConfig;
use crate::threshold::DetectorConfig;

pub const DEFAULT_TIMECAMP_API_URL: &str = "https://app.timecamp.com/third_party/api";
pub const DEFAULT_SLACK_API_URL: &str = "https://slack.com/api";
pub const DEFAULT_DATABASE_PATH: &str = "./data/timecamp-pulse.db";
pub const DEFAULT_PORT: u16 = 8080;

/// Cron schedules for the background jobs.
#[derive(Debug, Clone)]
pub struct Schedules {
    pub sync: Schedule,
    pub full_sync: Schedule,
    pub daily_report: Schedule,
    pub weekly_report: Schedule,
    pub monthly_report: Schedule,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub timecamp_api_token: SecretString,
    pub timecamp_api_url: String,
    pub slack_bot_token: SecretString,
    pub slack_api_url: String,
    pub slack_report_channel: Option<String>,
    pub slack_verification_token: Option<SecretString>,
    pub database_path: PathBuf,
    pub port: u16,
    pub schedules: Schedules,
    pub sync: SyncConfig,
    pub detector: DetectorConfig,
    pub thresholds_enabled: bool,
    pub notify_pacing: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.into()));
        let schedule = |key: &str, default: &str| {
            parse_schedule(key, get(key).as_deref().unwrap_or(default))
        };

        let detector = DetectorConfig {
            window_days: parse_or(&get, "SYNC_LOOKBACK_DAYS", 2)?,
            query_timeout: Duration::from_secs(parse_or(&get, "QUERY_TIMEOUT_SECS", 15)?),
            persistent_window: Duration::from_secs(
                60 * parse_or::<u64>(&get, "PERSISTENT_WINDOW_MINUTES", 60)?,
            ),
        };

        let config = Self {
            timecamp_api_token: SecretString::from(required("TIMECAMP_API_TOKEN")?),
            timecamp_api_url: get("TIMECAMP_API_URL")
                .unwrap_or_else(|| DEFAULT_TIMECAMP_API_URL.into()),
            slack_bot_token: SecretString::from(required("SLACK_BOT_TOKEN")?),
            slack_api_url: get("SLACK_API_URL").unwrap_or_else(|| DEFAULT_SLACK_API_URL.into()),
            slack_report_channel: get("SLACK_REPORT_CHANNEL"),
            slack_verification_token: get("SLACK_VERIFICATION_TOKEN").map(SecretString::from),
            database_path: get("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            port: parse_or(&get, "PORT", DEFAULT_PORT)?,
            schedules: Schedules {
                sync: schedule("SYNC_CRON", "0 */10 * * * *")?,
                full_sync: schedule("FULL_SYNC_CRON", "0 0 3 * * *")?,
                daily_report: schedule("DAILY_REPORT_CRON", "0 0 8 * * Tue-Sat")?,
                weekly_report: schedule("WEEKLY_REPORT_CRON", "0 0 8 * * Mon")?,
                monthly_report: schedule("MONTHLY_REPORT_CRON", "0 0 8 1 * *")?,
            },
            sync: SyncConfig {
                lookback_days: detector.window_days,
                full_lookback_days: parse_or(&get, "FULL_SYNC_LOOKBACK_DAYS", 90)?,
                orphan_retention_days: parse_or(&get, "ORPHAN_RETENTION_DAYS", 30)?,
            },
            detector,
            thresholds_enabled: parse_bool(&get, "THRESHOLDS_ENABLED", true)?,
            notify_pacing: Duration::from_millis(parse_or(&get, "NOTIFY_PACING_MS", 1000)?),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.lookback_days == 0 {
            return Err(invalid("SYNC_LOOKBACK_DAYS", "must be at least 1"));
        }
        if self.sync.full_lookback_days < self.sync.lookback_days {
            return Err(invalid(
                "FULL_SYNC_LOOKBACK_DAYS",
                "must not be shorter than SYNC_LOOKBACK_DAYS",
            ));
        }
        if self.detector.query_timeout.is_zero() {
            return Err(invalid("QUERY_TIMEOUT_SECS", "must be greater than 0"));
        }
        if self.detector.persistent_window.is_zero() {
            return Err(invalid("PERSISTENT_WINDOW_MINUTES", "must be greater than 0"));
        }
        for (key, url) in [
            ("TIMECAMP_API_URL", &self.timecamp_api_url),
            ("SLACK_API_URL", &self.slack_api_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid(key, "must be an http(s) URL"));
            }
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        message: message.into(),
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.into(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, "expected true or false")),
        },
    }
}
