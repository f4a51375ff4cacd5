//! HTTP client for the TimeCamp third-party API.
//!
//! Every request is retried with exponential backoff and jitter on
//! transport errors, HTTP 429 and 5xx:
//! `delay = min(2^attempt * 250ms + random(0, 250ms), 10s)`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use super::TimeSource;
use super::types::{ApiEntry, ApiTask, ApiUser};
use crate::error::SourceError;
use crate::model::{Task, TimeEntry, TrackedUser};

/// Timeout for a single TimeCamp request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Attempts per request, including the first.
const MAX_ATTEMPTS: u32 = 4;

const BASE_BACKOFF_MS: u64 = 250;
const MAX_BACKOFF_MS: u64 = 10_000;
const MAX_JITTER_MS: u64 = 250;

/// Longest date range requested from `/entries` in one call.
pub const MAX_ENTRY_RANGE_DAYS: i64 = 7;

pub struct TimeCampClient {
    base_url: String,
    token: SecretString,
    client: reqwest::Client,
}

/// Whether a failed attempt is worth repeating.
enum Attempt {
    Retry(SourceError),
    Fail(SourceError),
}

impl TimeCampClient {
    pub fn new(base_url: impl Into<String>, token: SecretString) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let mut last_error = String::new();

        for attempt in 0..MAX_ATTEMPTS {
            match self.try_get(endpoint, query).await {
                Ok(value) => return Ok(value),
                Err(Attempt::Fail(e)) => return Err(e),
                Err(Attempt::Retry(e)) => {
                    last_error = e.to_string();
                    if attempt < MAX_ATTEMPTS - 1 {
                        let delay = backoff_delay(attempt);
                        warn!(
                            endpoint,
                            attempt = attempt + 1,
                            max_attempts = MAX_ATTEMPTS,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "TimeCamp request failed, retrying"
                        );
                        sleep(delay).await;
                    } else {
                        error!(endpoint, attempts = MAX_ATTEMPTS, error = %e, "TimeCamp request failed, giving up");
                    }
                }
            }
        }

        Err(SourceError::RetriesExhausted {
            endpoint: endpoint.to_string(),
            attempts: MAX_ATTEMPTS,
            last_error,
        })
    }

    async fn try_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, Attempt> {
        let url = format!("{}/{endpoint}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(self.token.expose_secret())
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[("format", "json")])
            .query(query)
            .send()
            .await
            .map_err(|e| {
                Attempt::Retry(SourceError::RequestFailed {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = SourceError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            };
            return Err(
                if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    Attempt::Retry(err)
                } else {
                    Attempt::Fail(err)
                },
            );
        }

        resp.json::<T>().await.map_err(|e| {
            Attempt::Fail(SourceError::InvalidResponse {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
        })
    }
}

#[async_trait]
impl TimeSource for TimeCampClient {
    async fn fetch_tasks(&self) -> Result<Vec<Task>, SourceError> {
        // `/tasks` answers with an object keyed by task id; an account with
        // no tasks gets `[]` instead.
        let raw: serde_json::Value = self.get_json("tasks", &[]).await?;
        let tasks = match raw {
            serde_json::Value::Object(map) => {
                serde_json::from_value::<HashMap<String, ApiTask>>(serde_json::Value::Object(map))
            }
            serde_json::Value::Array(items) => {
                serde_json::from_value::<Vec<ApiTask>>(serde_json::Value::Array(items))
                    .map(|v| v.into_iter().map(|t| (t.task_id.to_string(), t)).collect())
            }
            other => {
                return Err(SourceError::InvalidResponse {
                    endpoint: "tasks".into(),
                    reason: format!("unexpected payload: {other}"),
                });
            }
        }
        .map_err(|e| SourceError::InvalidResponse {
            endpoint: "tasks".into(),
            reason: e.to_string(),
        })?;

        let mut tasks: Vec<Task> = tasks.into_values().map(Task::from).collect();
        tasks.sort_by_key(|t| t.id);
        debug!(count = tasks.len(), "Fetched TimeCamp tasks");
        Ok(tasks)
    }

    async fn fetch_users(&self) -> Result<Vec<TrackedUser>, SourceError> {
        let users: Vec<ApiUser> = self.get_json("users", &[]).await?;
        debug!(count = users.len(), "Fetched TimeCamp users");
        Ok(users.into_iter().map(TrackedUser::from).collect())
    }

    async fn fetch_time_entries(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<TimeEntry>, SourceError> {
        let mut entries = Vec::new();
        for (chunk_from, chunk_to) in date_chunks(from, to, MAX_ENTRY_RANGE_DAYS) {
            let query = [
                ("from", chunk_from.to_string()),
                ("to", chunk_to.to_string()),
            ];
            let chunk: Vec<ApiEntry> = self.get_json("entries", &query).await?;
            debug!(%chunk_from, %chunk_to, count = chunk.len(), "Fetched TimeCamp entries");
            entries.extend(chunk.into_iter().map(TimeEntry::from));
        }
        Ok(entries)
    }
}

/// Split `[from, to]` into inclusive ranges of at most `days` days.
pub fn date_chunks(from: NaiveDate, to: NaiveDate, days: i64) -> Vec<(NaiveDate, NaiveDate)> {
    let step = chrono::Duration::days(days.max(1) - 1);
    let mut chunks = Vec::new();
    let mut start = from;
    while start <= to {
        let end = (start + step).min(to);
        chunks.push((start, end));
        match end.succ_opt() {
            Some(next) => start = next,
            None => break,
        }
    }
    chunks
}

fn backoff_delay(attempt: u32) -> Duration {
    let exponential_ms = BASE_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt));
    let jitter_ms = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
    Duration::from_millis(exponential_ms.saturating_add(jitter_ms).min(MAX_BACKOFF_MS))
}
