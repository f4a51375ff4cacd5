//! Slack Web API client: `chat.postMessage` over reqwest.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Messenger, SlackMessage, blocks};
use crate::error::MessagingError;
use crate::threshold::ThresholdCrossing;

/// Timeout for a single Slack API call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Bot-token client for the Slack Web API.
pub struct SlackClient {
    api_url: String,
    bot_token: SecretString,
    client: reqwest::Client,
}

impl SlackClient {
    pub fn new(api_url: impl Into<String>, bot_token: SecretString) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            bot_token,
            client,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{method}", self.api_url)
    }

    /// Post a message to a channel or user id. No retries: callers decide.
    pub async fn post_message(
        &self,
        channel: &str,
        message: &SlackMessage,
    ) -> Result<(), MessagingError> {
        let mut body = serde_json::json!({
            "channel": channel,
            "text": message.text,
        });
        if !message.blocks.is_empty() {
            body["blocks"] = serde_json::Value::Array(message.blocks.clone());
        }

        let resp = self
            .client
            .post(self.api_url("chat.postMessage"))
            .bearer_auth(self.bot_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| MessagingError::SendFailed {
                recipient: channel.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            warn!(channel, ?retry_after, "Slack rate limited the message");
            return Err(MessagingError::RateLimited {
                recipient: channel.to_string(),
                retry_after,
            });
        }

        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(MessagingError::SendFailed {
                recipient: channel.to_string(),
                reason: format!("HTTP {status}: {text}"),
            });
        }

        let parsed: SlackResponse = resp.json().await.map_err(|e| MessagingError::SendFailed {
            recipient: channel.to_string(),
            reason: format!("unreadable response: {e}"),
        })?;

        if !parsed.ok {
            return Err(MessagingError::Rejected {
                recipient: channel.to_string(),
                error: parsed.error.unwrap_or_else(|| "unknown_error".to_string()),
            });
        }

        debug!(channel, "Slack message posted");
        Ok(())
    }
}

#[async_trait]
impl Messenger for SlackClient {
    async fn send_message(
        &self,
        recipient: &str,
        project_label: &str,
        crossings: &[ThresholdCrossing],
    ) -> Result<(), MessagingError> {
        let message = blocks::threshold_alert_message(project_label, crossings);
        self.post_message(recipient, &message).await
    }

    async fn post(&self, channel: &str, message: &SlackMessage) -> Result<(), MessagingError> {
        self.post_message(channel, message).await
    }
}
