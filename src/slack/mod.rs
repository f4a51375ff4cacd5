//! Slack delivery: Web API client, block formatting and the `Messenger` seam.

pub mod blocks;
pub mod client;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::MessagingError;
use crate::threshold::ThresholdCrossing;

pub use client::SlackClient;

/// A message ready for `chat.postMessage`: fallback text plus Block Kit blocks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlackMessage {
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<serde_json::Value>,
}

impl SlackMessage {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            blocks: Vec::new(),
        }
    }
}

/// Outbound messaging used by the threshold fan-out and digests.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Deliver one project's threshold alerts to a recipient.
    async fn send_message(
        &self,
        recipient: &str,
        project_label: &str,
        crossings: &[ThresholdCrossing],
    ) -> Result<(), MessagingError>;

    /// Post an already formatted message to a channel.
    async fn post(&self, channel: &str, message: &SlackMessage) -> Result<(), MessagingError>;
}
