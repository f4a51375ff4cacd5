//! TimeCamp: the read-only source of tasks, users and time entries.

pub mod client;
pub mod types;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::SourceError;
use crate::model::{Task, TimeEntry, TrackedUser};

pub use client::TimeCampClient;

/// Read-only view of the time-tracking source.
#[async_trait]
pub trait TimeSource: Send + Sync {
    async fn fetch_tasks(&self) -> Result<Vec<Task>, SourceError>;

    async fn fetch_users(&self) -> Result<Vec<TrackedUser>, SourceError>;

    /// Entries dated within `[from, to]`, inclusive.
    async fn fetch_time_entries(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<TimeEntry>, SourceError>;
}
