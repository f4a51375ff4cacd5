//! Threshold levels and ledger record types.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A percent-of-budget checkpoint at which a one-time alert is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ThresholdLevel {
    Half,
    Seventy,
    Ninety,
    Full,
}

impl ThresholdLevel {
    /// Evaluation order: highest first.
    pub const DESCENDING: [ThresholdLevel; 4] = [
        ThresholdLevel::Full,
        ThresholdLevel::Ninety,
        ThresholdLevel::Seventy,
        ThresholdLevel::Half,
    ];

    pub fn percent(self) -> i64 {
        match self {
            ThresholdLevel::Half => 50,
            ThresholdLevel::Seventy => 70,
            ThresholdLevel::Ninety => 90,
            ThresholdLevel::Full => 100,
        }
    }

    pub fn from_percent(percent: i64) -> Option<Self> {
        Self::DESCENDING
            .into_iter()
            .find(|level| level.percent() == percent)
    }

    /// The highest level that `percentage` has reached, if any.
    pub fn highest_reached(percentage: f64) -> Option<Self> {
        Self::DESCENDING
            .into_iter()
            .find(|level| percentage >= level.percent() as f64)
    }

    pub fn is_max(self) -> bool {
        self == ThresholdLevel::Full
    }
}

impl fmt::Display for ThresholdLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.percent())
    }
}

/// One row of the notification ledger, keyed by `(task_id, level)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRecord {
    pub task_id: i64,
    pub level: ThresholdLevel,
    pub percentage: f64,
    pub recorded_at: DateTime<Utc>,
    pub entry_date: NaiveDate,
}

/// Result of the transactional check-and-record on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// The level was new for this task and is now recorded.
    Recorded,
    /// The level was already the highest recorded one; its row was refreshed.
    Refreshed,
    /// A higher level is already recorded; nothing was written.
    Superseded { recorded: ThresholdLevel },
}
