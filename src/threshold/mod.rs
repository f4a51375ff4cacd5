//! Threshold engine: budget parsing, crossing detection, ledger-backed dedup
//! and per-recipient notification fan-out.

pub mod aggregation;
pub mod detector;
pub mod estimation;
pub mod fanout;
pub mod level;
pub mod monitor;

pub use detector::{CrossingKind, DetectorConfig, ThresholdCrossing, ThresholdDetector};
pub use estimation::Estimation;
pub use fanout::{FanoutReport, NotificationFanout, RecipientScope};
pub use level::{LedgerOutcome, ThresholdLevel, ThresholdRecord};
pub use monitor::{ThresholdMonitor, ThresholdRunSummary};
