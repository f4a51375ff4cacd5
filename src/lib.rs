//! TimeCamp Pulse: mirrors TimeCamp time tracking into libSQL and posts
//! budget alerts and time digests to Slack.

pub mod config;
pub mod error;
pub mod model;
pub mod reports;
pub mod routes;
pub mod scheduler;
pub mod slack;
pub mod store;
pub mod sync;
pub mod threshold;
pub mod timecamp;

pub use error::{Error, Result};
