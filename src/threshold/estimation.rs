//! Estimation parsing: `[A-B]` hour ranges embedded in task names.

use std::sync::LazyLock;

use regex::Regex;

static ESTIMATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\s*(\d+(?:\.\d+)?)\s*-\s*(\d+(?:\.\d+)?)\s*\]")
        .expect("estimation pattern is valid")
});

/// An optimistic/pessimistic hour range. The pessimistic bound is the budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimation {
    pub optimistic_hours: f64,
    pub pessimistic_hours: f64,
    pub budget_secs: i64,
}

/// Why a task name carries no usable estimation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EstimationError {
    #[error("no [A-B] estimation in task name")]
    Missing,

    #[error("estimation lower bound {low} exceeds upper bound {high}")]
    Inverted { low: f64, high: f64 },

    #[error("estimation budget is zero")]
    ZeroBudget,
}

impl Estimation {
    /// Extract the first `[A-B]` range from a task name.
    pub fn parse(task_name: &str) -> Result<Self, EstimationError> {
        let caps = ESTIMATION_RE
            .captures(task_name)
            .ok_or(EstimationError::Missing)?;

        let low: f64 = caps[1].parse().map_err(|_| EstimationError::Missing)?;
        let high: f64 = caps[2].parse().map_err(|_| EstimationError::Missing)?;

        if low > high {
            return Err(EstimationError::Inverted { low, high });
        }

        let budget_secs = (high * 3600.0).round() as i64;
        if budget_secs <= 0 {
            return Err(EstimationError::ZeroBudget);
        }

        Ok(Self {
            optimistic_hours: low,
            pessimistic_hours: high,
            budget_secs,
        })
    }

    /// Percent of budget used by `total_secs` of cumulative time. Not clamped.
    pub fn usage_percent(&self, total_secs: i64) -> f64 {
        total_secs as f64 / self.budget_secs as f64 * 100.0
    }
}
