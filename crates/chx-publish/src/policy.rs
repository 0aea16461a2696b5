//! Retry policy and per-subscriber options.

use crate::error::ErrorCategory;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Backoff table in seconds: first deferral waits 30s, second 300s, third 6h.
pub const DEFAULT_RETRY_INTERVALS: [u64; 3] = [30, 300, 21_600];

pub const DEFAULT_MAX_VALIDATION_ERRORS: u32 = 10;
pub const DEFAULT_MAX_INFRASTRUCTURE_ERRORS: u32 = 3;

/// Ordered backoff table plus an optional hard cap on attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub intervals: Vec<u64>,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            intervals: DEFAULT_RETRY_INTERVALS.to_vec(),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(intervals: Vec<u64>) -> Self {
        Self {
            intervals,
            max_attempts: None,
        }
    }

    /// True once `attempts` failed attempts leave nothing to retry.
    pub fn exhausted(&self, attempts: u32) -> bool {
        if attempts as usize > self.intervals.len() {
            return true;
        }
        matches!(self.max_attempts, Some(max) if attempts >= max)
    }

    /// Next retry time after the `attempts`-th failure (1-based), or `None`
    /// when the policy is exhausted. An interval too large to represent as a
    /// timestamp also counts as exhausted.
    pub fn next_try(&self, attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempts == 0 || self.exhausted(attempts) {
            return None;
        }
        let secs = *self.intervals.get(attempts as usize - 1)?;
        let step = Duration::try_seconds(i64::try_from(secs).ok()?)?;
        now.checked_add_signed(step)
    }
}

/// Options stored in `subscribers.config`. Unknown keys are kept for the
/// delivery strategy (e.g. `url` for webhooks).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_intervals: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inter_attempt_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_validation_errors: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_infrastructure_errors: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SubscriberConfig {
    /// Lenient parse: a malformed or non-object config yields defaults.
    pub fn from_json(v: &Value) -> Self {
        serde_json::from_value(v.clone()).unwrap_or_default()
    }

    pub fn retry_policy(&self, default_intervals: &[u64]) -> RetryPolicy {
        RetryPolicy {
            intervals: self
                .retry_intervals
                .clone()
                .unwrap_or_else(|| default_intervals.to_vec()),
            max_attempts: self.max_attempts,
        }
    }

    pub fn batch_size_or(&self, default: u32) -> u32 {
        self.batch_size.filter(|n| *n > 0).unwrap_or(default)
    }

    pub fn inter_attempt_delay_ms_or(&self, default: u64) -> u64 {
        self.inter_attempt_delay_ms.unwrap_or(default)
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    pub fn extra_u64(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(|v| v.as_u64())
    }

    pub fn error_budget(&self) -> ErrorBudget {
        ErrorBudget::new(
            self.max_validation_errors
                .unwrap_or(DEFAULT_MAX_VALIDATION_ERRORS),
            self.max_infrastructure_errors
                .unwrap_or(DEFAULT_MAX_INFRASTRUCTURE_ERRORS),
        )
    }
}

/// Per-batch error tally against a subscriber's thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBudget {
    max_validation: u32,
    max_infrastructure: u32,
    pub validation: u32,
    pub infrastructure: u32,
    pub other: u32,
}

impl ErrorBudget {
    pub fn new(max_validation: u32, max_infrastructure: u32) -> Self {
        Self {
            max_validation,
            max_infrastructure,
            validation: 0,
            infrastructure: 0,
            other: 0,
        }
    }

    pub fn record(&mut self, category: ErrorCategory) {
        match category {
            ErrorCategory::Validation => self.validation += 1,
            ErrorCategory::Infrastructure => self.infrastructure += 1,
            _ => self.other += 1,
        }
    }

    /// The batch must stop once either threshold is crossed.
    pub fn exceeded(&self) -> bool {
        self.validation > self.max_validation || self.infrastructure > self.max_infrastructure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_overrides_and_keeps_extra_keys() {
        let cfg = SubscriberConfig::from_json(&json!({
            "retry_intervals": [5, 10],
            "max_attempts": 2,
            "url": "http://localhost:9/hook"
        }));
        let p = cfg.retry_policy(&DEFAULT_RETRY_INTERVALS);
        assert_eq!(p.intervals, vec![5, 10]);
        assert!(p.exhausted(2));
        assert!(!p.exhausted(1));
        assert_eq!(cfg.extra_str("url"), Some("http://localhost:9/hook"));
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        let cfg = SubscriberConfig::from_json(&json!("nope"));
        assert_eq!(cfg.retry_policy(&DEFAULT_RETRY_INTERVALS), RetryPolicy::default());
        assert_eq!(cfg.batch_size_or(100), 100);
    }

    #[test]
    fn oversized_interval_exhausts_instead_of_overflowing() {
        let now = Utc::now();
        let huge = RetryPolicy::new(vec![100_000_000_000_000_000]);
        assert_eq!(huge.next_try(1, now), None);

        // past i64::MAX seconds; must not wrap into the past
        let wrapping = RetryPolicy::new(vec![u64::MAX]);
        assert_eq!(wrapping.next_try(1, now), None);

        // the largest chrono accepts, but not from today
        let edge = RetryPolicy::new(vec![i64::MAX as u64 / 1000]);
        assert_eq!(edge.next_try(1, now), None);

        let fine = RetryPolicy::new(vec![30]);
        assert_eq!(fine.next_try(1, now), Some(now + Duration::seconds(30)));
    }

    #[test]
    fn budget_trips_after_threshold() {
        let mut b = ErrorBudget::new(1, 2);
        b.record(ErrorCategory::Infrastructure);
        b.record(ErrorCategory::Infrastructure);
        assert!(!b.exceeded());
        b.record(ErrorCategory::Infrastructure);
        assert!(b.exceeded());
    }
}
