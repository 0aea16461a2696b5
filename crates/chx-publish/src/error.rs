//! Delivery error categorization.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse class of a subscriber-reported failure. Drives operator policy
/// (batch aborts), never the state machine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Infrastructure,
    Data,
    RateLimit,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Infrastructure => "infrastructure",
            ErrorCategory::Data => "data",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(ErrorCategory::Validation),
            "infrastructure" => Some(ErrorCategory::Infrastructure),
            "data" => Some(ErrorCategory::Data),
            "rate_limit" => Some(ErrorCategory::RateLimit),
            "unknown" => Some(ErrorCategory::Unknown),
            _ => None,
        }
    }

    /// Default reaction when a subscriber does not override it.
    pub fn default_action(&self) -> ErrorAction {
        match self {
            ErrorCategory::Validation | ErrorCategory::Data => ErrorAction::Fail,
            ErrorCategory::Infrastructure | ErrorCategory::Unknown => ErrorAction::Defer,
            ErrorCategory::RateLimit => ErrorAction::StopBatch,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the dispatcher does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Record a deferral and stop the whole batch for this subscriber.
    StopBatch,
    /// Record a deferral; the record is retried after its backoff.
    Defer,
    /// Record a permanent failure.
    Fail,
}

/// Classify a failure from its status code, falling back to its text.
pub fn categorize(message: &str, status_code: Option<i32>) -> ErrorCategory {
    if let Some(code) = status_code {
        match code {
            429 => return ErrorCategory::RateLimit,
            400 | 422 => return ErrorCategory::Validation,
            404 | 409 | 410 => return ErrorCategory::Data,
            500..=599 => return ErrorCategory::Infrastructure,
            _ => {}
        }
    }

    let m = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

    if has(&["rate limit", "too many requests", "throttl"]) {
        ErrorCategory::RateLimit
    } else if has(&["validation", "invalid", "unprocessable"]) {
        ErrorCategory::Validation
    } else if has(&["not found", "conflict", "missing", "duplicate"]) {
        ErrorCategory::Data
    } else if has(&[
        "timeout",
        "timed out",
        "connection",
        "unavailable",
        "dns",
        "refused",
        "reset by peer",
    ]) {
        ErrorCategory::Infrastructure
    } else {
        ErrorCategory::Unknown
    }
}

/// Failure reported by a delivery strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError {
    pub message: String,
    pub status_code: Option<i32>,
    pub category: ErrorCategory,
}

impl DeliveryError {
    /// Categorized from the message and status code.
    pub fn new(message: impl Into<String>, status_code: Option<i32>) -> Self {
        let message = message.into();
        let category = categorize(&message, status_code);
        Self {
            message,
            status_code,
            category,
        }
    }

    pub fn with_category(
        message: impl Into<String>,
        status_code: Option<i32>,
        category: ErrorCategory,
    ) -> Self {
        Self {
            message: message.into(),
            status_code,
            category,
        }
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (status {code}, {})", self.message, self.category),
            None => write!(f, "{} ({})", self.message, self.category),
        }
    }
}

impl std::error::Error for DeliveryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_wins_over_message() {
        assert_eq!(
            categorize("connection reset", Some(422)),
            ErrorCategory::Validation
        );
        assert_eq!(categorize("whatever", Some(503)), ErrorCategory::Infrastructure);
        assert_eq!(categorize("slow down", Some(429)), ErrorCategory::RateLimit);
    }

    #[test]
    fn message_fallback() {
        assert_eq!(
            categorize("operation timed out", None),
            ErrorCategory::Infrastructure
        );
        assert_eq!(categorize("record not found", Some(200)), ErrorCategory::Data);
        assert_eq!(categorize("boom", None), ErrorCategory::Unknown);
    }

    #[test]
    fn category_round_trips_through_str() {
        for c in [
            ErrorCategory::Validation,
            ErrorCategory::Infrastructure,
            ErrorCategory::Data,
            ErrorCategory::RateLimit,
            ErrorCategory::Unknown,
        ] {
            assert_eq!(ErrorCategory::parse(c.as_str()), Some(c));
        }
    }
}
