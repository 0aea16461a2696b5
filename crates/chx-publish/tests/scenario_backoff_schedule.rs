//! Scenario: deferral backoff schedule.
//!
//! # Invariants under test
//! - With intervals [30, 300, 21600], three consecutive deferrals set
//!   `next_try` 30s, 300s and 21600s after the failure time.
//! - The fourth deferral moves the record to `failed` with no `next_try`.
//! - `should_retry` is true only for a deferred record whose time has come.
//! - A custom table and `max_attempts` from the subscriber config override
//!   the default table.

use chrono::{DateTime, Duration, TimeZone, Utc};
use chx_publish::{
    DeliveryError, DeliveryEvent, DeliveryRecord, DeliveryStatus, ErrorCategory, RetryPolicy,
    SubscriberConfig, DEFAULT_RETRY_INTERVALS,
};
use serde_json::json;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
}

fn timeout() -> DeliveryEvent {
    DeliveryEvent::Deferred {
        error: DeliveryError::new("upstream timed out", Some(504)),
    }
}

#[test]
fn three_deferrals_follow_table_then_fourth_fails() {
    let policy = RetryPolicy::new(DEFAULT_RETRY_INTERVALS.to_vec());
    let mut r = DeliveryRecord::pending();

    let expected = [30, 300, 21_600];
    let mut now = t0();
    for (i, secs) in expected.iter().enumerate() {
        r.apply(&DeliveryEvent::Dispatch, now, &policy).unwrap();
        let status = r.apply(&timeout(), now, &policy).unwrap();
        assert_eq!(status, DeliveryStatus::Deferred, "deferral {}", i + 1);
        assert_eq!(r.attempts, (i + 1) as u32);
        assert_eq!(r.next_try, Some(now + Duration::seconds(*secs)));
        assert_eq!(r.error_type, Some(ErrorCategory::Infrastructure));
        assert_eq!(r.last_response_code, Some(504));

        assert!(!r.should_retry(now));
        now += Duration::seconds(*secs);
        assert!(r.should_retry(now));
    }

    r.apply(&DeliveryEvent::Dispatch, now, &policy).unwrap();
    let status = r.apply(&timeout(), now, &policy).unwrap();
    assert_eq!(status, DeliveryStatus::Failed);
    assert_eq!(r.attempts, 4);
    assert_eq!(r.next_try, None);
    assert!(!r.should_retry(now + Duration::days(365)));
    assert!(!r.is_due(now));
}

#[test]
fn deferral_straight_from_pending_counts_as_attempt() {
    let policy = RetryPolicy::default();
    let mut r = DeliveryRecord::pending();
    r.apply(&timeout(), t0(), &policy).unwrap();
    assert_eq!(r.status, DeliveryStatus::Deferred);
    assert_eq!(r.attempts, 1);
}

#[test]
fn subscriber_config_overrides_table_and_caps_attempts() {
    let cfg = SubscriberConfig::from_json(&json!({
        "retry_intervals": [5, 10, 20],
        "max_attempts": 2
    }));
    let policy = cfg.retry_policy(&DEFAULT_RETRY_INTERVALS);
    let mut r = DeliveryRecord::pending();

    r.apply(&timeout(), t0(), &policy).unwrap();
    assert_eq!(r.next_try, Some(t0() + Duration::seconds(5)));

    r.apply(&timeout(), t0(), &policy).unwrap();
    assert_eq!(r.status, DeliveryStatus::Failed);
    assert_eq!(r.next_try, None);
}

#[test]
fn empty_table_fails_on_first_deferral() {
    let policy = RetryPolicy::new(Vec::new());
    let mut r = DeliveryRecord::pending();
    r.apply(&timeout(), t0(), &policy).unwrap();
    assert_eq!(r.status, DeliveryStatus::Failed);
    assert_eq!(r.attempts, 1);
}
