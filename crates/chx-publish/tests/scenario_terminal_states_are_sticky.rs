//! Scenario: terminal delivery states.
//!
//! # Invariants under test
//! - `published`, `failed` and `soft_deleted` are terminal: dispatch,
//!   deferral, tombstone and publish events are rejected there and the record
//!   is left untouched.
//! - An explicit failure is accepted from any state.
//! - A tombstoned hash aborts delivery from every non-terminal state.
//! - Operator marks do not count as attempts; real deliveries do.
//! - Only a reset (hash change) brings a terminal record back to pending.

use chrono::{DateTime, TimeZone, Utc};
use chx_publish::{
    DeliveryError, DeliveryEvent, DeliveryRecord, DeliveryStatus, ErrorCategory, RetryPolicy,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
}

fn published(hash: &str, attempted: bool) -> DeliveryEvent {
    DeliveryEvent::Published {
        hash: hash.to_string(),
        attempted,
        response_code: if attempted { Some(200) } else { None },
    }
}

fn record_in(status: DeliveryStatus) -> DeliveryRecord {
    let p = RetryPolicy::default();
    let mut r = DeliveryRecord::pending();
    match status {
        DeliveryStatus::Pending => {}
        DeliveryStatus::Dispatched => {
            r.apply(&DeliveryEvent::Dispatch, t0(), &p).unwrap();
        }
        DeliveryStatus::Deferred => {
            r.apply(
                &DeliveryEvent::Deferred {
                    error: DeliveryError::new("connection refused", None),
                },
                t0(),
                &p,
            )
            .unwrap();
        }
        DeliveryStatus::Published => {
            r.apply(&published("h0", true), t0(), &p).unwrap();
        }
        DeliveryStatus::Failed => {
            r.apply(
                &DeliveryEvent::Failed {
                    error: DeliveryError::new("invalid payload", Some(422)),
                },
                t0(),
                &p,
            )
            .unwrap();
        }
        DeliveryStatus::SoftDeleted => {
            r.apply(&DeliveryEvent::HashTombstoned, t0(), &p).unwrap();
        }
    }
    assert_eq!(r.status, status);
    r
}

const TERMINAL: [DeliveryStatus; 3] = [
    DeliveryStatus::Published,
    DeliveryStatus::Failed,
    DeliveryStatus::SoftDeleted,
];

const LIVE: [DeliveryStatus; 3] = [
    DeliveryStatus::Pending,
    DeliveryStatus::Dispatched,
    DeliveryStatus::Deferred,
];

#[test]
fn terminal_states_reject_progress_events() {
    let p = RetryPolicy::default();
    let events = [
        DeliveryEvent::Dispatch,
        DeliveryEvent::Requeue,
        DeliveryEvent::HashTombstoned,
        DeliveryEvent::Deferred {
            error: DeliveryError::new("timeout", None),
        },
        published("h1", true),
    ];
    for status in TERMINAL {
        assert!(status.is_terminal());
        for ev in &events {
            let mut r = record_in(status);
            let before = r.clone();
            let err = r.apply(ev, t0(), &p).unwrap_err();
            assert_eq!(err.from, status);
            assert_eq!(r, before, "{status} + {ev:?} must not mutate");
        }
    }
}

#[test]
fn explicit_failure_is_accepted_everywhere() {
    let p = RetryPolicy::default();
    for status in LIVE.iter().chain(TERMINAL.iter()) {
        let mut r = record_in(*status);
        r.apply(
            &DeliveryEvent::Failed {
                error: DeliveryError::new("duplicate record", Some(409)),
            },
            t0(),
            &p,
        )
        .unwrap();
        assert_eq!(r.status, DeliveryStatus::Failed);
        assert_eq!(r.next_try, None);
        assert_eq!(r.error_type, Some(ErrorCategory::Data));
    }
}

#[test]
fn tombstoned_hash_aborts_every_live_state() {
    let p = RetryPolicy::default();
    for status in LIVE {
        assert!(!status.is_terminal());
        let mut r = record_in(status);
        let attempts = r.attempts;
        r.apply(&DeliveryEvent::HashTombstoned, t0(), &p).unwrap();
        assert_eq!(r.status, DeliveryStatus::SoftDeleted);
        assert_eq!(r.attempts, attempts);
        assert_eq!(r.next_try, None);
    }
}

#[test]
fn operator_mark_does_not_count_as_attempt() {
    let p = RetryPolicy::default();

    let mut marked = record_in(DeliveryStatus::Deferred);
    marked.apply(&published("h1", false), t0(), &p).unwrap();
    assert_eq!(marked.attempts, 1);
    assert_eq!(marked.published_hash.as_deref(), Some("h1"));
    assert_eq!(marked.published_at, Some(t0()));
    assert_eq!(marked.last_error, None);
    assert_eq!(marked.error_type, None);
    assert_eq!(marked.next_try, None);

    let mut delivered = record_in(DeliveryStatus::Dispatched);
    delivered.apply(&published("h1", true), t0(), &p).unwrap();
    assert_eq!(delivered.attempts, 1);
    assert_eq!(delivered.last_response_code, Some(200));
}

#[test]
fn reset_reopens_terminal_records() {
    for status in TERMINAL {
        let mut r = record_in(status);
        r.reset();
        assert_eq!(r.status, DeliveryStatus::Pending);
        assert!(r.is_due(t0()));
    }
}

#[test]
fn status_strings_round_trip() {
    for status in LIVE.iter().chain(TERMINAL.iter()) {
        assert_eq!(DeliveryStatus::parse(status.as_str()), Some(*status));
    }
    assert_eq!(DeliveryStatus::parse("queued"), None);
}
