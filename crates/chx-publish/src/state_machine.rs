//! Delivery record state machine.
//!
//! # Design
//!
//! One [`DeliveryRecord`] exists per (hash, subscriber) pair. Every lifecycle
//! event goes through [`DeliveryRecord::apply`], which either performs a
//! legal transition or returns [`TransitionError`] and leaves the record
//! untouched.
//!
//! ```text
//!              Dispatch              Published
//!   Pending ─────────────► Dispatched ───────────► Published (term.)
//!     │  ▲                    │   │
//!     │  └──── Requeue ───────┘   │ Deferred (attempts += 1)
//!     │                           ▼
//!     ├──── Deferred ──────────► Deferred ── policy exhausted ──► Failed (term.)
//!     │                           │
//!     └── HashTombstoned ─────────┴──────────────────────────► SoftDeleted (term.)
//!
//!   Failed is also reachable from any state by an explicit Failed event.
//! ```
//!
//! Terminal records only move again when PublishRecordSync resets them to
//! `Pending` after the underlying hash changes.

use crate::error::{DeliveryError, ErrorCategory};
use crate::policy::RetryPolicy;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// DeliveryStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Pending,
    /// Claimed by a dispatcher; an attempt is in flight.
    Dispatched,
    /// Last attempt failed; retry at `next_try`.
    Deferred,
    /// **Terminal.**
    Published,
    /// **Terminal.**
    Failed,
    /// The hash row was tombstoned before delivery. **Terminal.**
    SoftDeleted,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Dispatched => "dispatched",
            DeliveryStatus::Deferred => "deferred",
            DeliveryStatus::Published => "published",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::SoftDeleted => "soft_deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "dispatched" => Some(DeliveryStatus::Dispatched),
            "deferred" => Some(DeliveryStatus::Deferred),
            "published" => Some(DeliveryStatus::Published),
            "failed" => Some(DeliveryStatus::Failed),
            "soft_deleted" => Some(DeliveryStatus::SoftDeleted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Published | DeliveryStatus::Failed | DeliveryStatus::SoftDeleted
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// DeliveryEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    /// Intent to attempt delivery. Does not count as an attempt.
    Dispatch,
    /// Delivery succeeded for `hash`. `attempted` is false for operator marks,
    /// which do not increment `attempts`.
    Published {
        hash: String,
        attempted: bool,
        response_code: Option<i32>,
    },
    /// Attempt failed; back off or give up per the retry policy.
    Deferred { error: DeliveryError },
    /// Permanent failure.
    Failed { error: DeliveryError },
    /// The hash row was found tombstoned at delivery time.
    HashTombstoned,
    /// A dispatcher abandoned its claim; hand the record back.
    Requeue,
}

impl DeliveryEvent {
    fn label(&self) -> &'static str {
        match self {
            DeliveryEvent::Dispatch => "Dispatch",
            DeliveryEvent::Published { .. } => "Published",
            DeliveryEvent::Deferred { .. } => "Deferred",
            DeliveryEvent::Failed { .. } => "Failed",
            DeliveryEvent::HashTombstoned => "HashTombstoned",
            DeliveryEvent::Requeue => "Requeue",
        }
    }
}

// ---------------------------------------------------------------------------
// TransitionError
// ---------------------------------------------------------------------------

/// An event that is not legal in the record's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: DeliveryStatus,
    pub event: &'static str,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal delivery transition: {} + {}", self.from, self.event)
    }
}

impl std::error::Error for TransitionError {}

// ---------------------------------------------------------------------------
// DeliveryRecord
// ---------------------------------------------------------------------------

/// Mutable lifecycle fields of one delivery row.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord {
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_response_code: Option<i32>,
    pub error_type: Option<ErrorCategory>,
    pub next_try: Option<DateTime<Utc>>,
    pub published_hash: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

impl Default for DeliveryRecord {
    fn default() -> Self {
        Self::pending()
    }
}

impl DeliveryRecord {
    /// Fresh record, as created by PublishRecordSync.
    pub fn pending() -> Self {
        Self {
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_error: None,
            last_response_code: None,
            error_type: None,
            next_try: None,
            published_hash: None,
            published_at: None,
            metadata: Value::Object(Default::default()),
        }
    }

    /// True only for a deferred record whose retry time has come.
    pub fn should_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Deferred && matches!(self.next_try, Some(t) if t <= now)
    }

    /// Eligible for the next dispatch batch.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending || self.should_retry(now)
    }

    /// Apply `event` at time `now`.
    ///
    /// # Errors
    /// [`TransitionError`] when the event is illegal in the current state;
    /// the record is left unchanged.
    pub fn apply(
        &mut self,
        event: &DeliveryEvent,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<DeliveryStatus, TransitionError> {
        use DeliveryEvent as E;
        use DeliveryStatus::*;

        match (self.status, event) {
            (Pending | Deferred, E::Dispatch) => {
                self.status = Dispatched;
            }

            (Dispatched, E::Requeue) => {
                self.status = Pending;
            }

            (
                Pending | Dispatched | Deferred,
                E::Published {
                    hash,
                    attempted,
                    response_code,
                },
            ) => {
                if *attempted {
                    self.attempts += 1;
                }
                self.status = Published;
                self.published_hash = Some(hash.clone());
                self.published_at = Some(now);
                self.next_try = None;
                self.last_error = None;
                self.error_type = None;
                self.last_response_code = *response_code;
            }

            (Pending | Dispatched | Deferred, E::Deferred { error }) => {
                self.attempts += 1;
                self.record_error(error);
                match policy.next_try(self.attempts, now) {
                    Some(at) => {
                        self.status = Deferred;
                        self.next_try = Some(at);
                    }
                    None => {
                        self.status = Failed;
                        self.next_try = None;
                    }
                }
            }

            (_, E::Failed { error }) => {
                self.record_error(error);
                self.status = Failed;
                self.next_try = None;
            }

            (Pending | Dispatched | Deferred, E::HashTombstoned) => {
                self.status = SoftDeleted;
                self.next_try = None;
            }

            (from, ev) => {
                return Err(TransitionError {
                    from,
                    event: ev.label(),
                });
            }
        }

        Ok(self.status)
    }

    /// Back to a fresh pending record after the hash changed. Keeps the last
    /// published hash so the sync can tell whether it is stale.
    pub fn reset(&mut self) {
        self.status = DeliveryStatus::Pending;
        self.attempts = 0;
        self.last_error = None;
        self.last_response_code = None;
        self.error_type = None;
        self.next_try = None;
    }

    fn record_error(&mut self, error: &DeliveryError) {
        self.last_error = Some(error.message.clone());
        self.last_response_code = error.status_code;
        self.error_type = Some(error.category);
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn dispatch_does_not_count_as_attempt() {
        let mut r = DeliveryRecord::pending();
        r.apply(&DeliveryEvent::Dispatch, t0(), &RetryPolicy::default())
            .unwrap();
        assert_eq!(r.status, DeliveryStatus::Dispatched);
        assert_eq!(r.attempts, 0);
    }

    #[test]
    fn double_dispatch_is_illegal() {
        let mut r = DeliveryRecord::pending();
        let p = RetryPolicy::default();
        r.apply(&DeliveryEvent::Dispatch, t0(), &p).unwrap();
        let err = r.apply(&DeliveryEvent::Dispatch, t0(), &p).unwrap_err();
        assert_eq!(err.from, DeliveryStatus::Dispatched);
        assert_eq!(r.status, DeliveryStatus::Dispatched);
    }

    #[test]
    fn requeue_only_from_dispatched() {
        let mut r = DeliveryRecord::pending();
        let p = RetryPolicy::default();
        assert!(r.apply(&DeliveryEvent::Requeue, t0(), &p).is_err());
        r.apply(&DeliveryEvent::Dispatch, t0(), &p).unwrap();
        r.apply(&DeliveryEvent::Requeue, t0(), &p).unwrap();
        assert_eq!(r.status, DeliveryStatus::Pending);
    }

    #[test]
    fn reset_clears_errors_but_keeps_published_hash() {
        let mut r = DeliveryRecord::pending();
        let p = RetryPolicy::default();
        r.apply(
            &DeliveryEvent::Published {
                hash: "h1".into(),
                attempted: true,
                response_code: Some(200),
            },
            t0(),
            &p,
        )
        .unwrap();
        r.reset();
        assert_eq!(r.status, DeliveryStatus::Pending);
        assert_eq!(r.attempts, 0);
        assert_eq!(r.published_hash.as_deref(), Some("h1"));
        assert_eq!(r.last_response_code, None);
    }
}
