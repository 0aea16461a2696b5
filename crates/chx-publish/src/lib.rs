//! chx-publish
//!
//! Delivery bookkeeping for subscribers, pure half:
//! - `DeliveryRecord` lifecycle state machine (dispatch, publish, defer with
//!   backoff, fail, soft-delete).
//! - Retry policy and per-subscriber options.
//! - Error categorization and the batch-level error budget.
//!
//! No IO. The clock is always passed in.

mod error;
mod policy;
mod state_machine;

pub use error::{categorize, DeliveryError, ErrorAction, ErrorCategory};
pub use policy::{
    ErrorBudget, RetryPolicy, SubscriberConfig, DEFAULT_MAX_INFRASTRUCTURE_ERRORS,
    DEFAULT_MAX_VALIDATION_ERRORS, DEFAULT_RETRY_INTERVALS,
};
pub use state_machine::{DeliveryEvent, DeliveryRecord, DeliveryStatus, TransitionError};
