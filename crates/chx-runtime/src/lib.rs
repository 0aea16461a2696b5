//! chx-runtime
//!
//! Async orchestration on top of chx-db:
//! - `SyncEngine`: one reconciliation cycle over every registered entity type,
//!   leaves first, with publish sync after each type; orphan sweeps.
//! - `Dispatcher`: the delivery batch (lock, claim, deliver, record, budgets).
//! - Delivery strategies (`log`, `webhook`) behind `DeliveryStrategy`.

mod dispatch;
mod engine;
mod strategy;

pub use dispatch::{DispatchReport, Dispatcher, BATCH_LOCK_NAME};
pub use engine::{CycleOptions, CycleReport, CycleTotals, SyncEngine, TypeCycleReport};
pub use strategy::{
    DeliveryPayload, DeliveryReceipt, DeliveryStrategy, LogDelivery, StrategyRegistry,
    WebhookDelivery,
};
