//! Delivery dispatch batch.
//!
//! One batch at a time, process-wide (advisory lock). Subscribers are served
//! highest priority first. For each: claim due rows, deliver them one by one
//! with a fixed pause before every attempt after a subscriber's first, record
//! every outcome on its row. Delivery
//! failures never abort the batch; a subscriber is only cut short when its
//! error budget is spent or its strategy asks to stop. The row and time
//! budgets are checked between deliveries; when they run out the remaining
//! claimed rows are handed back and the report asks for a continuation.

use crate::strategy::{DeliveryPayload, DeliveryStrategy, StrategyRegistry};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use chx_config::PublishSettings;
use chx_db::{
    active_subscribers, BatchLock, DeliveryRow, DeliveryStore, HashStore, StoreTables, Subscriber,
};
use chx_publish::{
    DeliveryEvent, ErrorAction, ErrorBudget, ErrorCategory, RetryPolicy, SubscriberConfig,
    TransitionError,
};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const BATCH_LOCK_NAME: &str = "chx_publish_batch";

/// Ten years; larger thresholds are clamped.
const MAX_STALE_SECS: u64 = 10 * 365 * 86_400;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// False when another batch held the lock for the whole timeout.
    pub lock_acquired: bool,
    pub subscribers: u64,
    pub claimed: u64,
    pub published: u64,
    pub skipped: u64,
    pub soft_deleted: u64,
    pub deferred: u64,
    pub failed: u64,
    /// Claimed but handed back unprocessed.
    pub requeued: u64,
    pub stale_requeued: u64,
    /// Rows moved by someone else (an operator mark) while claimed; their
    /// outcome was not recorded.
    pub conflicts: u64,
    /// Subscribers cut short by their error budget or a stop request.
    pub stopped_subscribers: Vec<i64>,
    /// Subscribers whose strategy is not registered.
    pub unknown_strategy: Vec<i64>,
    pub continuation_required: bool,
}

impl DispatchReport {
    pub fn processed(&self) -> u64 {
        self.published + self.skipped + self.soft_deleted + self.deferred + self.failed
    }
}

/// What became of one claimed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Published,
    Skipped,
    SoftDeleted,
    Deferred { category: ErrorCategory, stop: bool },
    Failed { category: ErrorCategory },
    Conflict,
}

struct Budget {
    started: Instant,
    max_rows: u64,
    max_time: Duration,
    rows: u64,
}

impl Budget {
    fn spent(&self) -> bool {
        self.rows >= self.max_rows || self.started.elapsed() >= self.max_time
    }

    fn remaining_rows(&self) -> u64 {
        self.max_rows.saturating_sub(self.rows)
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: HashStore,
    deliveries: DeliveryStore,
    tables: StoreTables,
    strategies: StrategyRegistry,
    settings: PublishSettings,
}

impl Dispatcher {
    pub fn new(store: HashStore, strategies: StrategyRegistry, settings: PublishSettings) -> Self {
        let tables = store.tables().clone();
        Self {
            deliveries: DeliveryStore::new(store.pool().clone(), tables.clone()),
            store,
            tables,
            strategies,
            settings,
        }
    }

    pub fn deliveries(&self) -> &DeliveryStore {
        &self.deliveries
    }

    /// Run one batch, optionally for the subscribers of one entity type.
    pub async fn run_batch(&self, entity_type: Option<&str>) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        let timeout = Duration::from_secs(self.settings.lock_timeout_secs);
        let Some(lock) = BatchLock::acquire(self.store.pool(), BATCH_LOCK_NAME, timeout).await?
        else {
            warn!("dispatch batch skipped; another batch holds the lock");
            return Ok(report);
        };
        report.lock_acquired = true;

        let result = self.run_locked(entity_type, &mut report).await;
        lock.release().await?;
        result?;

        info!(
            subscribers = report.subscribers,
            claimed = report.claimed,
            published = report.published,
            deferred = report.deferred,
            failed = report.failed,
            requeued = report.requeued,
            conflicts = report.conflicts,
            continuation_required = report.continuation_required,
            "dispatch batch done"
        );
        Ok(report)
    }

    async fn run_locked(&self, entity_type: Option<&str>, report: &mut DispatchReport) -> Result<()> {
        let stale = ChronoDuration::seconds(self.settings.stale_dispatch_secs.min(MAX_STALE_SECS) as i64);
        report.stale_requeued = self.deliveries.requeue_stale(stale, Utc::now()).await?;

        let mut budget = Budget {
            started: Instant::now(),
            max_rows: u64::from(self.settings.max_rows_per_batch),
            max_time: Duration::from_secs(self.settings.max_batch_seconds),
            rows: 0,
        };

        for sub in active_subscribers(self.store.pool(), &self.tables, entity_type).await? {
            if budget.spent() {
                report.continuation_required = true;
                break;
            }
            let Some(strategy) = self.strategies.get(&sub.delivery_strategy) else {
                warn!(
                    subscriber_id = sub.id,
                    strategy = %sub.delivery_strategy,
                    "no such delivery strategy; subscriber skipped"
                );
                report.unknown_strategy.push(sub.id);
                continue;
            };
            report.subscribers += 1;
            self.serve(strategy.as_ref(), &sub, &mut budget, report).await?;
            if report.continuation_required {
                break;
            }
        }
        Ok(())
    }

    /// Claim and deliver for one subscriber until nothing is due, its error
    /// budget runs out, or the batch budget does.
    async fn serve(
        &self,
        strategy: &dyn DeliveryStrategy,
        sub: &Subscriber,
        budget: &mut Budget,
        report: &mut DispatchReport,
    ) -> Result<()> {
        let options = sub.options();
        let policy = options.retry_policy(&self.settings.retry_intervals);
        let mut errors: ErrorBudget = options.error_budget();
        let batch = u64::from(options.batch_size_or(self.settings.batch_size));
        let delay =
            Duration::from_millis(options.inter_attempt_delay_ms_or(self.settings.inter_attempt_delay_ms));

        let mut attempted = false;
        loop {
            if budget.spent() {
                report.continuation_required = true;
                return Ok(());
            }
            let limit = batch.min(budget.remaining_rows());
            let claimed = self
                .deliveries
                .claim_due(sub.id, i64::try_from(limit).unwrap_or(i64::MAX), Utc::now())
                .await?;
            if claimed.is_empty() {
                return Ok(());
            }
            report.claimed += claimed.len() as u64;

            let mut rest = claimed.into_iter();
            while let Some(d) = rest.next() {
                // pause between attempts, across claim chunks
                if attempted && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempted = true;

                let outcome = match self.process_one(strategy, &options, &policy, &d).await {
                    Ok(o) => o,
                    Err(e) if e.downcast_ref::<TransitionError>().is_some() => {
                        warn!(
                            delivery_id = d.id,
                            subscriber_id = sub.id,
                            error = %e,
                            "delivery row changed while claimed; outcome dropped"
                        );
                        Outcome::Conflict
                    }
                    Err(e) => return Err(e),
                };
                budget.rows += 1;

                let stop = match outcome {
                    Outcome::Published => {
                        report.published += 1;
                        false
                    }
                    Outcome::Skipped => {
                        report.skipped += 1;
                        false
                    }
                    Outcome::SoftDeleted => {
                        report.soft_deleted += 1;
                        false
                    }
                    Outcome::Deferred { category, stop } => {
                        report.deferred += 1;
                        errors.record(category);
                        stop || errors.exceeded()
                    }
                    Outcome::Failed { category } => {
                        report.failed += 1;
                        errors.record(category);
                        errors.exceeded()
                    }
                    Outcome::Conflict => {
                        report.conflicts += 1;
                        false
                    }
                };

                let out_of_budget = budget.spent();
                if stop || out_of_budget {
                    let left: Vec<i64> = rest.map(|d| d.id).collect();
                    report.requeued += self.deliveries.requeue(&left).await?;
                    if stop {
                        warn!(
                            subscriber_id = sub.id,
                            validation = errors.validation,
                            infrastructure = errors.infrastructure,
                            "subscriber stopped for this batch"
                        );
                        report.stopped_subscribers.push(sub.id);
                    } else {
                        report.continuation_required = true;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn process_one(
        &self,
        strategy: &dyn DeliveryStrategy,
        options: &SubscriberConfig,
        policy: &RetryPolicy,
        d: &DeliveryRow,
    ) -> Result<Outcome> {
        let now = Utc::now();

        if d.hash_deleted {
            self.deliveries
                .record_outcome(d.id, &DeliveryEvent::HashTombstoned, policy, now)
                .await?;
            return Ok(Outcome::SoftDeleted);
        }
        let Some(entity) = self.store.entity_document(&d.entity_type, &d.entity_id).await? else {
            debug!(delivery_id = d.id, entity_id = %d.entity_id, "backing row gone before delivery");
            self.deliveries
                .record_outcome(d.id, &DeliveryEvent::HashTombstoned, policy, now)
                .await?;
            return Ok(Outcome::SoftDeleted);
        };

        let payload = DeliveryPayload {
            delivery_id: d.id,
            subscriber_id: d.subscriber_id,
            entity_type: d.entity_type.clone(),
            entity_id: d.entity_id.clone(),
            hash: d.current_hash.clone(),
            attempts: d.record.attempts,
            entity,
        };

        if !strategy.should_publish(options, &payload) {
            self.deliveries.mark_skipped(d.id, now).await?;
            return Ok(Outcome::Skipped);
        }

        match strategy.deliver(options, &payload).await {
            Ok(receipt) => {
                let event = DeliveryEvent::Published {
                    hash: payload.hash,
                    attempted: true,
                    response_code: receipt.response_code,
                };
                self.deliveries
                    .record_outcome(d.id, &event, policy, Utc::now())
                    .await?;
                Ok(Outcome::Published)
            }
            Err(error) => {
                let category = error.category;
                let action = strategy.categorize_error(&error);
                debug!(
                    delivery_id = d.id,
                    category = %category,
                    error = %error,
                    "delivery attempt failed"
                );
                let event = match action {
                    ErrorAction::Fail => DeliveryEvent::Failed { error },
                    ErrorAction::Defer | ErrorAction::StopBatch => DeliveryEvent::Deferred { error },
                };
                let row = self
                    .deliveries
                    .record_outcome(d.id, &event, policy, Utc::now())
                    .await?;
                Ok(match (action, row.record.status) {
                    (ErrorAction::Fail, _) | (_, chx_publish::DeliveryStatus::Failed) => {
                        Outcome::Failed { category }
                    }
                    (a, _) => Outcome::Deferred {
                        category,
                        stop: a == ErrorAction::StopBatch,
                    },
                })
            }
        }
    }
}
