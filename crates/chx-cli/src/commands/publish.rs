//! `chx publish ...` and `chx subscriber ...`.

use super::{open, Session};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use chx_db::{DeliveryStore, HashStore, NewSubscriber, SubscriberStatus};
use chx_runtime::{Dispatcher, StrategyRegistry, SyncEngine};
use std::sync::Arc;

fn deliveries(s: &Session) -> DeliveryStore {
    DeliveryStore::new(s.pool.clone(), s.tables.clone())
}

pub async fn sync(config: &[String], entity_type: Option<String>) -> Result<()> {
    let s = open(config).await?;
    let engine = SyncEngine::from_settings(s.pool.clone(), &s.settings)?;
    let reports = engine.sync_publish(entity_type.as_deref()).await?;
    for r in &reports {
        println!(
            "entity_type={} created={} reset={}",
            r.entity_type, r.created, r.reset
        );
    }
    let created: u64 = reports.iter().map(|r| r.created).sum();
    let reset: u64 = reports.iter().map(|r| r.reset).sum();
    println!("deliveries_created={created} deliveries_reset={reset}");
    Ok(())
}

pub async fn run(config: &[String], entity_type: Option<String>) -> Result<()> {
    let s = open(config).await?;
    let store = HashStore::new(
        s.pool.clone(),
        Arc::new(s.settings.registry()?),
        s.tables.clone(),
        s.settings.engine.hash_algorithm,
    );
    let dispatcher = Dispatcher::new(
        store,
        StrategyRegistry::with_builtins(),
        s.settings.publish.clone(),
    );

    let r = dispatcher.run_batch(entity_type.as_deref()).await?;
    println!("lock_acquired={}", r.lock_acquired);
    println!(
        "subscribers={} claimed={} published={} skipped={} soft_deleted={} deferred={} failed={} \
         requeued={} stale_requeued={} conflicts={}",
        r.subscribers,
        r.claimed,
        r.published,
        r.skipped,
        r.soft_deleted,
        r.deferred,
        r.failed,
        r.requeued,
        r.stale_requeued,
        r.conflicts
    );
    for id in &r.stopped_subscribers {
        println!("stopped_subscriber={id}");
    }
    for id in &r.unknown_strategy {
        println!("unknown_strategy_subscriber={id}");
    }
    println!("continuation_required={}", r.continuation_required);
    Ok(())
}

pub async fn requeue_stale(config: &[String], older_than_secs: Option<u64>) -> Result<()> {
    let s = open(config).await?;
    let secs = older_than_secs.unwrap_or(s.settings.publish.stale_dispatch_secs);
    let window = i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| anyhow!("--older-than-secs out of range: {secs}"))?;
    let n = deliveries(&s).requeue_stale(window, Utc::now()).await?;
    println!("older_than_secs={secs} requeued={n}");
    Ok(())
}

pub async fn mark_published(config: &[String], delivery_id: i64) -> Result<()> {
    let s = open(config).await?;
    let row = deliveries(&s).mark_published(delivery_id, Utc::now()).await?;
    println!(
        "delivery_id={} status={} published_hash={}",
        row.id,
        row.record.status.as_str(),
        row.record.published_hash.as_deref().unwrap_or("")
    );
    Ok(())
}

pub async fn mark_failed(config: &[String], delivery_id: i64, reason: &str) -> Result<()> {
    let s = open(config).await?;
    let row = deliveries(&s)
        .mark_failed(delivery_id, reason, Utc::now())
        .await?;
    println!(
        "delivery_id={} status={} attempts={}",
        row.id,
        row.record.status.as_str(),
        row.record.attempts
    );
    Ok(())
}

pub async fn status(config: &[String]) -> Result<()> {
    let s = open(config).await?;
    for (status, n) in deliveries(&s).status_counts().await? {
        println!("status={status} count={n}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// subscribers
// ---------------------------------------------------------------------------

pub async fn subscriber_add(
    config: &[String],
    entity_type: String,
    strategy: String,
    priority: i32,
    options_json: Option<String>,
) -> Result<()> {
    let s = open(config).await?;
    s.settings.registry()?.require(&entity_type)?;

    let options = match options_json {
        Some(raw) => serde_json::from_str(&raw).context("--options-json is not valid JSON")?,
        None => serde_json::json!({}),
    };
    let id = chx_db::add_subscriber(
        &s.pool,
        &s.tables,
        &NewSubscriber {
            entity_type: entity_type.clone(),
            delivery_strategy: strategy.clone(),
            priority,
            config: options,
        },
    )
    .await?;
    println!("subscriber_id={id} entity_type={entity_type} strategy={strategy} priority={priority}");
    Ok(())
}

pub async fn subscriber_list(config: &[String]) -> Result<()> {
    let s = open(config).await?;
    for sub in chx_db::list_subscribers(&s.pool, &s.tables).await? {
        println!(
            "subscriber_id={} entity_type={} strategy={} status={} priority={}",
            sub.id, sub.entity_type, sub.delivery_strategy, sub.status, sub.priority
        );
    }
    Ok(())
}

pub async fn subscriber_set_status(config: &[String], id: i64, status: &str) -> Result<()> {
    let parsed = SubscriberStatus::parse(status)
        .ok_or_else(|| anyhow!("--status must be active or inactive, got {status}"))?;
    let s = open(config).await?;
    chx_db::set_subscriber_status(&s.pool, &s.tables, id, parsed).await?;
    println!("subscriber_id={id} status={parsed}");
    Ok(())
}
