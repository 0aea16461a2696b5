//! `chx sync` and `chx orphans`.

use super::open;
use anyhow::Result;
use chx_runtime::{CycleOptions, SyncEngine};

pub async fn sync(
    config: &[String],
    entity_type: Option<String>,
    limit: Option<i64>,
    dry_run: bool,
) -> Result<()> {
    let s = open(config).await?;
    let engine = SyncEngine::from_settings(s.pool.clone(), &s.settings)?;

    let report = engine
        .run_cycle(&CycleOptions {
            entity_type,
            change_limit: limit,
            dry_run,
        })
        .await?;

    println!("config_hash={}", s.loaded.config_hash);
    for t in &report.types {
        if dry_run {
            println!(
                "entity_type={} pending_changes={}",
                t.entity_type,
                t.pending_changes.unwrap_or(0)
            );
            continue;
        }
        println!(
            "entity_type={} changed={} created={} updated={} tombstoned={} cascaded={} \
             deliveries_created={} deliveries_reset={}{}",
            t.entity_type,
            t.hashes.changed,
            t.hashes.created,
            t.hashes.updated,
            t.hashes.tombstoned,
            t.hashes.cascaded,
            t.deliveries.created,
            t.deliveries.reset,
            if t.hashes.cascade_truncated {
                " cascade_truncated=true"
            } else {
                ""
            },
        );
    }

    let totals = report.totals();
    if dry_run {
        println!("dry_run=true pending_changes={}", totals.pending_changes);
    } else {
        println!(
            "created={} updated={} tombstoned={} deliveries_created={} deliveries_reset={}",
            totals.created,
            totals.updated,
            totals.tombstoned,
            totals.deliveries_created,
            totals.deliveries_reset
        );
    }
    Ok(())
}

pub async fn orphans(config: &[String], entity_type: Option<String>, purge: bool) -> Result<()> {
    let s = open(config).await?;
    let engine = SyncEngine::from_settings(s.pool.clone(), &s.settings)?;

    let reports = engine.sweep_orphans(entity_type.as_deref(), purge).await?;
    for r in &reports {
        println!(
            "entity_type={} missing={} soft_deleted={} out_of_scope={} tombstoned={} purged={}",
            r.entity_type, r.missing, r.soft_deleted, r.out_of_scope, r.tombstoned, r.purged
        );
    }
    let found: u64 = reports.iter().map(|r| r.found()).sum();
    let purged: u64 = reports.iter().map(|r| r.purged).sum();
    println!("orphans_found={found} purged={purged}");
    Ok(())
}
