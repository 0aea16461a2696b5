//! Reconciliation cycle over the registry.
//!
//! Entity types run leaves first. Each type gets its own reconciliation
//! transaction, then its own publish sync; a failure stops the cycle at that
//! type and everything before it stays committed.

use anyhow::{Context, Result};
use chx_config::{EngineSettings, Settings};
use chx_core::EntityRegistry;
use chx_db::{
    BulkHashProcessor, ChangeDetector, HashStore, OrphanReconciler, OrphanReport,
    PublishRecordSync, PublishSyncReport, ReconcileReport, StoreTables,
};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    /// Only this entity type. Cascades still reach its dependents.
    pub entity_type: Option<String>,
    /// Overrides `engine.change_limit`.
    pub change_limit: Option<i64>,
    /// Count changes without writing anything.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeCycleReport {
    pub entity_type: String,
    /// Set on dry runs only.
    pub pending_changes: Option<i64>,
    pub hashes: ReconcileReport,
    pub deliveries: PublishSyncReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub dry_run: bool,
    pub types: Vec<TypeCycleReport>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleTotals {
    pub changed: u64,
    pub created: u64,
    pub updated: u64,
    pub tombstoned: u64,
    pub cascaded: u64,
    pub deliveries_created: u64,
    pub deliveries_reset: u64,
    pub pending_changes: i64,
}

impl CycleReport {
    pub fn totals(&self) -> CycleTotals {
        let mut t = CycleTotals::default();
        for r in &self.types {
            t.changed += r.hashes.changed;
            t.created += r.hashes.created;
            t.updated += r.hashes.updated;
            t.tombstoned += r.hashes.tombstoned;
            t.cascaded += r.hashes.cascaded;
            t.deliveries_created += r.deliveries.created;
            t.deliveries_reset += r.deliveries.reset;
            t.pending_changes += r.pending_changes.unwrap_or(0);
        }
        t
    }

    /// Hash and delivery rows written by the cycle.
    pub fn writes(&self) -> u64 {
        self.types
            .iter()
            .map(|r| r.hashes.writes() + r.deliveries.created + r.deliveries.reset)
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct SyncEngine {
    store: HashStore,
    processor: BulkHashProcessor,
    publish: PublishRecordSync,
    orphans: OrphanReconciler,
}

impl SyncEngine {
    pub fn new(
        pool: PgPool,
        registry: Arc<EntityRegistry>,
        tables: StoreTables,
        engine: &EngineSettings,
    ) -> Self {
        let store = HashStore::new(pool.clone(), registry, tables.clone(), engine.hash_algorithm);
        Self {
            processor: BulkHashProcessor::new(store.clone(), engine),
            publish: PublishRecordSync::new(pool, tables),
            orphans: OrphanReconciler::new(store.clone()),
            store,
        }
    }

    pub fn from_settings(pool: PgPool, settings: &Settings) -> Result<Self> {
        let registry = Arc::new(settings.registry()?);
        Ok(Self::new(
            pool,
            registry,
            StoreTables::from_settings(&settings.storage),
            &settings.engine,
        ))
    }

    pub fn store(&self) -> &HashStore {
        &self.store
    }

    /// Types to visit, leaves first; one type when `only` is given.
    pub fn order(&self, only: Option<&str>) -> Result<Vec<String>> {
        let registry = self.store.registry();
        match only {
            Some(t) => {
                registry.require(t)?;
                Ok(vec![t.to_string()])
            }
            None => Ok(registry.dependency_order()?),
        }
    }

    pub async fn run_cycle(&self, opts: &CycleOptions) -> Result<CycleReport> {
        let mut report = CycleReport {
            dry_run: opts.dry_run,
            types: Vec::new(),
        };
        let processor = match opts.change_limit {
            Some(n) => self.processor.clone().with_change_limit(Some(n)),
            None => self.processor.clone(),
        };

        for entity_type in self.order(opts.entity_type.as_deref())? {
            if opts.dry_run {
                let mut conn = self
                    .store
                    .pool()
                    .acquire()
                    .await
                    .context("dry run connection failed")?;
                let n = ChangeDetector::new(self.store.sql())
                    .count(&mut *conn, &entity_type)
                    .await?;
                info!(entity_type = %entity_type, pending_changes = n, "dry run");
                report.types.push(TypeCycleReport {
                    entity_type,
                    pending_changes: Some(n),
                    ..Default::default()
                });
                continue;
            }

            let hashes = processor.reconcile(&entity_type).await?;
            let deliveries = self.publish.sync(&entity_type).await?;
            report.types.push(TypeCycleReport {
                entity_type,
                pending_changes: None,
                hashes,
                deliveries,
            });
        }

        let t = report.totals();
        info!(
            dry_run = opts.dry_run,
            types = report.types.len(),
            created = t.created,
            updated = t.updated,
            tombstoned = t.tombstoned,
            deliveries_created = t.deliveries_created,
            deliveries_reset = t.deliveries_reset,
            "sync cycle done"
        );
        Ok(report)
    }

    /// Publish sync alone, for every type or one.
    pub async fn sync_publish(&self, only: Option<&str>) -> Result<Vec<PublishSyncReport>> {
        let mut out = Vec::new();
        for entity_type in self.order(only)? {
            out.push(self.publish.sync(&entity_type).await?);
        }
        Ok(out)
    }

    pub async fn sweep_orphans(&self, only: Option<&str>, purge: bool) -> Result<Vec<OrphanReport>> {
        let mut out = Vec::new();
        for entity_type in self.order(only)? {
            out.push(self.orphans.reconcile(&entity_type, purge).await?);
        }
        Ok(out)
    }
}
