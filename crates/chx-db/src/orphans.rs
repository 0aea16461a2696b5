//! Orphan sweep.
//!
//! An orphan is an active hash row whose backing row is gone, soft-deleted,
//! or fails its inclusion scope when inspected directly. The reconciliation
//! pass already tombstones these reactively; this is the periodic cross-check.
//!
//! Purge is separate and only ever deletes tombstoned rows.

use crate::hashes::HashStore;
use crate::sql::{column, id_text_sql, quote_table};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    Missing,
    SoftDeleted,
    OutOfScope,
}

impl OrphanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrphanReason::Missing => "missing",
            OrphanReason::SoftDeleted => "soft_deleted",
            OrphanReason::OutOfScope => "out_of_scope",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "missing" => Some(OrphanReason::Missing),
            "soft_deleted" => Some(OrphanReason::SoftDeleted),
            "out_of_scope" => Some(OrphanReason::OutOfScope),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
    pub hash_id: i64,
    pub entity_id: String,
    pub reason: OrphanReason,
    /// The backing row's own deletion time, when it has one.
    pub row_deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    pub entity_type: String,
    pub missing: u64,
    pub soft_deleted: u64,
    pub out_of_scope: u64,
    pub tombstoned: u64,
    pub purged: u64,
}

impl OrphanReport {
    pub fn found(&self) -> u64 {
        self.missing + self.soft_deleted + self.out_of_scope
    }
}

#[derive(Debug, Clone)]
pub struct OrphanReconciler {
    store: HashStore,
}

impl OrphanReconciler {
    pub fn new(store: HashStore) -> Self {
        Self { store }
    }

    /// Active hash rows of `entity_type` without a valid backing row,
    /// ordered by entity id.
    pub async fn find(&self, conn: &mut PgConnection, entity_type: &str) -> Result<Vec<Orphan>> {
        let ctx = self.store.sql();
        let entity = ctx.registry.require(entity_type)?;
        let e_id = column("e", entity.id_column());
        let (soft_case, row_deleted_at) = match entity.soft_delete_column() {
            Some(col) => {
                let c = column("e", col);
                (
                    format!("when {c} is not null then 'soft_deleted' "),
                    format!("{c}::timestamptz"),
                )
            }
            None => (String::new(), "null::timestamptz".to_string()),
        };

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "select h.id as hash_id, h.entity_id, \
             case when {e_id} is null then 'missing' {soft_case}else 'out_of_scope' end as reason, \
             {row_deleted_at} as row_deleted_at \
             from {} h left join {} e on {} = h.entity_id \
             where h.deleted_at is null and h.entity_type = ",
            ctx.tables.hashes(),
            quote_table(entity.table()),
            id_text_sql(entity.as_ref(), "e"),
        ));
        qb.push_bind(entity_type.to_string());
        qb.push(format!(" and ({e_id} is null or not "));
        ctx.push_in_scope(&mut qb, entity.as_ref(), "e")?;
        qb.push(") order by h.entity_id");

        let rows = qb
            .build()
            .fetch_all(&mut *conn)
            .await
            .with_context(|| format!("orphan scan failed for {entity_type}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let reason: String = row.try_get("reason")?;
            out.push(Orphan {
                hash_id: row.try_get("hash_id")?,
                entity_id: row.try_get("entity_id")?,
                reason: OrphanReason::parse(&reason).unwrap_or(OrphanReason::OutOfScope),
                row_deleted_at: row.try_get("row_deleted_at")?,
            });
        }
        Ok(out)
    }

    /// Tombstone the given orphans at their row's deletion time, or now.
    /// Rows already tombstoned are left alone. Returns rows written.
    pub async fn soft_delete(&self, conn: &mut PgConnection, orphans: &[Orphan]) -> Result<u64> {
        if orphans.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = orphans.iter().map(|o| o.hash_id).collect();
        let at: Vec<Option<DateTime<Utc>>> = orphans.iter().map(|o| o.row_deleted_at).collect();

        let res = sqlx::query(&format!(
            "update {} h set deleted_at = coalesce(x.row_deleted_at, now()), updated_at = now() \
             from unnest($1::bigint[], $2::timestamptz[]) as x(id, row_deleted_at) \
             where h.id = x.id and h.deleted_at is null",
            self.store.tables().hashes()
        ))
        .bind(ids)
        .bind(at)
        .execute(&mut *conn)
        .await
        .context("orphan soft_delete failed")?;
        Ok(res.rows_affected())
    }

    /// Hard-delete every tombstoned hash row of `entity_type`. Deliveries and
    /// edges sourced from those rows go with them; edges naming a purged
    /// entity as dependent are removed too. Returns rows purged.
    pub async fn purge_tombstoned(&self, conn: &mut PgConnection, entity_type: &str) -> Result<u64> {
        let tables = self.store.tables();
        let rows = sqlx::query(&format!(
            "delete from {} where entity_type = $1 and deleted_at is not null returning entity_id",
            tables.hashes()
        ))
        .bind(entity_type)
        .fetch_all(&mut *conn)
        .await
        .context("purge tombstoned failed")?;

        let purged: Vec<String> = rows
            .iter()
            .map(|r| r.try_get::<String, _>("entity_id"))
            .collect::<Result<_, _>>()?;
        if purged.is_empty() {
            return Ok(0);
        }

        sqlx::query(&format!(
            "delete from {} where dependent_type = $1 and dependent_id = any($2)",
            tables.hash_dependents()
        ))
        .bind(entity_type)
        .bind(&purged)
        .execute(&mut *conn)
        .await
        .context("purge dependent edges failed")?;

        warn!(entity_type, purged = purged.len(), "purged tombstoned hash rows");
        Ok(purged.len() as u64)
    }

    /// Find and tombstone orphans of `entity_type`, optionally purging every
    /// tombstone afterwards. One transaction.
    pub async fn reconcile(&self, entity_type: &str, purge: bool) -> Result<OrphanReport> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .context("orphan reconcile begin failed")?;

        let orphans = self.find(&mut *tx, entity_type).await?;
        let mut report = OrphanReport {
            entity_type: entity_type.to_string(),
            ..Default::default()
        };
        for o in &orphans {
            match o.reason {
                OrphanReason::Missing => report.missing += 1,
                OrphanReason::SoftDeleted => report.soft_deleted += 1,
                OrphanReason::OutOfScope => report.out_of_scope += 1,
            }
        }

        report.tombstoned = self.soft_delete(&mut *tx, &orphans).await?;
        if purge {
            report.purged = self.purge_tombstoned(&mut *tx, entity_type).await?;
        }

        tx.commit().await.context("orphan reconcile commit failed")?;

        info!(
            entity_type,
            found = report.found(),
            tombstoned = report.tombstoned,
            purged = report.purged,
            "orphan sweep done"
        );
        Ok(report)
    }
}
