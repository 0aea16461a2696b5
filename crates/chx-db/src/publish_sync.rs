//! PublishRecordSync: one delivery row per (active hash, active subscriber).
//!
//! Runs after each entity type's hashes settle. Creating is insert-or-ignore
//! on the pair key, so concurrent syncs converge. Resetting touches terminal
//! rows only:
//!
//! - `published` with a published hash different from the current hash;
//! - `failed`, always, so every sync gives a failed delivery another go;
//! - `soft_deleted` whose hash row was written after it (a revived hash).
//!
//! Rows of tombstoned hashes are left to the state machine. In-flight rows
//! (`pending`, `dispatched`, `deferred`) are never touched.

use crate::tables::StoreTables;
use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishSyncReport {
    pub entity_type: String,
    pub created: u64,
    pub reset: u64,
}

#[derive(Debug, Clone)]
pub struct PublishRecordSync {
    pool: PgPool,
    tables: StoreTables,
}

impl PublishRecordSync {
    pub fn new(pool: PgPool, tables: StoreTables) -> Self {
        Self { pool, tables }
    }

    /// Sync every active subscriber of `entity_type`, in one transaction.
    pub async fn sync(&self, entity_type: &str) -> Result<PublishSyncReport> {
        let mut tx = self.pool.begin().await.context("publish sync begin failed")?;
        let created = self.create_missing(&mut *tx, entity_type).await?;
        let reset = self.reset_stale(&mut *tx, entity_type).await?;
        tx.commit().await.context("publish sync commit failed")?;

        if created > 0 || reset > 0 {
            info!(entity_type, created, reset, "delivery rows synced");
        }
        Ok(PublishSyncReport {
            entity_type: entity_type.to_string(),
            created,
            reset,
        })
    }

    pub async fn create_missing(&self, conn: &mut PgConnection, entity_type: &str) -> Result<u64> {
        let res = sqlx::query(&format!(
            r#"
            insert into {dl} (hash_id, subscriber_id)
            select h.id, s.id
            from {h} h
            join {s} s on s.entity_type = h.entity_type and s.status = 'active'
            where h.entity_type = $1 and h.deleted_at is null
            order by h.id, s.id
            on conflict (hash_id, subscriber_id) do nothing
            "#,
            dl = self.tables.deliveries(),
            h = self.tables.hashes(),
            s = self.tables.subscribers(),
        ))
        .bind(entity_type)
        .execute(&mut *conn)
        .await
        .context("publish sync insert failed")?;
        Ok(res.rows_affected())
    }

    pub async fn reset_stale(&self, conn: &mut PgConnection, entity_type: &str) -> Result<u64> {
        let res = sqlx::query(&format!(
            r#"
            update {dl} d
            set status = 'pending',
                attempts = 0,
                last_error = null,
                last_response_code = null,
                error_type = null,
                next_try = null,
                dispatched_at = null,
                updated_at = now()
            from {h} h, {s} s
            where d.hash_id = h.id
              and d.subscriber_id = s.id
              and s.status = 'active'
              and h.entity_type = $1
              and h.deleted_at is null
              and (
                   (d.status = 'published'
                    and d.published_hash is distinct from coalesce(h.composite_hash, h.attribute_hash))
                or d.status = 'failed'
                or (d.status = 'soft_deleted' and h.updated_at > d.updated_at)
              )
            "#,
            dl = self.tables.deliveries(),
            h = self.tables.hashes(),
            s = self.tables.subscribers(),
        ))
        .bind(entity_type)
        .execute(&mut *conn)
        .await
        .context("publish sync reset failed")?;
        Ok(res.rows_affected())
    }
}
