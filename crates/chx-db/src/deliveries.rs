//! Delivery rows and their transitions.
//!
//! Every single-row transition is a read-modify-write under `select .. for
//! update`: the row is locked, the pure state machine in chx-publish decides,
//! the result is written back. Claims use `for update skip locked` so two
//! dispatchers never take the same row.

use crate::tables::StoreTables;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use chx_publish::{
    DeliveryError, DeliveryEvent, DeliveryRecord, DeliveryStatus, ErrorCategory, RetryPolicy,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A delivery row joined with the hash it delivers.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRow {
    pub id: i64,
    pub hash_id: i64,
    pub subscriber_id: i64,
    pub entity_type: String,
    pub entity_id: String,
    /// Composite hash, or the attribute hash when there is none.
    pub current_hash: String,
    pub hash_deleted: bool,
    pub record: DeliveryRecord,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRow {
    fn from_row(row: &PgRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        let attempts: i32 = row.try_get("attempts")?;
        let error_type: Option<String> = row.try_get("error_type")?;

        let record = DeliveryRecord {
            status: DeliveryStatus::parse(&status)
                .ok_or_else(|| anyhow!("invalid delivery status in db: {status}"))?,
            attempts: u32::try_from(attempts)
                .map_err(|_| anyhow!("negative attempts in db: {attempts}"))?,
            last_error: row.try_get("last_error")?,
            last_response_code: row.try_get("last_response_code")?,
            error_type: error_type
                .map(|s| {
                    ErrorCategory::parse(&s).ok_or_else(|| anyhow!("invalid error_type in db: {s}"))
                })
                .transpose()?,
            next_try: row.try_get("next_try")?,
            published_hash: row.try_get("published_hash")?,
            published_at: row.try_get("published_at")?,
            metadata: row.try_get("metadata")?,
        };

        Ok(Self {
            id: row.try_get("id")?,
            hash_id: row.try_get("hash_id")?,
            subscriber_id: row.try_get("subscriber_id")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            current_hash: row.try_get("current_hash")?,
            hash_deleted: row.try_get("hash_deleted")?,
            record,
            dispatched_at: row.try_get("dispatched_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryStore {
    pool: PgPool,
    tables: StoreTables,
}

impl DeliveryStore {
    pub fn new(pool: PgPool, tables: StoreTables) -> Self {
        Self { pool, tables }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn select_sql(&self) -> String {
        format!(
            r#"
            select d.id, d.hash_id, d.subscriber_id, h.entity_type, h.entity_id,
                   coalesce(h.composite_hash, h.attribute_hash) as current_hash,
                   (h.deleted_at is not null) as hash_deleted,
                   d.status, d.attempts, d.last_error, d.last_response_code, d.error_type,
                   d.next_try, d.published_hash, d.published_at, d.metadata,
                   d.dispatched_at, d.created_at, d.updated_at
            from {} d
            join {} h on h.id = d.hash_id
            "#,
            self.tables.deliveries(),
            self.tables.hashes()
        )
    }

    pub async fn get(&self, id: i64) -> Result<Option<DeliveryRow>> {
        let row = sqlx::query(&format!("{} where d.id = $1", self.select_sql()))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("delivery get failed")?;
        row.as_ref().map(DeliveryRow::from_row).transpose()
    }

    /// The delivery row of one entity for one subscriber.
    pub async fn find_for(
        &self,
        entity_type: &str,
        entity_id: &str,
        subscriber_id: i64,
    ) -> Result<Option<DeliveryRow>> {
        let row = sqlx::query(&format!(
            "{} where h.entity_type = $1 and h.entity_id = $2 and d.subscriber_id = $3",
            self.select_sql()
        ))
        .bind(entity_type)
        .bind(entity_id)
        .bind(subscriber_id)
        .fetch_optional(&self.pool)
        .await
        .context("delivery find_for failed")?;
        row.as_ref().map(DeliveryRow::from_row).transpose()
    }

    /// Delivery rows of one subscriber, by id.
    pub async fn list_for_subscriber(&self, subscriber_id: i64) -> Result<Vec<DeliveryRow>> {
        let rows = sqlx::query(&format!(
            "{} where d.subscriber_id = $1 order by d.id",
            self.select_sql()
        ))
        .bind(subscriber_id)
        .fetch_all(&self.pool)
        .await
        .context("delivery list failed")?;
        rows.iter().map(DeliveryRow::from_row).collect()
    }

    /// Number of delivery rows for one entity across all subscribers.
    pub async fn count_for_entity(&self, entity_type: &str, entity_id: &str) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as(&format!(
            "select count(*)::bigint from {} d join {} h on h.id = d.hash_id \
             where h.entity_type = $1 and h.entity_id = $2",
            self.tables.deliveries(),
            self.tables.hashes()
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await
        .context("delivery count failed")?;
        Ok(n)
    }

    /// Row counts by status.
    pub async fn status_counts(&self) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            "select status, count(*)::bigint from {} group by status order by status",
            self.tables.deliveries()
        ))
        .fetch_all(&self.pool)
        .await
        .context("delivery status_counts failed")?;
        Ok(rows.into_iter().collect())
    }

    /// Claim up to `limit` due rows of a subscriber (pending, or deferred with
    /// `next_try <= now`), oldest first, moving them to `dispatched`. Rows
    /// locked by another claimer are skipped.
    pub async fn claim_due(
        &self,
        subscriber_id: i64,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeliveryRow>> {
        let mut tx = self.pool.begin().await.context("claim_due begin failed")?;

        let rows = sqlx::query(&format!(
            "{} where d.subscriber_id = $1 \
               and (d.status = 'pending' or (d.status = 'deferred' and d.next_try <= $2)) \
             order by coalesce(d.next_try, d.created_at), d.id \
             limit $3 \
             for update of d skip locked",
            self.select_sql()
        ))
        .bind(subscriber_id)
        .bind(now)
        .bind(limit.max(0))
        .fetch_all(&mut *tx)
        .await
        .context("claim_due select failed")?;

        let policy = RetryPolicy::default();
        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut d = DeliveryRow::from_row(row)?;
            d.record.apply(&DeliveryEvent::Dispatch, now, &policy)?;
            d.dispatched_at = Some(now);
            claimed.push(d);
        }

        if !claimed.is_empty() {
            let ids: Vec<i64> = claimed.iter().map(|d| d.id).collect();
            sqlx::query(&format!(
                "update {} set status = 'dispatched', dispatched_at = $2, updated_at = now() \
                 where id = any($1)",
                self.tables.deliveries()
            ))
            .bind(&ids)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("claim_due update failed")?;
        }

        tx.commit().await.context("claim_due commit failed")?;
        debug!(subscriber_id, claimed = claimed.len(), "claimed due deliveries");
        Ok(claimed)
    }

    /// Lock one row, let `f` change its record, write it back.
    pub async fn transition<F>(&self, id: i64, f: F) -> Result<DeliveryRow>
    where
        F: FnOnce(&mut DeliveryRow) -> Result<()>,
    {
        let mut tx = self.pool.begin().await.context("transition begin failed")?;
        let row = sqlx::query(&format!("{} where d.id = $1 for update of d", self.select_sql()))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .context("transition select failed")?
            .ok_or_else(|| anyhow!("delivery not found: {id}"))?;
        let mut d = DeliveryRow::from_row(&row)?;

        f(&mut d)?;
        self.write_record(&mut *tx, &d).await?;

        tx.commit().await.context("transition commit failed")?;
        Ok(d)
    }

    async fn write_record(&self, conn: &mut PgConnection, d: &DeliveryRow) -> Result<()> {
        let r = &d.record;
        let attempts = i32::try_from(r.attempts).context("attempts overflow")?;
        sqlx::query(&format!(
            r#"
            update {}
            set status = $2,
                attempts = $3,
                last_error = $4,
                last_response_code = $5,
                error_type = $6,
                next_try = $7,
                published_hash = $8,
                published_at = $9,
                metadata = $10,
                dispatched_at = $11,
                updated_at = now()
            where id = $1
            "#,
            self.tables.deliveries()
        ))
        .bind(d.id)
        .bind(r.status.as_str())
        .bind(attempts)
        .bind(&r.last_error)
        .bind(r.last_response_code)
        .bind(r.error_type.map(|c| c.as_str()))
        .bind(r.next_try)
        .bind(&r.published_hash)
        .bind(r.published_at)
        .bind(&r.metadata)
        .bind(d.dispatched_at)
        .execute(&mut *conn)
        .await
        .context("delivery write failed")?;
        Ok(())
    }

    /// Apply one lifecycle event to a row.
    pub async fn record_outcome(
        &self,
        id: i64,
        event: &DeliveryEvent,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<DeliveryRow> {
        self.transition(id, |d| {
            d.record.apply(event, now, policy)?;
            Ok(())
        })
        .await
    }

    /// Operator mark: published at the current hash, no attempt counted.
    pub async fn mark_published(&self, id: i64, now: DateTime<Utc>) -> Result<DeliveryRow> {
        let row = self
            .transition(id, |d| {
                let event = DeliveryEvent::Published {
                    hash: d.current_hash.clone(),
                    attempted: false,
                    response_code: None,
                };
                d.record.apply(&event, now, &RetryPolicy::default())?;
                Ok(())
            })
            .await?;
        info!(delivery_id = id, "delivery marked published");
        Ok(row)
    }

    /// Publish without delivering: the subscriber declined the entity.
    pub async fn mark_skipped(&self, id: i64, now: DateTime<Utc>) -> Result<DeliveryRow> {
        self.transition(id, |d| {
            let event = DeliveryEvent::Published {
                hash: d.current_hash.clone(),
                attempted: false,
                response_code: None,
            };
            d.record.apply(&event, now, &RetryPolicy::default())?;
            if let Value::Object(m) = &mut d.record.metadata {
                m.insert("skipped".to_string(), Value::Bool(true));
            } else {
                d.record.metadata = serde_json::json!({ "skipped": true });
            }
            Ok(())
        })
        .await
    }

    /// Operator mark: permanent failure.
    pub async fn mark_failed(&self, id: i64, reason: &str, now: DateTime<Utc>) -> Result<DeliveryRow> {
        let event = DeliveryEvent::Failed {
            error: DeliveryError::new(reason, None),
        };
        let row = self
            .record_outcome(id, &event, &RetryPolicy::default(), now)
            .await?;
        info!(delivery_id = id, "delivery marked failed");
        Ok(row)
    }

    /// Hand claimed rows back to `pending`. Rows no longer dispatched are
    /// left alone. Returns rows written.
    pub async fn requeue(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let res = sqlx::query(&format!(
            "update {} set status = 'pending', dispatched_at = null, updated_at = now() \
             where id = any($1) and status = 'dispatched'",
            self.tables.deliveries()
        ))
        .bind(ids.to_vec())
        .execute(&self.pool)
        .await
        .context("requeue failed")?;
        Ok(res.rows_affected())
    }

    /// Requeue rows dispatched before `now - older_than`; their dispatcher is
    /// presumed dead.
    pub async fn requeue_stale(&self, older_than: Duration, now: DateTime<Utc>) -> Result<u64> {
        // a window reaching before the calendar's start cannot match anything
        let Some(cutoff) = now.checked_sub_signed(older_than) else {
            return Ok(0);
        };
        let res = sqlx::query(&format!(
            "update {} set status = 'pending', dispatched_at = null, updated_at = now() \
             where status = 'dispatched' and dispatched_at < $1",
            self.tables.deliveries()
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("requeue_stale failed")?;

        let n = res.rows_affected();
        if n > 0 {
            info!(requeued = n, "stale dispatched deliveries requeued");
        }
        Ok(n)
    }
}
