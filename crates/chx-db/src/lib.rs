//! chx-db
//!
//! Postgres half of the change-hash engine:
//! - store schema install and status;
//! - SQL composition of the hashers and scope predicates;
//! - `HashStore`, `ChangeDetector`, `BulkHashProcessor`, `OrphanReconciler`;
//! - `PublishRecordSync` and delivery rows (row-locked transitions, claims);
//! - subscribers and the batch lock.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

mod deliveries;
mod detect;
mod hashes;
mod lock;
mod orphans;
mod processor;
mod publish_sync;
pub mod sql;
mod subscribers;
mod tables;

pub use deliveries::{DeliveryRow, DeliveryStore};
pub use detect::ChangeDetector;
pub use hashes::{EdgeRow, HashRow, HashStore};
pub use lock::BatchLock;
pub use orphans::{Orphan, OrphanReason, OrphanReconciler, OrphanReport};
pub use processor::{BulkHashProcessor, ReconcileReport};
pub use publish_sync::{PublishRecordSync, PublishSyncReport};
pub use subscribers::{
    active_subscribers, add_subscriber, fetch_subscriber, list_subscribers,
    set_subscriber_status, NewSubscriber, Subscriber, SubscriberStatus,
};
pub use tables::{install_schema, StoreTables};

pub const ENV_DB_URL: &str = "CHX_DATABASE_URL";

/// Connect using CHX_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")
}

/// Install the default-named store tables. Safe to re-run.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    install_schema(pool, &StoreTables::default()).await
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_store_tables: bool,
}

/// Connectivity plus presence of all four store tables.
pub async fn status(pool: &PgPool, tables: &StoreTables) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (present,): (bool,) = sqlx::query_as(
        "select to_regclass($1::text) is not null and to_regclass($2::text) is not null \
         and to_regclass($3::text) is not null and to_regclass($4::text) is not null",
    )
    .bind(tables.hashes())
    .bind(tables.hash_dependents())
    .bind(tables.subscribers())
    .bind(tables.deliveries())
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_store_tables: present,
    })
}
