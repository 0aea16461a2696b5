//! Store table names and DDL.

use crate::sql::quote_ident;
use anyhow::{Context, Result};
use chx_config::{StorageSettings, TableNames};
use sqlx::{Executor, PgPool};

/// Names of the four store tables, optionally qualified by a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTables {
    pub schema: Option<String>,
    pub names: TableNames,
}

impl Default for StoreTables {
    fn default() -> Self {
        Self {
            schema: None,
            names: TableNames::default(),
        }
    }
}

impl StoreTables {
    pub fn from_settings(storage: &StorageSettings) -> Self {
        Self {
            schema: storage.schema.clone(),
            names: storage.tables.clone(),
        }
    }

    /// Default names inside `schema`.
    pub fn in_schema(schema: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            names: TableNames::default(),
        }
    }

    fn qualify(&self, name: &str) -> String {
        match &self.schema {
            Some(s) => format!("{}.{}", quote_ident(s), quote_ident(name)),
            None => quote_ident(name),
        }
    }

    pub fn hashes(&self) -> String {
        self.qualify(&self.names.hashes)
    }

    pub fn hash_dependents(&self) -> String {
        self.qualify(&self.names.hash_dependents)
    }

    pub fn subscribers(&self) -> String {
        self.qualify(&self.names.subscribers)
    }

    pub fn deliveries(&self) -> String {
        self.qualify(&self.names.deliveries)
    }

    /// Statements creating the store. Every statement is idempotent.
    pub fn ddl(&self) -> Vec<String> {
        let h = self.hashes();
        let d = self.hash_dependents();
        let s = self.subscribers();
        let dl = self.deliveries();
        let n = &self.names;
        let ix = |table: &str, suffix: &str| quote_ident(&format!("{table}_{suffix}"));

        let mut out = Vec::new();
        if let Some(schema) = &self.schema {
            out.push(format!("create schema if not exists {}", quote_ident(schema)));
        }

        out.push(format!(
            r#"
            create table if not exists {h} (
              id                  bigserial primary key,
              entity_type         text not null,
              entity_id           text not null,
              attribute_hash      text not null,
              composite_hash      text,
              dependencies_built  boolean not null default false,
              deleted_at          timestamptz,
              created_at          timestamptz not null default now(),
              updated_at          timestamptz not null default now(),
              constraint {uq} unique (entity_type, entity_id)
            )
            "#,
            uq = ix(&n.hashes, "entity_key"),
        ));
        out.push(format!(
            "create index if not exists {} on {h} (entity_type) where deleted_at is null",
            ix(&n.hashes, "active_idx"),
        ));

        out.push(format!(
            r#"
            create table if not exists {d} (
              id              bigserial primary key,
              hash_id         bigint not null references {h}(id) on delete cascade,
              dependent_type  text not null,
              dependent_id    text not null,
              relation_name   text not null,
              created_at      timestamptz not null default now(),
              constraint {uq} unique (hash_id, dependent_type, dependent_id)
            )
            "#,
            uq = ix(&n.hash_dependents, "edge_key"),
        ));
        out.push(format!(
            "create index if not exists {} on {d} (dependent_type, dependent_id)",
            ix(&n.hash_dependents, "dependent_idx"),
        ));

        out.push(format!(
            r#"
            create table if not exists {s} (
              id                 bigserial primary key,
              entity_type        text not null,
              delivery_strategy  text not null,
              status             text not null default 'active',
              priority           integer not null default 0,
              config             jsonb not null default '{{}}'::jsonb,
              created_at         timestamptz not null default now(),
              constraint {ck} check (status in ('active', 'inactive'))
            )
            "#,
            ck = ix(&n.subscribers, "status_check"),
        ));
        out.push(format!(
            "create index if not exists {} on {s} (entity_type, status)",
            ix(&n.subscribers, "type_idx"),
        ));

        out.push(format!(
            r#"
            create table if not exists {dl} (
              id                  bigserial primary key,
              hash_id             bigint not null references {h}(id) on delete cascade,
              subscriber_id       bigint not null references {s}(id) on delete cascade,
              status              text not null default 'pending',
              attempts            integer not null default 0,
              last_error          text,
              last_response_code  integer,
              error_type          text,
              next_try            timestamptz,
              published_hash      text,
              published_at        timestamptz,
              metadata            jsonb not null default '{{}}'::jsonb,
              dispatched_at       timestamptz,
              created_at          timestamptz not null default now(),
              updated_at          timestamptz not null default now(),
              constraint {uq} unique (hash_id, subscriber_id),
              constraint {ck_status} check (status in
                ('pending', 'dispatched', 'deferred', 'published', 'failed', 'soft_deleted')),
              constraint {ck_attempts} check (attempts >= 0),
              constraint {ck_error} check (error_type is null or error_type in
                ('validation', 'infrastructure', 'data', 'rate_limit', 'unknown'))
            )
            "#,
            uq = ix(&n.deliveries, "pair_key"),
            ck_status = ix(&n.deliveries, "status_check"),
            ck_attempts = ix(&n.deliveries, "attempts_check"),
            ck_error = ix(&n.deliveries, "error_type_check"),
        ));
        out.push(format!(
            "create index if not exists {} on {dl} (subscriber_id, status, next_try)",
            ix(&n.deliveries, "due_idx"),
        ));

        out
    }
}

/// Create the store tables, in one transaction.
pub async fn install_schema(pool: &PgPool, tables: &StoreTables) -> Result<()> {
    let mut tx = pool.begin().await.context("install_schema begin failed")?;
    for stmt in tables.ddl() {
        (&mut *tx)
            .execute(stmt.as_str())
            .await
            .with_context(|| format!("install_schema failed on: {}", first_line(&stmt)))?;
    }
    tx.commit().await.context("install_schema commit failed")?;
    Ok(())
}

fn first_line(stmt: &str) -> &str {
    stmt.trim().lines().next().unwrap_or("")
}
