//! Subscriber rows.

use crate::tables::StoreTables;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use chx_publish::SubscriberConfig;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Active,
    Inactive,
}

impl SubscriberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberStatus::Active => "active",
            SubscriberStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriberStatus::Active),
            "inactive" => Some(SubscriberStatus::Inactive),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscriber {
    pub id: i64,
    pub entity_type: String,
    pub delivery_strategy: String,
    pub status: SubscriberStatus,
    pub priority: i32,
    pub config: Value,
    pub created_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn is_active(&self) -> bool {
        self.status == SubscriberStatus::Active
    }

    pub fn options(&self) -> SubscriberConfig {
        SubscriberConfig::from_json(&self.config)
    }

    fn from_row(row: &PgRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            entity_type: row.try_get("entity_type")?,
            delivery_strategy: row.try_get("delivery_strategy")?,
            status: SubscriberStatus::parse(&status)
                .ok_or_else(|| anyhow!("invalid subscriber status in db: {status}"))?,
            priority: row.try_get("priority")?,
            config: row.try_get("config")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewSubscriber {
    pub entity_type: String,
    pub delivery_strategy: String,
    pub priority: i32,
    pub config: Value,
}

const COLUMNS: &str = "id, entity_type, delivery_strategy, status, priority, config, created_at";

/// Insert an active subscriber. Returns its id.
pub async fn add_subscriber(pool: &PgPool, tables: &StoreTables, new: &NewSubscriber) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(&format!(
        "insert into {} (entity_type, delivery_strategy, priority, config) \
         values ($1, $2, $3, $4) returning id",
        tables.subscribers()
    ))
    .bind(&new.entity_type)
    .bind(&new.delivery_strategy)
    .bind(new.priority)
    .bind(&new.config)
    .fetch_one(pool)
    .await
    .context("add_subscriber failed")?;
    Ok(id)
}

pub async fn fetch_subscriber(pool: &PgPool, tables: &StoreTables, id: i64) -> Result<Subscriber> {
    let row = sqlx::query(&format!(
        "select {COLUMNS} from {} where id = $1",
        tables.subscribers()
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("fetch_subscriber failed")?
    .ok_or_else(|| anyhow!("subscriber not found: {id}"))?;
    Subscriber::from_row(&row)
}

/// Every subscriber, highest priority first.
pub async fn list_subscribers(pool: &PgPool, tables: &StoreTables) -> Result<Vec<Subscriber>> {
    let rows = sqlx::query(&format!(
        "select {COLUMNS} from {} order by priority desc, id",
        tables.subscribers()
    ))
    .fetch_all(pool)
    .await
    .context("list_subscribers failed")?;
    rows.iter().map(Subscriber::from_row).collect()
}

/// Active subscribers, highest priority first, optionally of one type.
pub async fn active_subscribers(
    pool: &PgPool,
    tables: &StoreTables,
    entity_type: Option<&str>,
) -> Result<Vec<Subscriber>> {
    let rows = sqlx::query(&format!(
        "select {COLUMNS} from {} where status = 'active' \
         and ($1::text is null or entity_type = $1) order by priority desc, id",
        tables.subscribers()
    ))
    .bind(entity_type)
    .fetch_all(pool)
    .await
    .context("active_subscribers failed")?;
    rows.iter().map(Subscriber::from_row).collect()
}

pub async fn set_subscriber_status(
    pool: &PgPool,
    tables: &StoreTables,
    id: i64,
    status: SubscriberStatus,
) -> Result<()> {
    let res = sqlx::query(&format!(
        "update {} set status = $2 where id = $1",
        tables.subscribers()
    ))
    .bind(id)
    .bind(status.as_str())
    .execute(pool)
    .await
    .context("set_subscriber_status failed")?;
    if res.rows_affected() != 1 {
        return Err(anyhow!("subscriber not found: {id}"));
    }
    Ok(())
}
