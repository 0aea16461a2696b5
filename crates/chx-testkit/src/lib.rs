//! Scenario fixtures.
//!
//! `WeatherFixture` gives each test a throwaway Postgres schema holding the
//! weather-station tables (stations, anemometers, windvanes) next to a
//! private copy of the store tables, with the entity declarations of
//! `config/base.yaml` pointed at it. Tests in one binary run in parallel
//! without seeing each other's rows.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chx_config::Settings;
use chx_core::EntityRegistry;
use chx_db::sql::quote_ident;
use chx_db::{
    BulkHashProcessor, DeliveryStore, HashRow, HashStore, NewSubscriber, OrphanReconciler,
    PublishRecordSync, StoreTables,
};
use chx_publish::{DeliveryError, SubscriberConfig};
use chx_runtime::{
    CycleOptions, CycleReport, DeliveryPayload, DeliveryReceipt, DeliveryStrategy, Dispatcher,
    StrategyRegistry, SyncEngine,
};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const BASE_CONFIG: &str = include_str!("../../../config/base.yaml");

pub struct WeatherFixture {
    pub pool: PgPool,
    pub schema: String,
    pub tables: StoreTables,
    pub settings: Settings,
    pub registry: Arc<EntityRegistry>,
}

impl WeatherFixture {
    /// `None` (after printing SKIP) when CHX_DATABASE_URL is not set.
    pub async fn from_env() -> Result<Option<Self>> {
        Self::from_env_with(|_| {}).await
    }

    /// Like [`WeatherFixture::from_env`], with a hook to adjust settings
    /// before anything is built from them.
    pub async fn from_env_with(tweak: impl FnOnce(&mut Settings)) -> Result<Option<Self>> {
        let url = match std::env::var(chx_db::ENV_DB_URL) {
            Ok(v) => v,
            Err(_) => {
                eprintln!("SKIP: CHX_DATABASE_URL not set");
                return Ok(None);
            }
        };
        let pool = PgPoolOptions::new()
            .max_connections(6)
            .connect(&url)
            .await
            .context("fixture connect failed")?;
        Self::create(pool, tweak).await.map(Some)
    }

    pub async fn create(pool: PgPool, tweak: impl FnOnce(&mut Settings)) -> Result<Self> {
        let schema = format!("chx_t_{}", Uuid::new_v4().simple());
        let s = quote_ident(&schema);

        let ddl = [
            format!("create schema {s}"),
            format!(
                "create table {s}.stations (id bigserial primary key, name text not null, \
                 country text, location text, deleted_at timestamptz)"
            ),
            format!(
                "create table {s}.anemometers (id bigserial primary key, station_id bigint, \
                 speed integer, accuracy integer, deleted_at timestamptz)"
            ),
            format!(
                "create table {s}.windvanes (id bigserial primary key, station_id bigint, \
                 direction integer, deleted_at timestamptz)"
            ),
        ];
        for stmt in &ddl {
            sqlx::query(stmt)
                .execute(&pool)
                .await
                .with_context(|| format!("fixture ddl failed: {stmt}"))?;
        }

        let mut settings = chx_config::load_layered_yaml_from_strings(&[BASE_CONFIG])?.settings()?;
        for e in &mut settings.entities {
            e.table.schema = Some(schema.clone());
        }
        settings.storage.schema = Some(schema.clone());
        settings.publish.inter_attempt_delay_ms = 0;
        tweak(&mut settings);

        let tables = StoreTables::from_settings(&settings.storage);
        chx_db::install_schema(&pool, &tables).await?;
        let registry = Arc::new(settings.registry()?);

        Ok(Self {
            pool,
            schema,
            tables,
            settings,
            registry,
        })
    }

    /// Quoted, schema-qualified name of a fixture table.
    pub fn table(&self, name: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(name))
    }

    pub async fn exec(&self, sql: &str) -> Result<u64> {
        let res = sqlx::query(sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("fixture exec failed: {sql}"))?;
        Ok(res.rows_affected())
    }

    pub async fn insert_station(&self, name: &str, country: &str, location: Option<&str>) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(&format!(
            "insert into {} (name, country, location) values ($1, $2, $3) returning id",
            self.table("stations")
        ))
        .bind(name)
        .bind(country)
        .bind(location)
        .fetch_one(&self.pool)
        .await
        .context("insert station failed")?;
        Ok(id)
    }

    pub async fn insert_anemometer(&self, station_id: i64, speed: i32, accuracy: i32) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(&format!(
            "insert into {} (station_id, speed, accuracy) values ($1, $2, $3) returning id",
            self.table("anemometers")
        ))
        .bind(station_id)
        .bind(speed)
        .bind(accuracy)
        .fetch_one(&self.pool)
        .await
        .context("insert anemometer failed")?;
        Ok(id)
    }

    pub async fn insert_windvane(&self, station_id: i64, direction: i32) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(&format!(
            "insert into {} (station_id, direction) values ($1, $2) returning id",
            self.table("windvanes")
        ))
        .bind(station_id)
        .bind(direction)
        .fetch_one(&self.pool)
        .await
        .context("insert windvane failed")?;
        Ok(id)
    }

    /// `update <table> set <assignment> where id = <id>`.
    pub async fn set(&self, table: &str, id: i64, assignment: &str) -> Result<u64> {
        let res = sqlx::query(&format!(
            "update {} set {assignment} where id = $1",
            self.table(table)
        ))
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("update {table} failed"))?;
        Ok(res.rows_affected())
    }

    pub async fn soft_delete(&self, table: &str, id: i64) -> Result<u64> {
        self.set(table, id, "deleted_at = now()").await
    }

    pub async fn hard_delete(&self, table: &str, id: i64) -> Result<u64> {
        let res = sqlx::query(&format!("delete from {} where id = $1", self.table(table)))
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete from {table} failed"))?;
        Ok(res.rows_affected())
    }

    // -----------------------------------------------------------------------
    // Engine handles, all bound to this fixture's tables
    // -----------------------------------------------------------------------

    pub fn store(&self) -> HashStore {
        HashStore::new(
            self.pool.clone(),
            Arc::clone(&self.registry),
            self.tables.clone(),
            self.settings.engine.hash_algorithm,
        )
    }

    pub fn processor(&self) -> BulkHashProcessor {
        BulkHashProcessor::new(self.store(), &self.settings.engine)
    }

    pub fn engine(&self) -> SyncEngine {
        SyncEngine::new(
            self.pool.clone(),
            Arc::clone(&self.registry),
            self.tables.clone(),
            &self.settings.engine,
        )
    }

    pub fn publish_sync(&self) -> PublishRecordSync {
        PublishRecordSync::new(self.pool.clone(), self.tables.clone())
    }

    pub fn orphans(&self) -> OrphanReconciler {
        OrphanReconciler::new(self.store())
    }

    pub fn deliveries(&self) -> DeliveryStore {
        DeliveryStore::new(self.pool.clone(), self.tables.clone())
    }

    pub fn dispatcher(&self, strategies: StrategyRegistry) -> Dispatcher {
        Dispatcher::new(self.store(), strategies, self.settings.publish.clone())
    }

    /// One full cycle over every type.
    pub async fn sync(&self) -> Result<CycleReport> {
        self.engine().run_cycle(&CycleOptions::default()).await
    }

    pub async fn add_subscriber(
        &self,
        entity_type: &str,
        strategy: &str,
        priority: i32,
        config: Value,
    ) -> Result<i64> {
        chx_db::add_subscriber(
            &self.pool,
            &self.tables,
            &NewSubscriber {
                entity_type: entity_type.to_string(),
                delivery_strategy: strategy.to_string(),
                priority,
                config,
            },
        )
        .await
    }

    pub async fn hash(&self, entity_type: &str, id: i64) -> Result<Option<HashRow>> {
        self.store().get(entity_type, &id.to_string()).await
    }

    /// The hash row, which must exist.
    pub async fn require_hash(&self, entity_type: &str, id: i64) -> Result<HashRow> {
        self.hash(entity_type, id)
            .await?
            .with_context(|| format!("no hash row for {entity_type}/{id}"))
    }

    pub async fn cleanup(self) -> Result<()> {
        self.exec(&format!("drop schema {} cascade", quote_ident(&self.schema)))
            .await?;
        self.pool.close().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedDelivery
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Script {
    failures: BTreeMap<String, (String, Option<i32>)>,
    declined: BTreeSet<String>,
    delivered: Vec<DeliveryPayload>,
}

/// Strategy named `scripted`: succeeds unless told otherwise per entity id,
/// and remembers every payload it accepted.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDelivery {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every delivery of `entity_id` with this message and status.
    pub fn fail(&self, entity_id: impl ToString, message: &str, status: Option<i32>) {
        if let Ok(mut s) = self.script.lock() {
            s.failures
                .insert(entity_id.to_string(), (message.to_string(), status));
        }
    }

    pub fn heal(&self, entity_id: impl ToString) {
        if let Ok(mut s) = self.script.lock() {
            s.failures.remove(&entity_id.to_string());
        }
    }

    /// `should_publish` returns false for `entity_id`.
    pub fn decline(&self, entity_id: impl ToString) {
        if let Ok(mut s) = self.script.lock() {
            s.declined.insert(entity_id.to_string());
        }
    }

    pub fn delivered(&self) -> Vec<DeliveryPayload> {
        self.script
            .lock()
            .map(|s| s.delivered.clone())
            .unwrap_or_default()
    }

    /// Builtins plus this strategy.
    pub fn registry(&self) -> StrategyRegistry {
        let mut r = StrategyRegistry::with_builtins();
        r.register(Arc::new(self.clone()));
        r
    }
}

#[async_trait]
impl DeliveryStrategy for ScriptedDelivery {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn should_publish(&self, _options: &SubscriberConfig, payload: &DeliveryPayload) -> bool {
        self.script
            .lock()
            .map(|s| !s.declined.contains(&payload.entity_id))
            .unwrap_or(true)
    }

    async fn deliver(
        &self,
        _options: &SubscriberConfig,
        payload: &DeliveryPayload,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let mut s = self
            .script
            .lock()
            .map_err(|_| DeliveryError::new("script poisoned", None))?;
        if let Some((message, status)) = s.failures.get(&payload.entity_id) {
            return Err(DeliveryError::new(message.clone(), *status));
        }
        s.delivered.push(payload.clone());
        Ok(DeliveryReceipt {
            response_code: Some(200),
        })
    }
}
