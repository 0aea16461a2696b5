//! Typed settings extracted from the merged config JSON.
//!
//! Every section and every key is optional; missing keys take the defaults
//! below. Unknown keys are not an error here; `report_unused_keys` decides
//! what to do with them.

use anyhow::{Context, Result};
use chx_core::{DeclaredEntity, EntityRegistry, HashAlgorithm};
use chx_publish::DEFAULT_RETRY_INTERVALS;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_MAX_CASCADE_DEPTH: u32 = 32;
pub const DEFAULT_DATABASE_URL_ENV: &str = "CHX_DATABASE_URL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub publish: PublishSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub entities: Vec<DeclaredEntity>,
}

impl Settings {
    pub fn from_config_json(config_json: &Value) -> Result<Self> {
        serde_json::from_value(config_json.clone()).context("config does not match settings shape")
    }

    /// Validated registry of the declared entity types.
    pub fn registry(&self) -> Result<EntityRegistry> {
        EntityRegistry::from_declared(self.entities.clone())
            .context("invalid entity declarations")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub hash_algorithm: HashAlgorithm,
    /// Rows per bulk upsert statement.
    pub chunk_size: usize,
    /// Cap on changed ids handled per entity type per pass.
    pub change_limit: Option<i64>,
    /// Composite recomputation rounds before the cascade gives up.
    pub max_cascade_depth: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hash_algorithm: HashAlgorithm::Md5,
            chunk_size: DEFAULT_CHUNK_SIZE,
            change_limit: None,
            max_cascade_depth: DEFAULT_MAX_CASCADE_DEPTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSettings {
    /// Backoff table in seconds, used when a subscriber does not override it.
    pub retry_intervals: Vec<u64>,
    /// Rows claimed per subscriber per round.
    pub batch_size: u32,
    /// Row budget for one dispatch batch; the rest goes to a continuation.
    pub max_rows_per_batch: u32,
    pub max_batch_seconds: u64,
    pub lock_timeout_secs: u64,
    pub inter_attempt_delay_ms: u64,
    /// Dispatched rows older than this are assumed abandoned.
    pub stale_dispatch_secs: u64,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            retry_intervals: DEFAULT_RETRY_INTERVALS.to_vec(),
            batch_size: 100,
            max_rows_per_batch: 1000,
            max_batch_seconds: 300,
            lock_timeout_secs: 30,
            inter_attempt_delay_ms: 50,
            stale_dispatch_secs: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Name of the env var holding the store's database URL.
    pub database_url_env: String,
    /// Schema qualifying the store tables. `None` uses the search path.
    pub schema: Option<String>,
    pub tables: TableNames,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_url_env: DEFAULT_DATABASE_URL_ENV.to_string(),
            schema: None,
            tables: TableNames::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableNames {
    pub hashes: String,
    pub hash_dependents: String,
    pub subscribers: String,
    pub deliveries: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            hashes: "chx_hashes".to_string(),
            hash_dependents: "chx_hash_dependents".to_string(),
            subscribers: "chx_subscribers".to_string(),
            deliveries: "chx_deliveries".to_string(),
        }
    }
}
