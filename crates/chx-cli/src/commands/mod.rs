//! Command handlers for the `chx` binary.
//!
//! Shared loading and connection helpers live here; each submodule owns one
//! command family. Handlers print `key=value` lines to stdout.

pub mod publish;
pub mod sync;

use anyhow::{Context, Result};
use chx_config::{LoadedConfig, Settings, UnusedKeyPolicy};
use chx_db::StoreTables;
use sqlx::PgPool;
use tracing::warn;

/// A loaded config with its typed settings and an open store connection.
pub struct Session {
    pub loaded: LoadedConfig,
    pub settings: Settings,
    pub pool: PgPool,
    pub tables: StoreTables,
}

/// Merge `paths` in order and extract settings. Unused keys are warned about,
/// never fatal.
pub fn load_settings(paths: &[String]) -> Result<(LoadedConfig, Settings)> {
    let loaded = chx_config::load_layered_yaml(paths)?;
    let report = chx_config::report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn)?;
    for key in &report.unused_leaf_pointers {
        warn!(key = %key, "config key is not read by anything");
    }
    let settings = loaded.settings()?;
    Ok((loaded, settings))
}

pub async fn open(paths: &[String]) -> Result<Session> {
    let (loaded, settings) = load_settings(paths)?;
    let storage = chx_config::resolve_storage(&settings)?;
    let pool = chx_db::connect(&storage.database_url)
        .await
        .with_context(|| format!("connect via {} failed", storage.database_url_env))?;
    let tables = StoreTables::from_settings(&settings.storage);
    Ok(Session {
        loaded,
        settings,
        pool,
        tables,
    })
}

/// Store connection for the `db` commands: from `--config` when given,
/// otherwise CHX_DATABASE_URL and the default table names.
pub async fn open_store(paths: &[String]) -> Result<(PgPool, StoreTables)> {
    if paths.is_empty() {
        return Ok((chx_db::connect_from_env().await?, StoreTables::default()));
    }
    let s = open(paths).await?;
    Ok((s.pool, s.tables))
}
