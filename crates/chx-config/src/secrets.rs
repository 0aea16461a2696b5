//! Runtime secret resolution.
//!
//! Config YAML stores only env var NAMES (`storage.database_url_env`,
//! `auth_token_env` in a webhook subscriber's config). Values are read here,
//! once, and never printed: `Debug` redacts them and errors name the
//! variable, not its content.

use crate::settings::Settings;
use anyhow::{bail, Result};

/// Storage credentials resolved from the environment.
#[derive(Clone)]
pub struct ResolvedStorage {
    pub database_url_env: String,
    pub database_url: String,
}

impl std::fmt::Debug for ResolvedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedStorage")
            .field("database_url_env", &self.database_url_env)
            .field("database_url", &"<REDACTED>")
            .finish()
    }
}

/// Value of `var_name`, or `None` when unset or blank.
pub fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Resolve the store's database URL from the env var named in settings.
///
/// # Errors
/// SECRETS_MISSING naming the variable when it is unset or blank.
pub fn resolve_storage(settings: &Settings) -> Result<ResolvedStorage> {
    let name = settings.storage.database_url_env.trim();
    if name.is_empty() {
        bail!("SECRETS_MISSING: storage.database_url_env is blank");
    }
    match resolve_env(name) {
        Some(database_url) => Ok(ResolvedStorage {
            database_url_env: name.to_string(),
            database_url,
        }),
        None => bail!("SECRETS_MISSING: required env var '{}' (database url) is not set or empty", name),
    }
}
