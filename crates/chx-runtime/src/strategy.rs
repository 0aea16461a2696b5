//! Delivery strategies: how one entity reaches one subscriber.

use async_trait::async_trait;
use chx_publish::{DeliveryError, ErrorAction, ErrorCategory, SubscriberConfig};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 10_000;

/// What a strategy is handed for one delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryPayload {
    pub delivery_id: i64,
    pub subscriber_id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub hash: String,
    /// Attempts made before this one.
    pub attempts: u32,
    /// The backing row as JSON.
    pub entity: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub response_code: Option<i32>,
}

/// Pluggable transport. Failures are reported, never raised: the dispatcher
/// records them on the delivery row.
#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Declined entities are marked published without an attempt.
    fn should_publish(&self, _options: &SubscriberConfig, _payload: &DeliveryPayload) -> bool {
        true
    }

    async fn deliver(
        &self,
        options: &SubscriberConfig,
        payload: &DeliveryPayload,
    ) -> Result<DeliveryReceipt, DeliveryError>;

    fn categorize_error(&self, error: &DeliveryError) -> ErrorAction {
        error.category.default_action()
    }
}

/// Writes one log event per delivery. Always succeeds.
#[derive(Debug, Clone, Default)]
pub struct LogDelivery;

#[async_trait]
impl DeliveryStrategy for LogDelivery {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(
        &self,
        _options: &SubscriberConfig,
        payload: &DeliveryPayload,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        info!(
            subscriber_id = payload.subscriber_id,
            entity_type = %payload.entity_type,
            entity_id = %payload.entity_id,
            hash = %payload.hash,
            "entity changed"
        );
        Ok(DeliveryReceipt::default())
    }
}

/// POSTs the payload as JSON to the subscriber's `url`.
///
/// Options: `url` (required), `timeout_ms`, `auth_token_env` (name of an env
/// var holding a bearer token; the token itself never lives in config).
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    http: reqwest::Client,
}

impl Default for WebhookDelivery {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookDelivery {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DeliveryStrategy for WebhookDelivery {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(
        &self,
        options: &SubscriberConfig,
        payload: &DeliveryPayload,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let url = options.extra_str("url").ok_or_else(|| {
            DeliveryError::with_category("webhook url not configured", None, ErrorCategory::Validation)
        })?;
        let timeout = options
            .extra_u64("timeout_ms")
            .unwrap_or(DEFAULT_WEBHOOK_TIMEOUT_MS);

        let mut req = self
            .http
            .post(url)
            .timeout(Duration::from_millis(timeout))
            .json(payload);
        if let Some(env) = options.extra_str("auth_token_env") {
            let token = chx_config::resolve_env(env).ok_or_else(|| {
                DeliveryError::with_category(
                    format!("webhook token env var {env} not set"),
                    None,
                    ErrorCategory::Validation,
                )
            })?;
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| {
            let category = if e.is_timeout() || e.is_connect() {
                ErrorCategory::Infrastructure
            } else {
                chx_publish::categorize(&e.to_string(), None)
            };
            DeliveryError::with_category(format!("webhook request failed: {e}"), None, category)
        })?;

        let status = resp.status();
        let code = i32::from(status.as_u16());
        if status.is_success() {
            return Ok(DeliveryReceipt {
                response_code: Some(code),
            });
        }

        let body = resp.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(500).collect();
        Err(DeliveryError::new(
            format!("webhook status={} body={excerpt}", status.as_u16()),
            Some(code),
        ))
    }
}

/// Strategies by name, as stored in `subscribers.delivery_strategy`.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    by_name: BTreeMap<String, Arc<dyn DeliveryStrategy>>,
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.by_name.keys()).finish()
    }
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `log` and `webhook`.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register(Arc::new(LogDelivery));
        r.register(Arc::new(WebhookDelivery::new()));
        r
    }

    /// Later registrations replace earlier ones of the same name.
    pub fn register(&mut self, strategy: Arc<dyn DeliveryStrategy>) {
        self.by_name.insert(strategy.name().to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DeliveryStrategy>> {
        self.by_name.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(|k| k.as_str())
    }
}
