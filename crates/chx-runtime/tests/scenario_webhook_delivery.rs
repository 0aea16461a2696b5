//! Webhook strategy against a local mock endpoint: JSON body, bearer token
//! from the named env var, and status codes mapped to error categories.

use chx_publish::{ErrorAction, ErrorCategory, SubscriberConfig};
use chx_runtime::{DeliveryPayload, DeliveryStrategy, WebhookDelivery};
use httpmock::prelude::*;
use serde_json::json;

fn payload() -> DeliveryPayload {
    DeliveryPayload {
        delivery_id: 11,
        subscriber_id: 3,
        entity_type: "station".to_string(),
        entity_id: "5".to_string(),
        hash: "9f2c".to_string(),
        attempts: 0,
        entity: json!({"id": 5, "name": "Cabauw", "country": "NL"}),
    }
}

fn options(url: String, extra: serde_json::Value) -> SubscriberConfig {
    let mut cfg = json!({ "url": url });
    if let (Some(m), Some(e)) = (cfg.as_object_mut(), extra.as_object()) {
        m.extend(e.clone());
    }
    SubscriberConfig::from_json(&cfg)
}

#[tokio::test]
async fn success_posts_payload_with_bearer_token() {
    let server = MockServer::start_async().await;
    let hook = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/hooks/stations")
                .header("authorization", "Bearer s3cr3t-token")
                .json_body_partial(r#"{"entity_type":"station","entity_id":"5","hash":"9f2c"}"#);
            then.status(202);
        })
        .await;

    std::env::set_var("CHX_TEST_WEBHOOK_TOKEN", "s3cr3t-token");
    let opts = options(
        server.url("/hooks/stations"),
        json!({"auth_token_env": "CHX_TEST_WEBHOOK_TOKEN"}),
    );

    let receipt = WebhookDelivery::new()
        .deliver(&opts, &payload())
        .await
        .expect("delivery should succeed");

    hook.assert_async().await;
    assert_eq!(receipt.response_code, Some(202));
}

#[tokio::test]
async fn server_error_is_infrastructure_and_deferred() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/down");
            then.status(503).body("maintenance");
        })
        .await;

    let strategy = WebhookDelivery::new();
    let err = strategy
        .deliver(&options(server.url("/down"), json!({})), &payload())
        .await
        .unwrap_err();

    assert_eq!(err.status_code, Some(503));
    assert_eq!(err.category, ErrorCategory::Infrastructure);
    assert_eq!(strategy.categorize_error(&err), ErrorAction::Defer);
}

#[tokio::test]
async fn unprocessable_is_validation_and_fails() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/strict");
            then.status(422).body(r#"{"error":"name too long"}"#);
        })
        .await;

    let strategy = WebhookDelivery::new();
    let err = strategy
        .deliver(&options(server.url("/strict"), json!({})), &payload())
        .await
        .unwrap_err();

    assert_eq!(err.category, ErrorCategory::Validation);
    assert_eq!(strategy.categorize_error(&err), ErrorAction::Fail);
}

#[tokio::test]
async fn rate_limit_asks_to_stop_the_batch() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/busy");
            then.status(429);
        })
        .await;

    let strategy = WebhookDelivery::new();
    let err = strategy
        .deliver(&options(server.url("/busy"), json!({})), &payload())
        .await
        .unwrap_err();

    assert_eq!(err.category, ErrorCategory::RateLimit);
    assert_eq!(strategy.categorize_error(&err), ErrorAction::StopBatch);
}

#[tokio::test]
async fn missing_token_env_var_is_a_validation_failure() {
    let opts = options(
        "http://127.0.0.1:9/never".to_string(),
        json!({"auth_token_env": "CHX_TEST_WEBHOOK_TOKEN_UNSET"}),
    );
    let err = WebhookDelivery::new()
        .deliver(&opts, &payload())
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Validation);
}
