use chrono::{Duration, Utc};
use chx_publish::{DeliveryEvent, DeliveryStatus, RetryPolicy};
use chx_testkit::WeatherFixture;
use serde_json::json;
use std::collections::BTreeSet;

#[tokio::test]
async fn concurrent_claims_never_share_a_row() -> anyhow::Result<()> {
    let Some(fx) = WeatherFixture::from_env().await? else {
        return Ok(());
    };

    for i in 0..6 {
        fx.insert_station(&format!("S{i}"), "NL", None).await?;
    }
    let sub = fx.add_subscriber("station", "log", 0, json!({})).await?;
    fx.sync().await?;

    let d1 = fx.deliveries();
    let d2 = fx.deliveries();
    let now = Utc::now();
    let (a, b) = tokio::join!(d1.claim_due(sub, 4, now), d2.claim_due(sub, 4, now));
    let (a, b) = (a?, b?);

    let ids_a: BTreeSet<i64> = a.iter().map(|d| d.id).collect();
    let ids_b: BTreeSet<i64> = b.iter().map(|d| d.id).collect();
    assert!(ids_a.is_disjoint(&ids_b));
    assert_eq!(ids_a.len() + ids_b.len(), 6);
    assert!(a.iter().chain(&b).all(|d| d.record.status == DeliveryStatus::Dispatched));

    assert!(d1.claim_due(sub, 10, Utc::now()).await?.is_empty());

    fx.cleanup().await
}

#[tokio::test]
async fn abandoned_claims_are_requeued_once_stale() -> anyhow::Result<()> {
    let Some(fx) = WeatherFixture::from_env().await? else {
        return Ok(());
    };

    fx.insert_station("Stale", "NL", None).await?;
    fx.insert_station("Staler", "NL", None).await?;
    let sub = fx.add_subscriber("station", "log", 0, json!({})).await?;
    fx.sync().await?;

    let deliveries = fx.deliveries();
    let claimed = deliveries.claim_due(sub, 10, Utc::now()).await?;
    assert_eq!(claimed.len(), 2);

    let window = Duration::seconds(900);
    assert_eq!(deliveries.requeue_stale(window, Utc::now()).await?, 0);
    let later = Utc::now() + Duration::seconds(901);
    assert_eq!(deliveries.requeue_stale(window, later).await?, 2);

    for d in deliveries.list_for_subscriber(sub).await? {
        assert_eq!(d.record.status, DeliveryStatus::Pending);
        assert!(d.dispatched_at.is_none());
    }

    fx.cleanup().await
}

#[tokio::test]
async fn illegal_transition_leaves_the_row_untouched() -> anyhow::Result<()> {
    let Some(fx) = WeatherFixture::from_env().await? else {
        return Ok(());
    };

    fx.insert_station("Illegal", "NL", None).await?;
    let sub = fx.add_subscriber("station", "log", 0, json!({})).await?;
    fx.sync().await?;

    let deliveries = fx.deliveries();
    let row = deliveries.list_for_subscriber(sub).await?.remove(0);
    let err = deliveries
        .record_outcome(row.id, &DeliveryEvent::Requeue, &RetryPolicy::default(), Utc::now())
        .await;
    assert!(err.is_err(), "requeue of a pending row must be rejected");

    let after = deliveries.get(row.id).await?.expect("row");
    assert_eq!(after.record, row.record);
    assert_eq!(after.updated_at, row.updated_at);

    let failed = deliveries.mark_failed(row.id, "operator gave up", Utc::now()).await?;
    assert_eq!(failed.record.status, DeliveryStatus::Failed);
    assert_eq!(failed.record.last_error.as_deref(), Some("operator gave up"));

    fx.cleanup().await
}

#[tokio::test]
async fn operator_mark_published_records_the_current_hash_without_an_attempt() -> anyhow::Result<()> {
    let Some(fx) = WeatherFixture::from_env().await? else {
        return Ok(());
    };

    let id = fx.insert_station("Marked", "NL", Some("52.0,4.9")).await?;
    let sub = fx.add_subscriber("station", "log", 0, json!({})).await?;
    fx.sync().await?;

    let deliveries = fx.deliveries();
    let row = deliveries.list_for_subscriber(sub).await?.remove(0);
    let marked = deliveries.mark_published(row.id, Utc::now()).await?;

    let hash = fx.require_hash("station", id).await?;
    assert_eq!(marked.record.status, DeliveryStatus::Published);
    assert_eq!(marked.record.published_hash.as_deref(), Some(hash.current_hash()));
    assert_eq!(marked.record.attempts, 0);
    assert!(marked.record.published_at.is_some());

    // nothing left to claim
    assert!(deliveries.claim_due(sub, 10, Utc::now()).await?.is_empty());

    fx.cleanup().await
}
