use chx_testkit::WeatherFixture;

#[tokio::test]
async fn station_composite_tracks_its_instruments() -> anyhow::Result<()> {
    let Some(fx) = WeatherFixture::from_env().await? else {
        return Ok(());
    };

    let station = fx.insert_station("Cabauw", "NL", Some("51.97,4.93")).await?;
    let a1 = fx.insert_anemometer(station, 12, 95).await?;
    let a2 = fx.insert_anemometer(station, 14, 99).await?;
    let vane = fx.insert_windvane(station, 270).await?;

    let first = fx.sync().await?;
    let t = first.totals();
    assert_eq!(t.created, 4, "one hash row per in-scope entity");
    assert_eq!(t.tombstoned, 0);

    let s = fx.require_hash("station", station).await?;
    let composite = s.composite_hash.clone().expect("station has dependencies");
    assert_ne!(composite, s.attribute_hash);
    assert!(s.dependencies_built);

    // Leaves have no dependencies: composite equals attribute hash.
    let leaf = fx.require_hash("anemometer", a1).await?;
    assert_eq!(leaf.current_hash(), leaf.attribute_hash);

    let edges = fx.store().dependencies_of("station", &station.to_string()).await?;
    let mut feeding: Vec<(String, String)> = edges
        .iter()
        .map(|e| (e.entity_type.clone(), e.entity_id.clone()))
        .collect();
    feeding.sort();
    assert_eq!(
        feeding,
        vec![
            ("anemometer".to_string(), a1.to_string()),
            ("anemometer".to_string(), a2.to_string()),
            ("windvane".to_string(), vane.to_string()),
        ]
    );

    // A child edit moves the parent's composite, not its attribute hash.
    fx.set("anemometers", a2, "speed = 31").await?;
    let second = fx.sync().await?;
    assert_eq!(second.totals().updated, 1, "only the edited anemometer is rehashed");
    assert!(second.totals().cascaded >= 1);

    let s2 = fx.require_hash("station", station).await?;
    assert_eq!(s2.attribute_hash, s.attribute_hash);
    assert_ne!(s2.composite_hash.as_deref(), Some(composite.as_str()));

    // Reverting the edit restores the earlier composite exactly.
    fx.set("anemometers", a2, "speed = 14").await?;
    fx.sync().await?;
    let s3 = fx.require_hash("station", station).await?;
    assert_eq!(s3.composite_hash.as_deref(), Some(composite.as_str()));

    fx.cleanup().await
}

#[tokio::test]
async fn second_pass_over_unchanged_data_writes_nothing() -> anyhow::Result<()> {
    let Some(fx) = WeatherFixture::from_env().await? else {
        return Ok(());
    };

    let station = fx.insert_station("De Bilt", "NL", None).await?;
    fx.insert_anemometer(station, 3, 97).await?;
    fx.insert_windvane(station, 90).await?;
    fx.add_subscriber("station", "log", 0, serde_json::json!({})).await?;

    let first = fx.sync().await?;
    assert!(first.writes() > 0);

    let before = fx.require_hash("station", station).await?;
    let second = fx.sync().await?;
    assert_eq!(second.writes(), 0, "quiet pass must not write: {second:?}");
    let after = fx.require_hash("station", station).await?;
    assert_eq!(after.updated_at, before.updated_at);

    // Dry run reports pending work without doing it.
    fx.set("stations", station, "name = 'De Bilt 2'").await?;
    let dry = fx
        .engine()
        .run_cycle(&chx_runtime::CycleOptions {
            dry_run: true,
            ..Default::default()
        })
        .await?;
    assert_eq!(dry.totals().pending_changes, 1);
    assert_eq!(dry.writes(), 0);
    let still = fx.require_hash("station", station).await?;
    assert_eq!(still.attribute_hash, before.attribute_hash);

    fx.cleanup().await
}
