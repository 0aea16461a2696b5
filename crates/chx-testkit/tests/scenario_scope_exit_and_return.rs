use chx_testkit::WeatherFixture;

#[tokio::test]
async fn accuracy_at_the_boundary_is_out_of_scope() -> anyhow::Result<()> {
    let Some(fx) = WeatherFixture::from_env().await? else {
        return Ok(());
    };

    let station = fx.insert_station("Lauwersoog", "NL", None).await?;
    let at_boundary = fx.insert_anemometer(station, 10, 90).await?;
    let above = fx.insert_anemometer(station, 10, 91).await?;
    fx.sync().await?;

    assert!(fx.hash("anemometer", at_boundary).await?.is_none(), "gt 90 excludes 90");
    assert!(fx.require_hash("anemometer", above).await?.is_active());

    fx.cleanup().await
}

#[tokio::test]
async fn leaving_scope_tombstones_and_returning_revives_the_same_row() -> anyhow::Result<()> {
    let Some(fx) = WeatherFixture::from_env().await? else {
        return Ok(());
    };

    let station = fx.insert_station("Vlissingen", "NL", None).await?;
    let a = fx.insert_anemometer(station, 8, 95).await?;
    fx.sync().await?;
    let s_with = fx.require_hash("station", station).await?;
    let original = fx.require_hash("anemometer", a).await?;

    fx.set("anemometers", a, "accuracy = 90").await?;
    let r = fx.sync().await?;
    assert_eq!(r.totals().tombstoned, 1);

    let gone = fx.require_hash("anemometer", a).await?;
    assert!(!gone.is_active());
    // Tombstoned dependencies no longer feed the station.
    let s_without = fx.require_hash("station", station).await?;
    assert_eq!(s_without.current_hash(), s_without.attribute_hash);
    assert_ne!(s_without.current_hash(), s_with.current_hash());

    fx.set("anemometers", a, "accuracy = 91").await?;
    fx.sync().await?;
    let back = fx.require_hash("anemometer", a).await?;
    assert!(back.is_active());
    assert_eq!(back.id, original.id, "revived, not recreated");

    fx.cleanup().await
}

#[tokio::test]
async fn station_leaving_scope_takes_its_instruments_along() -> anyhow::Result<()> {
    let Some(fx) = WeatherFixture::from_env().await? else {
        return Ok(());
    };

    let station = fx.insert_station("Ukkel", "NL", None).await?;
    let a = fx.insert_anemometer(station, 5, 98).await?;
    let v = fx.insert_windvane(station, 180).await?;
    fx.sync().await?;

    fx.set("stations", station, "country = 'BE'").await?;
    fx.sync().await?;

    assert!(!fx.require_hash("station", station).await?.is_active());
    assert!(!fx.require_hash("anemometer", a).await?.is_active());
    assert!(!fx.require_hash("windvane", v).await?.is_active());

    fx.cleanup().await
}

#[tokio::test]
async fn soft_deleted_row_keeps_its_deletion_time() -> anyhow::Result<()> {
    let Some(fx) = WeatherFixture::from_env().await? else {
        return Ok(());
    };

    let station = fx.insert_station("Hoek van Holland", "NL", None).await?;
    let v = fx.insert_windvane(station, 45).await?;
    fx.sync().await?;

    fx.set("windvanes", v, "deleted_at = timestamptz '2026-03-01 08:00:00+00'").await?;
    fx.sync().await?;

    let h = fx.require_hash("windvane", v).await?;
    let at = h.deleted_at.expect("tombstoned");
    assert_eq!(at.to_rfc3339(), "2026-03-01T08:00:00+00:00");

    fx.cleanup().await
}
