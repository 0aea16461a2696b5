use chx_testkit::WeatherFixture;

#[tokio::test]
async fn orphans_are_classified_tombstoned_and_purged() -> anyhow::Result<()> {
    let Some(fx) = WeatherFixture::from_env().await? else {
        return Ok(());
    };

    let station = fx.insert_station("Arcen", "NL", None).await?;
    let missing = fx.insert_anemometer(station, 4, 95).await?;
    let drifted = fx.insert_anemometer(station, 4, 96).await?;
    let vane = fx.insert_windvane(station, 10).await?;
    fx.sync().await?;

    // Changed behind the engine's back, no sync in between.
    fx.hard_delete("anemometers", missing).await?;
    fx.set("anemometers", drifted, "accuracy = 50").await?;
    fx.soft_delete("windvanes", vane).await?;

    let orphans = fx.orphans();
    let a = orphans.reconcile("anemometer", false).await?;
    assert_eq!((a.missing, a.soft_deleted, a.out_of_scope), (1, 0, 1));
    assert_eq!(a.tombstoned, 2);
    assert_eq!(a.purged, 0);

    let v = orphans.reconcile("windvane", false).await?;
    assert_eq!(v.soft_deleted, 1);
    let vh = fx.require_hash("windvane", vane).await?;
    assert!(!vh.is_active());

    // A second sweep finds nothing new.
    let again = orphans.reconcile("anemometer", false).await?;
    assert_eq!(again.found(), 0);

    let purged = orphans.reconcile("anemometer", true).await?;
    assert_eq!(purged.purged, 2);
    assert!(fx.hash("anemometer", missing).await?.is_none());
    assert!(fx.hash("anemometer", drifted).await?.is_none());
    assert_eq!(orphans.reconcile("windvane", true).await?.purged, 1);

    // The next sync settles the station without its former instruments.
    fx.sync().await?;
    let s = fx.require_hash("station", station).await?;
    assert_eq!(s.current_hash(), s.attribute_hash);
    assert!(fx.store().dependencies_of("station", &station.to_string()).await?.is_empty());

    fx.cleanup().await
}
