use chx_core::{
    AttributeHasher, CompositeHashCalculator, DependencyHashInput, DependencyHasher, HashAlgorithm,
};
use chx_testkit::WeatherFixture;
use std::collections::BTreeMap;

fn values(pairs: &[(&str, Option<&str>)]) -> BTreeMap<String, Option<String>> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
        .collect()
}

async fn check(fx: &WeatherFixture, algorithm: HashAlgorithm) -> anyhow::Result<()> {
    let station = fx.insert_station("Cabauw", "NL", None).await?;
    let a1 = fx.insert_anemometer(station, 12, 95).await?;
    let a2 = fx.insert_anemometer(station, 7, 93).await?;
    let vane = fx.insert_windvane(station, 225).await?;
    fx.sync().await?;

    let store = fx.store();
    let sid = station.to_string();

    // Attribute hash: in process, database single, database bulk, stored.
    let expected = AttributeHasher::new(algorithm).hash(&values(&[
        ("name", Some("Cabauw")),
        ("country", Some("NL")),
        ("location", None),
    ]));
    assert_eq!(expected.len(), algorithm.hex_len());
    assert_eq!(store.attribute_hash_for("station", &sid).await?.as_deref(), Some(expected.as_str()));
    let stored = fx.require_hash("station", station).await?;
    assert_eq!(stored.attribute_hash, expected);

    let a1_expected = AttributeHasher::new(algorithm).hash(&values(&[
        ("speed", Some("12")),
        ("accuracy", Some("95")),
        ("station_id", Some(sid.as_str())),
    ]));
    assert_eq!(fx.require_hash("anemometer", a1).await?.attribute_hash, a1_expected);

    // Dependency hash from the stored edges and hash rows.
    let mut inputs = Vec::new();
    for edge in store.dependencies_of("station", &sid).await? {
        let h = store.get(&edge.entity_type, &edge.entity_id).await?.expect("dependency row");
        inputs.push(DependencyHashInput {
            edge_seq: edge.id,
            entity_type: h.entity_type,
            entity_id: h.entity_id,
            attribute_hash: h.attribute_hash,
            composite_hash: h.composite_hash,
        });
    }
    assert_eq!(inputs.len(), 3);
    let dep = DependencyHasher::new(algorithm).hash(&inputs);
    assert_eq!(store.dependency_hash_for("station", &sid).await?, dep);

    // Composite.
    let composite = CompositeHashCalculator::new(algorithm).composite(&expected, dep.as_deref());
    assert_eq!(stored.composite_hash.as_deref(), Some(composite.as_str()));
    assert_eq!(store.composite_hash_for("station", &sid).await?.as_deref(), Some(composite.as_str()));

    // Bulk equals per-id.
    let ids = vec![a1.to_string(), a2.to_string(), "999999".to_string()];
    let bulk = store.attribute_hashes_for("anemometer", &ids).await?;
    assert_eq!(bulk.len(), 2, "ids without a row are absent");
    let composites = store.composite_hashes_for("windvane", &[vane.to_string()]).await?;
    assert_eq!(
        composites.get(&vane.to_string()).cloned().flatten().as_deref(),
        Some(fx.require_hash("windvane", vane).await?.current_hash())
    );
    for id in [a1, a2] {
        let single = store.attribute_hash_for("anemometer", &id.to_string()).await?;
        assert_eq!(bulk.get(&id.to_string()).cloned(), single);
    }

    Ok(())
}

#[tokio::test]
async fn md5_forms_agree() -> anyhow::Result<()> {
    let Some(fx) = WeatherFixture::from_env().await? else {
        return Ok(());
    };
    check(&fx, HashAlgorithm::Md5).await?;
    fx.cleanup().await
}

#[tokio::test]
async fn sha256_forms_agree() -> anyhow::Result<()> {
    let Some(fx) =
        WeatherFixture::from_env_with(|s| s.engine.hash_algorithm = HashAlgorithm::Sha256).await?
    else {
        return Ok(());
    };
    check(&fx, HashAlgorithm::Sha256).await?;
    fx.cleanup().await
}
