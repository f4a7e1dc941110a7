//! Catalog core: end-to-end scenarios over the in-memory store.
//!
//! Each test drives `CatalogService` the way a request handler would and
//! observes the published content snapshot after `flush()`.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::oneshot;

use sos_catalog_core::*;

// ── Test Infrastructure ──────────────────────────────────────────────────

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

async fn start(store: Arc<MemoryCatalogStore>) -> (CatalogService, CoordinatorHandle) {
    CatalogService::start(store, &CatalogConfig::default())
        .await
        .unwrap()
}

fn sensor(procedure: Procedure, property: &str, offering: &str) -> SensorRegistration {
    SensorRegistration {
        procedure,
        offerings: vec![Offering::new(offering)],
        observable_properties: vec![ObservableProperty::new(property)],
        observation_type: None,
    }
}

fn observation(
    procedure: &str,
    property: &str,
    offering: &str,
    ty: ObservationType,
    at: DateTime<Utc>,
) -> ObservationInsert {
    ObservationInsert {
        procedure: Some(procedure.into()),
        observable_property: property.into(),
        offering: offering.into(),
        feature: Feature::new("feature1", Feature::SAMPLING_POINT),
        observation_type: ty,
        times: vec![ObservedTimes::instant(at)],
    }
}

/// procedure1 <- procedure2 <- procedure3, each with its own property and
/// offering.
async fn three_level_hierarchy(service: &CatalogService) {
    service
        .insert_sensor(sensor(Procedure::new("procedure1"), "obsprop1", "offering1"))
        .await
        .unwrap();
    service
        .insert_sensor(sensor(
            Procedure::new("procedure2").with_parent("procedure1"),
            "obsprop2",
            "offering2",
        ))
        .await
        .unwrap();
    service
        .insert_sensor(sensor(
            Procedure::new("procedure3").with_parent("procedure2"),
            "obsprop3",
            "offering3",
        ))
        .await
        .unwrap();
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn hierarchy_and_type_conflict_end_to_end() {
    let (service, handle) = start(Arc::new(MemoryCatalogStore::new())).await;
    three_level_hierarchy(&service).await;

    service
        .insert_observation(observation(
            "procedure3",
            "obsprop3",
            "offering3",
            ObservationType::Measurement,
            t(1_000),
        ))
        .await
        .unwrap();
    service.flush().await.unwrap();

    let snap = service.snapshot().unwrap();
    assert_eq!(
        snap.child_procedures("procedure1", true, false),
        vec!["procedure2", "procedure3"]
    );
    assert_eq!(
        snap.parent_procedures("procedure3", true, false),
        vec!["procedure1", "procedure2"]
    );
    assert_eq!(snap.offerings_for_procedure("procedure3"), vec!["offering3"]);
    assert_eq!(
        snap.constellations(Some("procedure3"), Some("obsprop3"), Some("offering3"))[0]
            .observation_type,
        Some(ObservationType::Measurement)
    );

    let err = service
        .insert_observation(observation(
            "procedure3",
            "obsprop3",
            "offering3",
            ObservationType::Category,
            t(2_000),
        ))
        .await
        .unwrap_err();
    match err {
        CatalogError::TypeConflict {
            stored, proposed, ..
        } => {
            assert_eq!(stored, ObservationType::Measurement);
            assert_eq!(proposed, ObservationType::Category);
        }
        other => panic!("expected TypeConflict, got {other}"),
    }

    // The rejected observation left no trace in the extrema.
    service.flush().await.unwrap();
    let series = SeriesKey::new("procedure3", "obsprop3", "feature1", "offering3");
    assert_eq!(
        service
            .snapshot()
            .unwrap()
            .time_extrema(&series)
            .unwrap()
            .phenomenon_time,
        TimePeriod::instant(t(1_000))
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn held_snapshot_never_changes() {
    let (service, handle) = start(Arc::new(MemoryCatalogStore::new())).await;
    three_level_hierarchy(&service).await;
    service.flush().await.unwrap();

    let held = service.snapshot().unwrap();
    let before = held.stats();

    service
        .insert_sensor(sensor(Procedure::new("procedure4"), "obsprop4", "offering3"))
        .await
        .unwrap();
    service.delete_sensor("procedure2").await.unwrap();
    service.flush().await.unwrap();

    assert_eq!(held.stats(), before);
    assert_eq!(held.offerings_for_procedure("procedure2"), vec!["offering2"]);
    assert!(held.procedure("procedure4").is_none());

    let current = service.snapshot().unwrap();
    assert!(current.generation() > held.generation());
    assert!(current.offerings_for_procedure("procedure2").is_empty());
    assert_eq!(
        current.procedures_for_offering("offering3"),
        vec!["procedure3", "procedure4"]
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn disabled_procedures_are_skipped_in_hierarchy_queries() {
    let (service, handle) = start(Arc::new(MemoryCatalogStore::new())).await;
    three_level_hierarchy(&service).await;
    service.delete_sensor("procedure2").await.unwrap();
    service.flush().await.unwrap();

    let snap = service.snapshot().unwrap();
    assert_eq!(snap.child_procedures("procedure1", true, false), vec!["procedure3"]);
    assert_eq!(
        snap.child_procedures("procedure1", true, true),
        vec!["procedure2", "procedure3"]
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn reinserting_a_deleted_sensor_reuses_its_constellations() {
    let (service, handle) = start(Arc::new(MemoryCatalogStore::new())).await;
    let first = service
        .insert_sensor(sensor(Procedure::new("p"), "q", "o"))
        .await
        .unwrap();
    service.delete_sensor("p").await.unwrap();
    let again = service
        .insert_sensor(sensor(Procedure::new("p"), "q", "o"))
        .await
        .unwrap();
    assert_eq!(first.constellations[0].id, again.constellations[0].id);

    service.flush().await.unwrap();
    let snap = service.snapshot().unwrap();
    assert_eq!(snap.offerings_for_procedure("p"), vec!["o"]);
    assert!(!snap.procedure("p").unwrap().disabled);
    handle.shutdown().await;
}

#[tokio::test]
async fn store_failure_during_rebuild_keeps_serving() {
    let store = Arc::new(MemoryCatalogStore::new());
    let (service, handle) = start(store.clone()).await;
    three_level_hierarchy(&service).await;
    let generation = service.flush().await.unwrap();

    store.set_available(false);
    let err = service.rebuild().await.unwrap_err();
    assert!(matches!(err, CatalogError::StoreUnavailable(_)));
    assert_eq!(service.cache().state(), CacheState::Ready);

    let snap = service.snapshot().unwrap();
    assert_eq!(snap.generation(), generation);
    assert_eq!(snap.offerings_for_procedure("procedure1"), vec!["offering1"]);

    store.set_available(true);
    assert_eq!(service.rebuild().await.unwrap(), generation + 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn failed_initial_load_serves_nothing() {
    let store = Arc::new(MemoryCatalogStore::new());
    store.set_available(false);
    let (service, _coordinator) = CatalogService::new(store.clone(), &CatalogConfig::default());

    assert!(service.rebuild().await.is_err());
    assert_eq!(service.cache().state(), CacheState::Uninitialized);
    assert!(matches!(
        service.snapshot(),
        Err(CatalogError::CacheNotReady(CacheState::Uninitialized))
    ));

    store.set_available(true);
    service.rebuild().await.unwrap();
    assert_eq!(service.cache().state(), CacheState::Ready);
}

#[tokio::test]
async fn queued_rebuild_requests_coalesce() {
    let store = Arc::new(MemoryCatalogStore::new());
    let (service, coordinator) = CatalogService::new(store, &CatalogConfig::default());
    assert_eq!(service.rebuild().await.unwrap(), 1);

    for _ in 0..5 {
        service.request_rebuild().await.unwrap();
    }
    let (tx, rx) = oneshot::channel();
    service.events().send(CacheEvent::Flush(tx)).await.unwrap();

    let handle = coordinator.spawn();
    assert_eq!(rx.await.unwrap(), 2);
    handle.shutdown().await;
}

#[tokio::test]
async fn unknown_names_in_an_insert_trigger_a_rebuild() {
    let store = Arc::new(MemoryCatalogStore::new());
    let (service, handle) = start(store.clone()).await;

    // Written behind the service's back.
    store.save_procedure(&Procedure::new("ghost")).await.unwrap();
    store
        .save_constellation(&ObservationConstellation::new(
            ConstellationKey::new("ghost", "q", "o"),
            false,
        ))
        .await
        .unwrap();

    service
        .events()
        .send(CacheEvent::Inserted(CacheDelta {
            procedure: Some("ghost".into()),
            ..Default::default()
        }))
        .await
        .unwrap();
    service.flush().await.unwrap();

    let snap = service.snapshot().unwrap();
    assert_eq!(snap.offerings_for_procedure("ghost"), vec!["o"]);
    handle.shutdown().await;
}

#[tokio::test]
async fn deleting_a_series_shrinks_extrema() {
    let (service, handle) = start(Arc::new(MemoryCatalogStore::new())).await;
    service
        .insert_sensor(sensor(Procedure::new("p"), "q", "o"))
        .await
        .unwrap();
    for (feature, at) in [("f1", t(10)), ("f2", t(90))] {
        service
            .insert_observation(ObservationInsert {
                feature: Feature::new(feature, Feature::SAMPLING_POINT),
                ..observation("p", "q", "o", ObservationType::Count, at)
            })
            .await
            .unwrap();
    }
    service.flush().await.unwrap();
    assert_eq!(
        service.snapshot().unwrap().global_phenomenon_time(),
        Some(TimePeriod::new(t(10), t(90)))
    );

    let f2 = SeriesKey::new("p", "q", "f2", "o");
    service.delete_series(&f2).await.unwrap();
    service.flush().await.unwrap();

    let snap = service.snapshot().unwrap();
    assert!(snap.time_extrema(&f2).is_none());
    assert_eq!(
        snap.offering_time_extrema("o").unwrap().phenomenon_time,
        TimePeriod::instant(t(10))
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn per_series_strategy_can_be_forced() {
    let store = Arc::new(MemoryCatalogStore::new());
    for f in ["f1", "f2"] {
        store
            .record_observations(&SeriesKey::new("p", "q", f, "o"), &[ObservedTimes::instant(t(1))])
            .await
            .unwrap();
    }
    let config = CatalogConfig {
        extrema_strategy: Some(ExtremaStrategy::PerSeries),
        ..CatalogConfig::default()
    };
    let (service, handle) = CatalogService::start(store.clone(), &config).await.unwrap();
    assert_eq!(store.extrema_query_count(), 2);
    assert_eq!(service.snapshot().unwrap().stats().series, 2);
    handle.shutdown().await;
}

#[tokio::test]
async fn concurrent_writers_and_readers() {
    let (service, handle) = start(Arc::new(MemoryCatalogStore::new())).await;
    service
        .insert_sensor(sensor(Procedure::new("p"), "q", "o"))
        .await
        .unwrap();

    let reader = {
        let cache = Arc::clone(service.cache());
        tokio::spawn(async move {
            let mut last = 0;
            for _ in 0..200 {
                let generation = cache.snapshot().unwrap().generation();
                assert!(generation >= last);
                last = generation;
                tokio::task::yield_now().await;
            }
        })
    };

    let writers: Vec<_> = (0..20)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .insert_observation(ObservationInsert {
                        feature: Feature::new(format!("f{i}"), Feature::SAMPLING_POINT),
                        ..observation("p", "q", "o", ObservationType::Measurement, t(i))
                    })
                    .await
            })
        })
        .collect();
    for w in writers {
        w.await.unwrap().unwrap();
    }
    reader.await.unwrap();
    service.flush().await.unwrap();

    let snap = service.snapshot().unwrap();
    assert_eq!(snap.features_for_offering("o").len(), 20);
    assert_eq!(
        snap.offering_time_extrema("o").unwrap().phenomenon_time,
        TimePeriod::new(t(0), t(19))
    );
    assert_eq!(service.lookup(Some("p"), Some("q"), Some("o")).await.len(), 1);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deleting_a_sensor_during_concurrent_inserts_leaves_no_membership() {
    let (service, handle) = start(Arc::new(MemoryCatalogStore::new())).await;
    service
        .insert_sensor(sensor(Procedure::new("p"), "q", "o"))
        .await
        .unwrap();
    service
        .insert_sensor(sensor(Procedure::new("other"), "q", "o"))
        .await
        .unwrap();

    let inserts: Vec<_> = (0..40)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .insert_observation(ObservationInsert {
                        feature: Feature::new(format!("f{i}"), Feature::SAMPLING_POINT),
                        ..observation("p", "q", "o", ObservationType::Measurement, t(i))
                    })
                    .await
            })
        })
        .collect();
    let delete = {
        let service = service.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            service.delete_sensor("p").await
        })
    };

    for insert in inserts {
        match insert.await.unwrap() {
            Ok(_) | Err(CatalogError::UnknownConstellation { .. }) => {}
            Err(other) => panic!("unexpected insert failure: {other}"),
        }
    }
    assert_eq!(delete.await.unwrap().unwrap(), 1);
    service.flush().await.unwrap();

    let snap = service.snapshot().unwrap();
    assert!(snap.offerings_for_procedure("p").is_empty());
    assert!(snap.observable_properties_for_procedure("p").is_empty());
    assert_eq!(snap.procedures_for_offering("o"), vec!["other"]);
    assert!(snap.constellations(Some("p"), None, None).is_empty());
    assert!(service.lookup(Some("p"), None, None).await.is_empty());
    handle.shutdown().await;
}

#[tokio::test]
async fn closed_cache_rejects_reads() {
    let (service, handle) = start(Arc::new(MemoryCatalogStore::new())).await;
    service.cache().close();
    assert!(matches!(
        service.snapshot(),
        Err(CatalogError::CacheNotReady(CacheState::Closed))
    ));
    handle.shutdown().await;
}

#[tokio::test]
async fn demo_seed_bundle_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../sos-catalog-daemon/seeds/demo.yaml");
    let bundle = SeedBundle::load(&path).unwrap();
    let store = Arc::new(MemoryCatalogStore::seeded(&bundle).unwrap());
    let (service, handle) = start(store).await;

    let snap = service.snapshot().unwrap();
    assert_eq!(
        snap.child_procedures("procedure1", true, false),
        vec!["procedure2", "procedure3"]
    );
    assert_eq!(
        snap.observable_properties_for_offering("wind-offering"),
        vec!["wind", "wind_direction", "wind_speed"]
    );
    assert_eq!(
        snap.observation_types_for_offering("wind-offering"),
        vec![ObservationType::Complex]
    );

    // Composite wind observations check out against the seeded type.
    service
        .check_and_register(Some("wind-mast"), "wind", "wind-offering", ObservationType::Complex)
        .await
        .unwrap();
    let err = service
        .check_and_register(None, "wind", "wind-offering", ObservationType::Measurement)
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::TypeConflict { .. }));
    handle.shutdown().await;
}
