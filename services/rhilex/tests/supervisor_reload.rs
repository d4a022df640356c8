//! DOWN resources are reported on the bus and reloaded from the store

mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::RhilexConfig;
use rhilex_bus::EventMessage;
use rhilex_core::{ResourceDef, ResourceKind, ResourceState};
use serde_json::json;
use tokio::sync::mpsc;

use support::{harness, wait_until, FAKE_DEVICE, FAKE_SOURCE};

fn source_state(h: &support::Harness, id: &str) -> Option<ResourceState> {
    h.engine.get_source_entry(id).map(|e| e.instance.status())
}

#[tokio::test]
async fn test_failed_start_is_retried_until_up() {
    let h = harness(RhilexConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.runtime.bus.subscribe("event.source.down.*", move |msg: EventMessage| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(msg);
        }
    });

    h.probe.failures.store(2, Ordering::SeqCst);
    let def = ResourceDef::new("s1", "flaky", FAKE_SOURCE, json!({}));
    h.store.put_resource(ResourceKind::Source, def.clone());
    assert!(h.engine.load_source(def).await.is_err());
    assert_eq!(source_state(&h, "s1"), Some(ResourceState::Down));

    let down = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(down.topic, "event.source.down.s1");
    assert_eq!(down.payload["uuid"], "s1");

    assert!(
        wait_until(Duration::from_secs(5), || {
            source_state(&h, "s1") == Some(ResourceState::Up)
        })
        .await
    );
    assert_eq!(h.probe.starts.load(Ordering::SeqCst), 3);
    h.engine.stop().await;
}

#[tokio::test]
async fn test_restart_picks_up_stored_config() {
    let h = harness(RhilexConfig::default());
    let def = ResourceDef::new("s1", "fake", FAKE_SOURCE, json!({ "port": 1 }));
    h.store.put_resource(ResourceKind::Source, def.clone());
    h.engine.load_source(def).await.unwrap();

    h.store.put_resource(
        ResourceKind::Source,
        ResourceDef::new("s1", "fake", FAKE_SOURCE, json!({ "port": 2 })),
    );
    h.engine.restart_source("s1").unwrap();

    assert!(wait_until(Duration::from_secs(5), || h.probe.configs.lock().len() == 2).await);
    assert_eq!(h.probe.configs.lock()[1]["port"], 2);
    assert!(
        wait_until(Duration::from_secs(5), || {
            source_state(&h, "s1") == Some(ResourceState::Up)
        })
        .await
    );
    assert_eq!(h.engine.get_source_entry("s1").unwrap().def.config["port"], 2);
    h.engine.stop().await;
}

#[tokio::test]
async fn test_configuration_errors_are_not_retried() {
    let h = harness(RhilexConfig::default());
    let def = ResourceDef::new("s1", "broken", FAKE_SOURCE, json!({ "broken": true }));
    assert!(h.engine.load_source(def).await.is_err());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.probe.starts.load(Ordering::SeqCst), 0);
    assert!(!h.runtime.supervisors.contains("s1"));
}

#[tokio::test]
async fn test_removed_resource_stays_removed() {
    let h = harness(RhilexConfig::default());
    let def = ResourceDef::new("s1", "fake", FAKE_SOURCE, json!({}));
    h.store.put_resource(ResourceKind::Source, def.clone());
    h.engine.load_source(def).await.unwrap();
    h.engine.remove_source("s1").await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.engine.get_source_entry("s1").is_none());
    assert_eq!(h.probe.starts.load(Ordering::SeqCst), 1);
    assert!(h.engine.remove_source("s1").await.is_err());
}

#[tokio::test]
async fn test_save_over_running_device_stops_it() {
    let h = harness(RhilexConfig::default());
    h.engine
        .load_device(ResourceDef::new("d1", "fake", FAKE_DEVICE, json!({ "port": 1 })))
        .await
        .unwrap();
    assert!(h.runtime.supervisors.contains("d1"));
    let running = h.engine.get_device_entry("d1").unwrap().instance;

    h.engine
        .save_device(ResourceDef::new("d1", "fake", FAKE_DEVICE, json!({ "port": 2 })))
        .await
        .unwrap();

    assert_eq!(h.probe.stops.load(Ordering::SeqCst), 1);
    assert_eq!(running.status(), ResourceState::Stop);
    assert!(!h.runtime.supervisors.contains("d1"));
    let saved = h.engine.get_device_entry("d1").unwrap();
    assert!(!std::sync::Arc::ptr_eq(&saved.instance, &running));
    assert_eq!(saved.def.config["port"], 2);
    // saved, not started
    assert_eq!(h.probe.starts.load(Ordering::SeqCst), 1);
}
