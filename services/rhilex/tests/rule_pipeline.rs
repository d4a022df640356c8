//! Source payloads flowing through the queue into bound rules

mod support;

use std::time::Duration;

use common::RhilexConfig;
use errors::RhilexError;
use rhilex_core::{EngineHandle, ResourceDef};

use support::{device_rule, harness, rule, wait_until, FAKE_DEVICE, FAKE_SOURCE};

const APPEND: &str = r#"
    function append(tag)
        kv:VSet("order", kv:VGet("order") .. tag)
    end
"#;

fn appending_rule(uuid: &str, tag: &str) -> rhilex_core::RuleDef {
    rule(
        uuid,
        "s1",
        &format!(
            r#"{}
            Actions = {{
                function(args) append("{}") return true, args end,
            }}"#,
            APPEND, tag
        ),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rules_run_in_registration_order() {
    let h = harness(RhilexConfig::default());
    h.engine.start();
    h.engine
        .load_source(ResourceDef::new("s1", "fake", FAKE_SOURCE, serde_json::json!({})))
        .await
        .unwrap();
    h.engine.load_rule(appending_rule("r1", "a")).unwrap();
    h.engine.load_rule(appending_rule("r2", "b")).unwrap();

    h.engine.work_in_end("s1", "{\"temp\":21}").unwrap();
    assert!(wait_until(Duration::from_secs(5), || h.runtime.kv.get("order") == "ab").await);

    // stopped rules are skipped
    h.engine.stop_rule("r1").unwrap();
    h.engine.work_in_end("s1", "{}").unwrap();
    assert!(wait_until(Duration::from_secs(5), || h.runtime.kv.get("order") == "abb").await);

    assert!(wait_until(Duration::from_secs(1), || h.engine.statistics().out_success == 3).await);
    assert_eq!(h.engine.statistics().in_success, 2);
    h.engine.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_false_action_short_circuits() {
    let h = harness(RhilexConfig::default());
    h.engine.start();
    h.engine
        .load_source(ResourceDef::new("s1", "fake", FAKE_SOURCE, serde_json::json!({})))
        .await
        .unwrap();
    let actions = r#"
        Actions = {
            function(args) return false end,
            function(args) kv:VSet("reached", "yes") return true, args end,
        }
    "#;
    h.engine.load_rule(rule("r1", "s1", actions)).unwrap();

    h.engine.work_in_end("s1", "x").unwrap();
    assert!(wait_until(Duration::from_secs(5), || !h.runtime.kv.get("failed").is_empty()).await);
    assert_eq!(h.runtime.kv.get("failed"), "Actions[1] returned false");
    assert_eq!(h.runtime.kv.get("reached"), "");
    assert!(wait_until(Duration::from_secs(1), || h.engine.statistics().out_failed == 1).await);
    h.engine.stop().await;
}

#[tokio::test]
async fn test_rule_needs_a_loaded_resource() {
    let h = harness(RhilexConfig::default());
    let err = h.engine.load_rule(appending_rule("r1", "a")).unwrap_err();
    assert!(matches!(err, RhilexError::NotFound { .. }));

    let mut both = appending_rule("r2", "b");
    both.from_device = Some("d1".to_string());
    assert!(matches!(
        h.engine.load_rule(both).unwrap_err(),
        RhilexError::Validation(_)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_queue_rejects_then_delivers_in_order() {
    let config = RhilexConfig {
        max_queue_size: 2,
        ..RhilexConfig::default()
    };
    let h = harness(config);
    h.engine
        .load_device(ResourceDef::new("d1", "fake", FAKE_DEVICE, serde_json::json!({})))
        .await
        .unwrap();
    let actions = r#"
        Actions = {
            function(args) kv:VSet("order", kv:VGet("order") .. args) return true, args end,
        }
    "#;
    h.engine.load_rule(device_rule("r1", "d1", actions)).unwrap();

    // not started yet: nothing drains the queue
    h.engine.work_device("d1", "1").unwrap();
    h.engine.work_device("d1", "2").unwrap();
    let err = h.engine.work_device("d1", "3").unwrap_err();
    assert!(matches!(err, RhilexError::QueueFull(ref q) if q == "device"));
    assert_eq!(err.to_string(), "queue full: device");

    let stats = h.engine.statistics();
    assert_eq!(stats.in_success, 2);
    assert_eq!(stats.in_failed, 1);

    h.engine.start();
    assert!(wait_until(Duration::from_secs(5), || h.runtime.kv.get("order") == "12").await);
    assert!(wait_until(Duration::from_secs(1), || h.engine.statistics().out_success == 2).await);
    h.engine.stop().await;
}
