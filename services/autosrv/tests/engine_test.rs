//! End-to-end engine scenarios over the in-memory backends
//!
//! Each test drives the real pipeline: a state message is ingested into the
//! debounce stream, drained into a `device_update` task, and pumped through
//! the engine's task handler, which fans out and executes `evaluate_rule`
//! tasks exactly as the worker pool would.

use autosrv::config::EngineConfig;
use autosrv::engine::{ingress, CommandSink, Engine, MemorySink};
use autosrv::keys;
use autosrv::models::{Device, Rule};
use autosrv::repository::{MemoryRepository, Repository};
use autosrv::taskqueue::TaskHandler;
use bytes::Bytes;
use hearth_rtdb::{FixedTimeProvider, MemoryRtdb, Rtdb};
use serde_json::{json, Value};
use std::sync::Arc;

struct Harness {
    rtdb: Arc<dyn Rtdb>,
    repo: Arc<MemoryRepository>,
    sink: Arc<MemorySink>,
    engine: Arc<Engine>,
}

impl Harness {
    fn at_time(hour: u8, minute: u8) -> Self {
        let rtdb: Arc<dyn Rtdb> = Arc::new(MemoryRtdb::new());
        let repo = Arc::new(MemoryRepository::new());
        let sink = Arc::new(MemorySink::new());
        let engine = Engine::new(
            Arc::clone(&rtdb),
            Arc::clone(&repo) as Arc<dyn Repository>,
            Arc::clone(&sink) as Arc<dyn CommandSink>,
            Arc::new(FixedTimeProvider::at_time_of_day(hour, minute)),
            EngineConfig::default(),
        );
        Self {
            rtdb,
            repo,
            sink,
            engine,
        }
    }

    fn new() -> Self {
        Self::at_time(12, 0)
    }

    async fn seed_device(&self, id: &str) {
        self.repo
            .put_device(Device {
                id: id.into(),
                name: id.into(),
                kind: "sensor".into(),
                state: json!({}),
                mqtt_topic: keys::state_topic(id),
                accepted: true,
                owner_id: None,
            })
            .await;
    }

    async fn seed_cache(&self, device_id: &str, state: Value) {
        self.rtdb
            .set_ex(
                &keys::device_state(device_id),
                Bytes::from(state.to_string()),
                3600,
            )
            .await
            .unwrap();
    }

    /// Publish a state message and run it through debounce + task pipeline.
    async fn publish_state(&self, device_id: &str, state: Value) {
        ingress::ingest_state_message(
            self.rtdb.as_ref(),
            100,
            &keys::state_topic(device_id),
            state.to_string().as_bytes(),
        )
        .await;
        ingress::drain_once(self.rtdb.as_ref(), self.engine.queue())
            .await
            .unwrap();
        self.pump().await;
    }

    /// Run queued tasks to completion, like the worker pool would.
    async fn pump(&self) {
        while let Some(task) = self.engine.queue().try_pop().await.unwrap() {
            let _ = self.engine.handle(&task).await;
        }
    }
}

fn threshold_rule(id: &str, enabled: bool, fan_on: bool) -> Rule {
    Rule {
        id: id.into(),
        name: format!("rule {id}"),
        conditions: json!({
            "type": "sensor", "device_id": "t1", "key": "temperature",
            "op": ">", "value": 30
        }),
        actions: json!([{
            "device_id": "fan1", "action": "set_state", "params": {"on": fan_on}
        }]),
        enabled,
        owner_id: None,
    }
}

// Scenario 1: fire on threshold
#[tokio::test]
async fn fire_on_threshold_publishes_exactly_once() {
    let h = Harness::new();
    h.seed_device("t1").await;
    h.repo.put_rule(threshold_rule("r1", true, true)).await;
    h.engine.refresh_rule("r1").await.unwrap();

    h.publish_state("t1", json!({"temperature": 35})).await;

    assert_eq!(h.sink.commands_for("fan1"), vec![json!({"on": true})]);
    assert_eq!(h.sink.published().len(), 1);
}

// Scenario 2: redundancy short-circuit
#[tokio::test]
async fn redundant_command_is_not_republished() {
    let h = Harness::new();
    h.seed_device("t1").await;
    h.repo.put_rule(threshold_rule("r1", true, true)).await;
    h.engine.refresh_rule("r1").await.unwrap();
    h.seed_cache("fan1", json!({"on": true})).await;

    h.publish_state("t1", json!({"temperature": 35})).await;

    assert!(h.sink.published().is_empty());
}

// Idempotence: a second evaluation after the device reports the commanded
// state publishes nothing.
#[tokio::test]
async fn repeat_evaluation_is_idempotent() {
    let h = Harness::new();
    h.seed_device("t1").await;
    h.repo.put_rule(threshold_rule("r1", true, true)).await;
    h.engine.refresh_rule("r1").await.unwrap();
    h.seed_cache("t1", json!({"temperature": 35})).await;

    h.engine.trigger_rule("r1").await.unwrap();
    h.pump().await;
    assert_eq!(h.sink.published().len(), 1);

    // Feedback loop: the fan republishes its new state
    h.seed_cache("fan1", json!({"on": true})).await;

    h.engine.trigger_rule("r1").await.unwrap();
    h.pump().await;
    assert_eq!(h.sink.published().len(), 1);
}

// Scenario 3: conflict resolution by rule ID
#[tokio::test]
async fn conflicting_rules_resolve_to_lowest_id() {
    let h = Harness::new();
    h.seed_device("t1").await;
    h.repo.put_rule(threshold_rule("a", true, true)).await;
    h.repo.put_rule(threshold_rule("b", true, false)).await;
    h.seed_cache("t1", json!({"temperature": 35})).await;

    // Evaluating the losing rule still yields the winner's value
    h.engine.trigger_rule("b").await.unwrap();
    h.pump().await;
    assert_eq!(h.sink.commands_for("fan1"), vec![json!({"on": true})]);
    assert_eq!(h.sink.published().len(), 1);
}

// Determinism: the resolved command does not depend on execution order.
#[tokio::test]
async fn conflict_resolution_is_order_independent() {
    for trigger_order in [["a", "b"], ["b", "a"]] {
        let h = Harness::new();
        h.seed_device("t1").await;
        h.repo.put_rule(threshold_rule("a", true, true)).await;
        h.repo.put_rule(threshold_rule("b", true, false)).await;
        h.seed_cache("t1", json!({"temperature": 35})).await;

        for rule_id in trigger_order {
            h.engine.trigger_rule(rule_id).await.unwrap();
            h.pump().await;
        }
        for command in h.sink.commands_for("fan1") {
            assert_eq!(command, json!({"on": true}));
        }
    }
}

// Scenario 4: compound AND with one false branch
#[tokio::test]
async fn compound_and_requires_all_branches() {
    let h = Harness::new();
    h.seed_device("t1").await;
    h.seed_device("door").await;
    h.repo
        .put_rule(Rule {
            id: "r1".into(),
            name: "hot with door open".into(),
            conditions: json!({
                "operator": "AND",
                "children": [
                    { "type": "sensor", "device_id": "t1", "key": "temperature", "op": ">", "value": 25 },
                    { "type": "device", "device_id": "door", "key": "open", "op": "==", "value": true }
                ]
            }),
            actions: json!([{ "device_id": "fan1", "action": "set_state", "params": {"on": true} }]),
            enabled: true,
            owner_id: None,
        })
        .await;
    h.engine.refresh_rule("r1").await.unwrap();
    h.seed_cache("door", json!({"open": false})).await;

    h.publish_state("t1", json!({"temperature": 28})).await;

    assert!(h.sink.published().is_empty());
}

// Scenario 5: time-triggered fire
#[tokio::test]
async fn time_rule_gets_schedule_and_fires_at_boundary() {
    let h = Harness::at_time(18, 0);
    h.repo
        .put_rule(Rule {
            id: "r1".into(),
            name: "at six".into(),
            conditions: json!({ "type": "time", "op": "==", "value": "18:00" }),
            actions: json!([{ "device_id": "lamp1", "action": "set_state", "params": {"on": true} }]),
            enabled: true,
            owner_id: None,
        })
        .await;

    h.engine.refresh_rule("r1").await.unwrap();

    // Cron synthesis produced the boundary schedule
    let schedules = h.repo.schedules_for_rule("r1").await.unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].cron_expression, "0 18 * * *");

    // The scheduler enqueues an evaluation at fire time; the evaluator
    // reads an 18:00 clock and the actions go out.
    h.engine.trigger_rule("r1").await.unwrap();
    h.pump().await;
    assert_eq!(h.sink.commands_for("lamp1"), vec![json!({"on": true})]);

    h.engine.shutdown().await;
}

// Scenario 6: disabled rule is inert
#[tokio::test]
async fn disabled_rule_is_inert() {
    let h = Harness::new();
    h.seed_device("t1").await;
    h.repo.put_rule(threshold_rule("r1", false, true)).await;
    h.engine.refresh_rule("r1").await.unwrap();

    // Not in the index, so a device update fans out to nothing
    assert!(h
        .engine
        .index()
        .rules_for_device("t1")
        .await
        .unwrap()
        .is_empty());
    h.publish_state("t1", json!({"temperature": 35})).await;
    assert!(h.sink.published().is_empty());

    // Even a direct evaluation is a no-op
    h.engine.trigger_rule("r1").await.unwrap();
    h.pump().await;
    assert!(h.sink.published().is_empty());
}

// Index invariant: every device named by an enabled rule's leaves maps back
// to that rule, and to nothing else.
#[tokio::test]
async fn index_matches_enabled_rule_leaves() {
    let h = Harness::new();
    h.repo.put_rule(threshold_rule("r1", true, true)).await;
    h.repo
        .put_rule(Rule {
            id: "r2".into(),
            name: "door watcher".into(),
            conditions: json!({
                "operator": "OR",
                "children": [
                    { "type": "device", "device_id": "door", "key": "open", "op": "==", "value": true },
                    { "type": "sensor", "device_id": "t1", "key": "temperature", "op": "<", "value": 5 }
                ]
            }),
            actions: json!([]),
            enabled: true,
            owner_id: None,
        })
        .await;
    h.repo.put_rule(threshold_rule("r3", false, true)).await;

    h.engine.reindex().await.unwrap();

    assert_eq!(
        h.engine.index().rules_for_device("t1").await.unwrap(),
        vec!["r1", "r2"]
    );
    assert_eq!(
        h.engine.index().rules_for_device("door").await.unwrap(),
        vec!["r2"]
    );
}

// Significance filter end to end: sub-threshold noise never reaches the
// evaluator, a real transition does.
#[tokio::test]
async fn significance_filter_swallows_noise() {
    let h = Harness::new();
    h.seed_device("t1").await;
    h.repo
        .put_rule(Rule {
            conditions: json!({
                "type": "sensor", "device_id": "t1", "key": "temperature",
                "op": ">", "value": 30, "min_change": 0.5
            }),
            ..threshold_rule("r1", true, true)
        })
        .await;
    h.engine.refresh_rule("r1").await.unwrap();

    h.publish_state("t1", json!({"temperature": 20.0})).await;
    assert!(h.sink.published().is_empty());

    // 20.0 → 20.3: below min_change, swallowed before evaluation
    h.publish_state("t1", json!({"temperature": 20.3})).await;
    let cached: Value =
        serde_json::from_slice(&h.rtdb.get("device:t1").await.unwrap().unwrap()).unwrap();
    assert_eq!(cached["temperature"], json!(20.0));

    // 20.0 → 35.0: admitted, evaluated, fired
    h.publish_state("t1", json!({"temperature": 35.0})).await;
    assert_eq!(h.sink.commands_for("fan1"), vec![json!({"on": true})]);
}
