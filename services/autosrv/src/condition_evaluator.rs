//! Condition evaluation
//!
//! Evaluates a rule's boolean tree against cached device state and the
//! injected clock. Evaluation is total: malformed input, missing state,
//! unknown leaf kinds, and unknown operators all evaluate to false rather
//! than erroring, so a broken rule is just a rule that never fires.

use crate::keys;
use crate::models::{compare_scalars, ComparisonOperator, ConditionNode, LeafCondition,
    LogicOperator};
use crate::time_extractor::parse_hhmm;
use bytes::Bytes;
use hearth_rtdb::{Rtdb, TimeProvider};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Evaluates condition trees against the realtime store
pub struct ConditionEvaluator {
    rtdb: Arc<dyn Rtdb>,
    clock: Arc<dyn TimeProvider>,
    memo_ttl_secs: u64,
}

impl ConditionEvaluator {
    pub fn new(rtdb: Arc<dyn Rtdb>, clock: Arc<dyn TimeProvider>, memo_ttl_secs: u64) -> Self {
        Self {
            rtdb,
            clock,
            memo_ttl_secs,
        }
    }

    /// Evaluate a condition tree
    pub fn evaluate<'a>(
        &'a self,
        node: &'a ConditionNode,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            match node {
                ConditionNode::Group { operator, children } => {
                    self.evaluate_group(*operator, children).await
                },
                ConditionNode::Leaf(leaf) => self.evaluate_leaf(leaf).await,
            }
        })
    }

    /// Short-circuit over children in declared order
    async fn evaluate_group(&self, operator: LogicOperator, children: &[ConditionNode]) -> bool {
        match operator {
            LogicOperator::And => {
                for child in children {
                    if !self.evaluate(child).await {
                        trace!("AND group short-circuited to false");
                        return false;
                    }
                }
                true
            },
            LogicOperator::Or => {
                for child in children {
                    if self.evaluate(child).await {
                        trace!("OR group short-circuited to true");
                        return true;
                    }
                }
                false
            },
        }
    }

    async fn evaluate_leaf(&self, leaf: &LeafCondition) -> bool {
        if leaf.is_device_kind() {
            return self.evaluate_device_leaf(leaf).await;
        }
        if leaf.is_time_kind() {
            return self.evaluate_time_leaf(leaf).await;
        }
        debug!("Unknown condition type '{}', evaluating to false", leaf.kind);
        false
    }

    async fn evaluate_device_leaf(&self, leaf: &LeafCondition) -> bool {
        let Some(op) = ComparisonOperator::parse(&leaf.op) else {
            debug!("Unknown operator '{}', evaluating to false", leaf.op);
            return false;
        };

        let state = match self.rtdb.get(&keys::device_state(&leaf.device_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                trace!("No cached state for device {}", leaf.device_id);
                return false;
            },
            Err(e) => {
                warn!("State read failed for device {}: {e}", leaf.device_id);
                return false;
            },
        };
        let Ok(Value::Object(state)) = serde_json::from_slice::<Value>(&state) else {
            debug!("Cached state for device {} is not an object", leaf.device_id);
            return false;
        };
        let Some(actual) = state.get(&leaf.key) else {
            trace!(
                "Device {} has no attribute '{}', evaluating to false",
                leaf.device_id,
                leaf.key
            );
            return false;
        };

        let result = compare_scalars(actual, op, &leaf.value);
        debug!(
            "Condition {}.{} {} {:?} = {result}",
            leaf.device_id,
            leaf.key,
            op.as_str(),
            leaf.value
        );
        result
    }

    /// Time leaves compare the wall clock's UTC time of day with an
    /// `"HH:MM"` literal. Results are memoized briefly: a burst of
    /// evaluations within one memo window sees one consistent clock bucket.
    async fn evaluate_time_leaf(&self, leaf: &LeafCondition) -> bool {
        let Some(op) = ComparisonOperator::parse(&leaf.op) else {
            debug!("Unknown operator '{}', evaluating to false", leaf.op);
            return false;
        };

        let value_text =
            serde_json::to_string(&leaf.value).unwrap_or_else(|_| String::from("null"));
        let memo_key = keys::time_memo(&leaf.op, &value_text);
        if let Ok(Some(cached)) = self.rtdb.get(&memo_key).await {
            let result = cached.as_ref() == b"true";
            trace!("Time condition {memo_key} = {result} (memoized)");
            return result;
        }

        let result = self.compare_clock(op, &leaf.value);
        let memo = if result {
            Bytes::from_static(b"true")
        } else {
            Bytes::from_static(b"false")
        };
        if let Err(e) = self.rtdb.set_ex(&memo_key, memo, self.memo_ttl_secs).await {
            warn!("Failed to memoize time condition {memo_key}: {e}");
        }
        debug!("Time condition {memo_key} = {result}");
        result
    }

    fn compare_clock(&self, op: ComparisonOperator, value: &Value) -> bool {
        let Some(target) = value.as_str().and_then(parse_hhmm) else {
            debug!("Time condition value {value:?} is not an HH:MM string");
            return false;
        };
        let target_minutes = u16::from(target.0) * 60 + u16::from(target.1);
        let now_minutes = self.clock.minutes_of_day();

        match op {
            ComparisonOperator::GreaterThan => now_minutes > target_minutes,
            ComparisonOperator::LessThan => now_minutes < target_minutes,
            ComparisonOperator::Equal => now_minutes == target_minutes,
            ComparisonOperator::NotEqual => now_minutes != target_minutes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_rtdb::{FixedTimeProvider, MemoryRtdb};
    use serde_json::json;

    fn evaluator_at(
        rtdb: Arc<dyn Rtdb>,
        hour: u8,
        minute: u8,
    ) -> ConditionEvaluator {
        ConditionEvaluator::new(
            rtdb,
            Arc::new(FixedTimeProvider::at_time_of_day(hour, minute)),
            60,
        )
    }

    async fn seed_state(rtdb: &dyn Rtdb, device_id: &str, state: Value) {
        rtdb.set_ex(
            &keys::device_state(device_id),
            Bytes::from(state.to_string()),
            3600,
        )
        .await
        .unwrap();
    }

    fn leaf(device_id: &str, key: &str, op: &str, value: Value) -> ConditionNode {
        serde_json::from_value(json!({
            "type": "sensor",
            "device_id": device_id,
            "key": key,
            "op": op,
            "value": value
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_device_leaf_against_cache() {
        let rtdb: Arc<dyn Rtdb> = Arc::new(MemoryRtdb::new());
        seed_state(rtdb.as_ref(), "t1", json!({"temperature": 35.0, "mode": "auto"})).await;
        let evaluator = evaluator_at(Arc::clone(&rtdb), 12, 0);

        assert!(evaluator.evaluate(&leaf("t1", "temperature", ">", json!(30))).await);
        assert!(!evaluator.evaluate(&leaf("t1", "temperature", "<", json!(30))).await);
        assert!(evaluator.evaluate(&leaf("t1", "mode", "==", json!("auto"))).await);
        assert!(evaluator.evaluate(&leaf("t1", "mode", "!=", json!("eco"))).await);
    }

    #[tokio::test]
    async fn test_missing_state_and_keys_are_false() {
        let rtdb: Arc<dyn Rtdb> = Arc::new(MemoryRtdb::new());
        seed_state(rtdb.as_ref(), "t1", json!({"temperature": 35.0})).await;
        let evaluator = evaluator_at(Arc::clone(&rtdb), 12, 0);

        // No cached state at all
        assert!(!evaluator.evaluate(&leaf("ghost", "temperature", ">", json!(0))).await);
        // State cached but attribute absent
        assert!(!evaluator.evaluate(&leaf("t1", "humidity", ">", json!(0))).await);
        // Cross-type comparison
        assert!(!evaluator.evaluate(&leaf("t1", "temperature", "==", json!("35"))).await);
    }

    #[tokio::test]
    async fn test_unknown_type_and_operator_are_false() {
        let rtdb: Arc<dyn Rtdb> = Arc::new(MemoryRtdb::new());
        seed_state(rtdb.as_ref(), "t1", json!({"temperature": 35.0})).await;
        let evaluator = evaluator_at(Arc::clone(&rtdb), 12, 0);

        assert!(!evaluator.evaluate(&leaf("t1", "temperature", ">=", json!(0))).await);

        let weird: ConditionNode = serde_json::from_value(json!({
            "type": "astrology",
            "device_id": "t1",
            "key": "temperature",
            "op": ">",
            "value": 0
        }))
        .unwrap();
        assert!(!evaluator.evaluate(&weird).await);
    }

    #[tokio::test]
    async fn test_time_leaf_and_memoization() {
        let rtdb: Arc<dyn Rtdb> = Arc::new(MemoryRtdb::new());
        let evaluator = evaluator_at(Arc::clone(&rtdb), 18, 0);

        let at_six: ConditionNode = serde_json::from_value(json!({
            "type": "time", "op": "==", "value": "18:00"
        }))
        .unwrap();
        assert!(evaluator.evaluate(&at_six).await);

        // Result is memoized under time:{op}:{value}
        let memo = rtdb
            .get(&keys::time_memo("==", "\"18:00\""))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(memo.as_ref(), b"true");

        // A later clock within the memo window still sees the cached bucket
        let later = evaluator_at(Arc::clone(&rtdb), 23, 0);
        assert!(later.evaluate(&at_six).await);
    }

    #[tokio::test]
    async fn test_time_ordering() {
        let rtdb: Arc<dyn Rtdb> = Arc::new(MemoryRtdb::new());
        let evaluator = evaluator_at(Arc::clone(&rtdb), 19, 30);

        let after_six: ConditionNode =
            serde_json::from_value(json!({ "type": "time", "op": ">", "value": "18:00" })).unwrap();
        let before_six: ConditionNode =
            serde_json::from_value(json!({ "type": "time", "op": "<", "value": "18:00" })).unwrap();
        let garbled: ConditionNode =
            serde_json::from_value(json!({ "type": "time", "op": ">", "value": "6pm" })).unwrap();

        assert!(evaluator.evaluate(&after_six).await);
        assert!(!evaluator.evaluate(&before_six).await);
        assert!(!evaluator.evaluate(&garbled).await);
    }

    #[tokio::test]
    async fn test_group_logic_and_empty_groups() {
        let rtdb: Arc<dyn Rtdb> = Arc::new(MemoryRtdb::new());
        seed_state(rtdb.as_ref(), "t1", json!({"temperature": 28.0})).await;
        seed_state(rtdb.as_ref(), "door", json!({"open": false})).await;
        let evaluator = evaluator_at(Arc::clone(&rtdb), 12, 0);

        let both: ConditionNode = serde_json::from_value(json!({
            "operator": "AND",
            "children": [
                { "type": "sensor", "device_id": "t1", "key": "temperature", "op": ">", "value": 25 },
                { "type": "device", "device_id": "door", "key": "open", "op": "==", "value": true }
            ]
        }))
        .unwrap();
        assert!(!evaluator.evaluate(&both).await);

        let either: ConditionNode = serde_json::from_value(json!({
            "operator": "OR",
            "children": [
                { "type": "sensor", "device_id": "t1", "key": "temperature", "op": ">", "value": 25 },
                { "type": "device", "device_id": "door", "key": "open", "op": "==", "value": true }
            ]
        }))
        .unwrap();
        assert!(evaluator.evaluate(&either).await);

        let empty_and: ConditionNode =
            serde_json::from_value(json!({ "operator": "AND", "children": [] })).unwrap();
        let empty_or: ConditionNode =
            serde_json::from_value(json!({ "operator": "OR", "children": [] })).unwrap();
        assert!(evaluator.evaluate(&empty_and).await);
        assert!(!evaluator.evaluate(&empty_or).await);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_later_children() {
        let rtdb: Arc<dyn Rtdb> = Arc::new(MemoryRtdb::new());
        seed_state(rtdb.as_ref(), "t1", json!({"temperature": 10.0})).await;
        let evaluator = evaluator_at(Arc::clone(&rtdb), 18, 0);

        // AND fails on the first child; the time leaf must never run,
        // observable through the absent memo entry.
        let tree: ConditionNode = serde_json::from_value(json!({
            "operator": "AND",
            "children": [
                { "type": "sensor", "device_id": "t1", "key": "temperature", "op": ">", "value": 30 },
                { "type": "time", "op": "==", "value": "18:00" }
            ]
        }))
        .unwrap();
        assert!(!evaluator.evaluate(&tree).await);
        assert!(rtdb
            .get(&keys::time_memo("==", "\"18:00\""))
            .await
            .unwrap()
            .is_none());

        // OR succeeds on the first child; same observation
        let tree: ConditionNode = serde_json::from_value(json!({
            "operator": "OR",
            "children": [
                { "type": "sensor", "device_id": "t1", "key": "temperature", "op": "<", "value": 30 },
                { "type": "time", "op": "==", "value": "06:00" }
            ]
        }))
        .unwrap();
        assert!(evaluator.evaluate(&tree).await);
        assert!(rtdb
            .get(&keys::time_memo("==", "\"06:00\""))
            .await
            .unwrap()
            .is_none());
    }
}
