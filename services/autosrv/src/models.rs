//! Domain models for the automation engine
//!
//! Rules, devices, and schedules are persisted in the relational store; the
//! structures here mirror those rows. Condition trees and action lists travel
//! as raw JSON and are parsed leniently on use: a payload that does not parse
//! behaves as a rule that never fires.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Device state: attribute name → JSON scalar
pub type DeviceState = serde_json::Map<String, Value>;

/// A device observed on the bus
///
/// Devices are auto-inserted in unaccepted state on their first observed
/// message; unaccepted devices are excluded from rule processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub state: Value,
    pub mqtt_topic: String,
    pub accepted: bool,
    #[serde(default)]
    pub owner_id: Option<String>,
}

/// A conditions → actions record
///
/// Rule IDs are stable and lexicographically comparable; a lower ID means
/// higher priority during conflict resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    /// Condition tree, raw JSON
    pub conditions: Value,
    /// Ordered action list, raw JSON
    pub actions: Value,
    pub enabled: bool,
    #[serde(default)]
    pub owner_id: Option<String>,
}

impl Rule {
    /// Parse the condition tree; `None` when the payload is malformed.
    pub fn condition_tree(&self) -> Option<ConditionNode> {
        serde_json::from_value(self.conditions.clone()).ok()
    }

    /// Parse the action list; empty when the payload is malformed.
    pub fn action_list(&self) -> Vec<Action> {
        serde_json::from_value(self.actions.clone()).unwrap_or_default()
    }

    /// Distinct device IDs referenced by this rule's condition leaves.
    pub fn referenced_devices(&self) -> BTreeSet<String> {
        let mut devices = BTreeSet::new();
        if let Some(tree) = self.condition_tree() {
            tree.collect_devices(&mut devices);
        }
        devices
    }
}

/// A time-based trigger row for a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub rule_id: String,
    pub cron_expression: String,
    pub enabled: bool,
}

/// One node of a rule's condition tree
///
/// A node with a logical operator is a group over ordered children; anything
/// else is a leaf predicate. Group is tried first so the `operator` field
/// decides the variant, matching the stored JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Group {
        operator: LogicOperator,
        #[serde(default)]
        children: Vec<ConditionNode>,
    },
    Leaf(LeafCondition),
}

impl ConditionNode {
    /// Gather every `device_id` named by a leaf, depth-first.
    pub fn collect_devices(&self, out: &mut BTreeSet<String>) {
        match self {
            ConditionNode::Group { children, .. } => {
                for child in children {
                    child.collect_devices(out);
                }
            },
            ConditionNode::Leaf(leaf) => {
                if !leaf.device_id.is_empty() {
                    out.insert(leaf.device_id.clone());
                }
            },
        }
    }

    /// All leaves in declared order.
    pub fn leaves(&self) -> Vec<&LeafCondition> {
        let mut out = Vec::new();
        self.push_leaves(&mut out);
        out
    }

    fn push_leaves<'a>(&'a self, out: &mut Vec<&'a LeafCondition>) {
        match self {
            ConditionNode::Group { children, .. } => {
                for child in children {
                    child.push_leaves(out);
                }
            },
            ConditionNode::Leaf(leaf) => out.push(leaf),
        }
    }
}

/// Logical operator for condition groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicOperator {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

/// Atomic predicate over device state or wall-clock time
///
/// `kind` and `op` stay as strings: an unknown kind or operator must evaluate
/// to false, never fail the containing rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeafCondition {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub value: Value,
    /// Minimum numeric delta for a state change to count as significant
    #[serde(default)]
    pub min_change: f64,
}

impl LeafCondition {
    /// True for leaves that read cached device state.
    pub fn is_device_kind(&self) -> bool {
        matches!(self.kind.as_str(), "sensor" | "device")
    }

    /// True for leaves that read the wall clock.
    pub fn is_time_kind(&self) -> bool {
        self.kind == "time"
    }
}

/// Comparison operator of a leaf predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    GreaterThan,
    LessThan,
    Equal,
    NotEqual,
}

impl ComparisonOperator {
    /// Parse from the wire form; `None` for anything unknown.
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            ">" => Some(ComparisonOperator::GreaterThan),
            "<" => Some(ComparisonOperator::LessThan),
            "==" => Some(ComparisonOperator::Equal),
            "!=" => Some(ComparisonOperator::NotEqual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOperator::GreaterThan => ">",
            ComparisonOperator::LessThan => "<",
            ComparisonOperator::Equal => "==",
            ComparisonOperator::NotEqual => "!=",
        }
    }
}

/// One action of a rule
///
/// Device-targeted actions (non-empty `device_id`) publish `params` as a
/// command; an empty `params` map makes the action a no-op. Non-device
/// actions (`send_email`, …) are handled by the notifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

impl Action {
    /// True when this action writes device attributes.
    pub fn targets_device(&self) -> bool {
        !self.device_id.is_empty()
    }
}

/// Compare two state scalars under an operator.
///
/// Numbers are ordered; strings and booleans support equality only;
/// comparisons across types are false, never an error.
pub fn compare_scalars(actual: &Value, op: ComparisonOperator, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => {
            let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
                return false;
            };
            match op {
                ComparisonOperator::GreaterThan => a > b,
                ComparisonOperator::LessThan => a < b,
                ComparisonOperator::Equal => (a - b).abs() < f64::EPSILON,
                ComparisonOperator::NotEqual => (a - b).abs() >= f64::EPSILON,
            }
        },
        (Value::String(a), Value::String(b)) => match op {
            ComparisonOperator::Equal => a == b,
            ComparisonOperator::NotEqual => a != b,
            _ => false,
        },
        (Value::Bool(a), Value::Bool(b)) => match op {
            ComparisonOperator::Equal => a == b,
            ComparisonOperator::NotEqual => a != b,
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_leaf_deserialization() {
        let node: ConditionNode = serde_json::from_value(json!({
            "type": "sensor",
            "device_id": "t1",
            "key": "temperature",
            "op": ">",
            "value": 30,
            "min_change": 0.5
        }))
        .unwrap();

        let ConditionNode::Leaf(leaf) = node else {
            panic!("expected leaf");
        };
        assert_eq!(leaf.device_id, "t1");
        assert_eq!(leaf.op, ">");
        assert!(leaf.is_device_kind());
        assert!((leaf.min_change - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_group_deserialization() {
        let node: ConditionNode = serde_json::from_value(json!({
            "operator": "AND",
            "children": [
                { "type": "sensor", "device_id": "t1", "key": "temp", "op": ">", "value": 25 },
                { "operator": "OR", "children": [] }
            ]
        }))
        .unwrap();

        let ConditionNode::Group { operator, children } = node else {
            panic!("expected group");
        };
        assert_eq!(operator, LogicOperator::And);
        assert_eq!(children.len(), 2);
        assert!(matches!(children[1], ConditionNode::Group { .. }));
    }

    #[test]
    fn test_empty_operator_is_a_leaf() {
        // The wire format allows "operator": "" on leaves
        let node: ConditionNode = serde_json::from_value(json!({
            "operator": "",
            "type": "time",
            "op": "==",
            "value": "18:00"
        }))
        .unwrap();
        assert!(matches!(node, ConditionNode::Leaf(_)));
    }

    #[test]
    fn test_collect_devices_deduplicates() {
        let rule = Rule {
            id: "r1".into(),
            name: "test".into(),
            conditions: json!({
                "operator": "OR",
                "children": [
                    { "type": "sensor", "device_id": "t1", "key": "a", "op": ">", "value": 1 },
                    { "type": "device", "device_id": "t1", "key": "b", "op": "==", "value": 2 },
                    { "type": "device", "device_id": "door", "key": "open", "op": "==", "value": true },
                    { "type": "time", "op": "==", "value": "18:00" }
                ]
            }),
            actions: json!([]),
            enabled: true,
            owner_id: None,
        };

        let devices: Vec<String> = rule.referenced_devices().into_iter().collect();
        assert_eq!(devices, vec!["door", "t1"]);
    }

    #[test]
    fn test_malformed_payloads_degrade() {
        let rule = Rule {
            id: "r1".into(),
            name: "broken".into(),
            conditions: json!("not a tree"),
            actions: json!({"not": "a list"}),
            enabled: true,
            owner_id: None,
        };
        assert!(rule.condition_tree().is_none());
        assert!(rule.action_list().is_empty());
        assert!(rule.referenced_devices().is_empty());
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!(
            ComparisonOperator::parse(">"),
            Some(ComparisonOperator::GreaterThan)
        );
        assert_eq!(
            ComparisonOperator::parse("=="),
            Some(ComparisonOperator::Equal)
        );
        assert_eq!(ComparisonOperator::parse(">="), None);
        assert_eq!(ComparisonOperator::parse("contains"), None);
    }

    #[test]
    fn test_scalar_comparison() {
        use ComparisonOperator::*;
        assert!(compare_scalars(&json!(35.0), GreaterThan, &json!(30)));
        assert!(!compare_scalars(&json!(25.0), GreaterThan, &json!(30)));
        assert!(compare_scalars(&json!("on"), Equal, &json!("on")));
        assert!(compare_scalars(&json!("on"), NotEqual, &json!("off")));
        assert!(compare_scalars(&json!(true), Equal, &json!(true)));

        // Strings and booleans are not ordered
        assert!(!compare_scalars(&json!("b"), GreaterThan, &json!("a")));
        assert!(!compare_scalars(&json!(true), LessThan, &json!(false)));

        // Cross-type comparison is false, not an error
        assert!(!compare_scalars(&json!(1), Equal, &json!("1")));
        assert!(!compare_scalars(&json!(true), Equal, &json!(1)));
        assert!(!compare_scalars(&Value::Null, Equal, &json!(1)));
    }
}
