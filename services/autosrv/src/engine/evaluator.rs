//! Rule-evaluation task handling
//!
//! An `evaluate_rule` task runs the full decision pipeline for one rule:
//! fetch → redundancy short-circuit → condition evaluation → conflict
//! resolution across co-firing rules → merged dispatch.
//!
//! The redundancy check and the conflict resolver together tame the
//! intentional feedback loop (command → device state update → re-evaluation):
//! a rule whose targets already hold their commanded values publishes
//! nothing, and overlapping writers always converge on the same winner.

use crate::condition_evaluator::ConditionEvaluator;
use crate::engine::dispatcher::{self, CommandSink};
use crate::error::{AutosrvError, Result};
use crate::keys;
use crate::models::{compare_scalars, Action, ComparisonOperator, Rule};
use crate::repository::Repository;
use hearth_rtdb::{Rtdb, TimeProvider};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct RuleExecutor {
    rtdb: Arc<dyn Rtdb>,
    repo: Arc<dyn Repository>,
    sink: Arc<dyn CommandSink>,
    conditions: ConditionEvaluator,
}

impl RuleExecutor {
    pub fn new(
        rtdb: Arc<dyn Rtdb>,
        repo: Arc<dyn Repository>,
        sink: Arc<dyn CommandSink>,
        clock: Arc<dyn TimeProvider>,
        time_memo_ttl_secs: u64,
    ) -> Self {
        let conditions =
            ConditionEvaluator::new(Arc::clone(&rtdb), clock, time_memo_ttl_secs);
        Self {
            rtdb,
            repo,
            sink,
            conditions,
        }
    }

    pub async fn execute(&self, rule_id: &str, updated_device_id: &str) -> Result<()> {
        let rule = self
            .repo
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| AutosrvError::RuleNotFound(rule_id.to_string()))?;

        if !rule.enabled {
            debug!("Rule {rule_id} is disabled, skipping");
            return Ok(());
        }

        let actions = rule.action_list();
        if self.is_fully_redundant(&actions).await {
            debug!("Rule {rule_id} is fully redundant, skipping");
            return Ok(());
        }

        let Some(tree) = rule.condition_tree() else {
            warn!("Rule {rule_id} has an unparseable condition tree, treating as non-match");
            return Ok(());
        };
        if !self.conditions.evaluate(&tree).await {
            debug!("Rule {rule_id} conditions not met");
            return Ok(());
        }

        info!(
            "Rule {rule_id} fired (trigger device: {})",
            if updated_device_id.is_empty() { "schedule" } else { updated_device_id }
        );

        for action in &actions {
            if !action.targets_device() && !action.action.is_empty() {
                dispatcher::notify(&action.action, &action.params);
            }
        }

        let commands = self.resolve_conflicts(&rule, &actions).await?;
        for (device_id, params) in &commands {
            self.sink.publish_command(device_id, params).await?;
            if let Err(e) = self.repo.log_state_history(&rule.id, device_id, params).await {
                warn!("Failed to append state history for device {device_id}: {e}");
            }
        }
        Ok(())
    }

    /// A rule is fully redundant when every device-targeted action would
    /// leave its device exactly as cached. Non-device actions and unreadable
    /// cache entries defeat the check: those must evaluate.
    async fn is_fully_redundant(&self, actions: &[Action]) -> bool {
        let mut saw_device_action = false;
        for action in actions {
            if !action.targets_device() {
                if !action.action.is_empty() {
                    return false;
                }
                continue;
            }
            saw_device_action = true;

            let cached = match self.rtdb.get(&keys::device_state(&action.device_id)).await {
                Ok(Some(raw)) => raw,
                _ => return false,
            };
            let Ok(Value::Object(cached)) = serde_json::from_slice::<Value>(&cached) else {
                return false;
            };
            for (attribute, target) in &action.params {
                let holds = cached
                    .get(attribute)
                    .is_some_and(|current| {
                        compare_scalars(current, ComparisonOperator::Equal, target)
                    });
                if !holds {
                    return false;
                }
            }
        }
        saw_device_action
    }

    /// Resolve overlapping writes across co-firing rules.
    ///
    /// The triggered rule stakes out its action targets; every other enabled
    /// rule whose actions touch one of those targets is evaluated, and within
    /// each `(device, attribute)` group the lexicographically smallest rule
    /// ID contributes the value. Re-reading the full rule set keeps the
    /// outcome independent of task scheduling order.
    async fn resolve_conflicts(
        &self,
        rule: &Rule,
        actions: &[Action],
    ) -> Result<BTreeMap<String, Value>> {
        // Target → (winning rule, value). Later actions of one rule override
        // its earlier writes to the same attribute.
        let mut winners: BTreeMap<(String, String), (String, Value)> = BTreeMap::new();
        for action in actions.iter().filter(|a| a.targets_device()) {
            for (attribute, value) in &action.params {
                winners.insert(
                    (action.device_id.clone(), attribute.clone()),
                    (rule.id.clone(), value.clone()),
                );
            }
        }
        if winners.is_empty() {
            return Ok(BTreeMap::new());
        }

        for other in self.repo.list_enabled_rules().await? {
            if other.id == rule.id {
                continue;
            }
            let other_actions = other.action_list();
            let touches_target = other_actions
                .iter()
                .filter(|a| a.targets_device())
                .any(|a| {
                    a.params.keys().any(|attribute| {
                        winners.contains_key(&(a.device_id.clone(), attribute.clone()))
                    })
                });
            if !touches_target {
                continue;
            }

            let Some(tree) = other.condition_tree() else {
                continue;
            };
            if !self.conditions.evaluate(&tree).await {
                continue;
            }
            debug!("Rule {} is co-firing with {}", other.id, rule.id);

            for action in other_actions.iter().filter(|a| a.targets_device()) {
                for (attribute, value) in &action.params {
                    let target = (action.device_id.clone(), attribute.clone());
                    if let Some(winner) = winners.get_mut(&target) {
                        if other.id.as_str() <= winner.0.as_str() {
                            *winner = (other.id.clone(), value.clone());
                        }
                    }
                }
            }
        }

        let mut merged: BTreeMap<String, Value> = BTreeMap::new();
        for ((device_id, attribute), (winner_id, value)) in winners {
            debug!("Winner for {device_id}.{attribute}: rule {winner_id}");
            let entry = merged
                .entry(device_id)
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Value::Object(params) = entry {
                params.insert(attribute, value);
            }
        }
        Ok(merged)
    }
}
