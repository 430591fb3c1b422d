//! Time-leaf extraction and cron synthesis
//!
//! Rules with time conditions need the scheduler to wake them up: device
//! updates alone would never re-evaluate them at the right moment. This
//! module lifts time leaves out of a condition tree and turns each into a
//! five-field cron expression firing at the boundary minute.
//!
//! `<` and `>` cannot be expressed as a single cron fire, so they also fire
//! at the boundary and rely on the evaluator to settle the actual boolean at
//! fire time. "While the condition holds" semantics must be paired with a
//! sensor condition by the rule author.

use crate::error::Result;
use crate::models::{ConditionNode, Rule, Schedule};
use crate::repository::Repository;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// A time predicate lifted from a condition tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeLeaf {
    pub hour: u8,
    pub minute: u8,
    pub op: String,
}

/// Parse an `"HH:MM"` literal with 0 ≤ HH ≤ 23 and 0 ≤ MM ≤ 59.
pub fn parse_hhmm(text: &str) -> Option<(u8, u8)> {
    let (hour, minute) = text.split_once(':')?;
    let hour: u8 = hour.trim().parse().ok()?;
    let minute: u8 = minute.trim().parse().ok()?;
    (hour <= 23 && minute <= 59).then_some((hour, minute))
}

/// Collect every schedulable time leaf in the tree, depth-first.
///
/// Only `==`, `<`, and `>` produce schedules; `!=` has no sensible single
/// fire time. Leaves with unparseable values are skipped.
pub fn extract(tree: &ConditionNode) -> Vec<TimeLeaf> {
    tree.leaves()
        .into_iter()
        .filter(|leaf| leaf.is_time_kind())
        .filter(|leaf| matches!(leaf.op.as_str(), "==" | "<" | ">"))
        .filter_map(|leaf| {
            let (hour, minute) = leaf.value.as_str().and_then(parse_hhmm)?;
            Some(TimeLeaf {
                hour,
                minute,
                op: leaf.op.clone(),
            })
        })
        .collect()
}

/// Cron expression firing at the leaf's boundary minute, every day.
pub fn to_cron(leaf: &TimeLeaf) -> String {
    format!("{} {} * * *", leaf.minute, leaf.hour)
}

/// Regenerate a rule's schedule rows from its current condition tree.
///
/// The rule's existing rows are replaced wholesale; duplicates collapse on
/// `(rule_id, cron)`. Disabled rules keep no schedules. Returns the rows now
/// on record for the rule.
pub async fn sync_rule_schedules(repo: &dyn Repository, rule: &Rule) -> Result<Vec<Schedule>> {
    repo.delete_schedules_for_rule(&rule.id).await?;
    if !rule.enabled {
        debug!("Rule {} is disabled, schedules removed", rule.id);
        return Ok(Vec::new());
    }

    let Some(tree) = rule.condition_tree() else {
        return Ok(Vec::new());
    };
    let expressions: BTreeSet<String> = extract(&tree).iter().map(to_cron).collect();

    let mut schedules = Vec::with_capacity(expressions.len());
    for cron in &expressions {
        schedules.push(repo.upsert_schedule(&rule.id, cron).await?);
    }
    if !schedules.is_empty() {
        info!(
            "Synthesized {} schedule(s) for rule {}",
            schedules.len(),
            rule.id
        );
    }
    Ok(schedules)
}
