//! Device-update task handling
//!
//! A `device_update` task carries one debounced state observation. The
//! handler gates on device acceptance, drops insignificant changes, writes
//! the state cache, and fans out one `evaluate_rule` task per indexed rule.

use crate::error::Result;
use crate::index::DeviceRuleIndex;
use crate::keys;
use crate::models::{Device, DeviceState};
use crate::repository::Repository;
use crate::taskqueue::{Task, TaskQueue};
use bytes::Bytes;
use hearth_rtdb::Rtdb;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct DeviceUpdater {
    rtdb: Arc<dyn Rtdb>,
    repo: Arc<dyn Repository>,
    index: Arc<DeviceRuleIndex>,
    queue: Arc<TaskQueue>,
    state_ttl_secs: u64,
}

impl DeviceUpdater {
    pub fn new(
        rtdb: Arc<dyn Rtdb>,
        repo: Arc<dyn Repository>,
        index: Arc<DeviceRuleIndex>,
        queue: Arc<TaskQueue>,
        state_ttl_secs: u64,
    ) -> Self {
        Self {
            rtdb,
            repo,
            index,
            queue,
            state_ttl_secs,
        }
    }

    pub async fn handle_update(&self, device_id: &str, state: &DeviceState) -> Result<()> {
        let Some(device) = self.repo.get_device(device_id).await? else {
            // First observation of this device: record it, excluded from
            // rule processing until an operator accepts it.
            info!("Unknown device {device_id}, registering as unaccepted");
            self.repo
                .insert_device(&Device {
                    id: device_id.to_string(),
                    name: device_id.to_string(),
                    kind: "unknown".to_string(),
                    state: Value::Object(state.clone()),
                    mqtt_topic: keys::state_topic(device_id),
                    accepted: false,
                    owner_id: None,
                })
                .await?;
            return Ok(());
        };
        if !device.accepted {
            debug!("Device {device_id} is not accepted, skipping rule processing");
            return Ok(());
        }

        let rule_ids = self.index.rules_for_device(device_id).await?;

        let last_state = match self.rtdb.get(&keys::device_state(device_id)).await {
            Ok(Some(raw)) => serde_json::from_slice::<DeviceState>(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("Cache read failed for device {device_id}: {e}");
                None
            },
        };

        if !self
            .is_significant(device_id, state, last_state.as_ref(), &rule_ids)
            .await
        {
            debug!("No significant change for device {device_id}, skipping");
            return Ok(());
        }

        let encoded = serde_json::to_vec(&Value::Object(state.clone()))?;
        self.rtdb
            .set_ex(
                &keys::device_state(device_id),
                Bytes::from(encoded),
                self.state_ttl_secs,
            )
            .await
            .map_err(crate::error::AutosrvError::InternalError)?;

        // Cache is authoritative for evaluation; the table row is for the
        // CRUD surface and may lag.
        if let Err(e) = self
            .repo
            .update_device_state(device_id, &Value::Object(state.clone()))
            .await
        {
            warn!("Failed to persist state for device {device_id}: {e}");
        }

        debug!(
            "Significant change on device {device_id}, evaluating {} rule(s)",
            rule_ids.len()
        );
        for rule_id in &rule_ids {
            self.queue
                .enqueue(Task::evaluate_rule(rule_id, device_id))
                .await?;
        }
        Ok(())
    }

    /// Significant-change predicate.
    ///
    /// True iff some attribute referenced by an enabled rule changed beyond
    /// that rule's declared `min_change`. Collapses numeric sensor noise
    /// without suppressing real transitions; a missing last state is always
    /// significant. Unreadable rules fail open toward evaluation.
    async fn is_significant(
        &self,
        device_id: &str,
        new_state: &DeviceState,
        last_state: Option<&DeviceState>,
        rule_ids: &[String],
    ) -> bool {
        let Some(last_state) = last_state else {
            return true;
        };

        for rule_id in rule_ids {
            let rule = match self.repo.get_rule(rule_id).await {
                Ok(Some(rule)) => rule,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Rule {rule_id} unreadable during significance check: {e}");
                    return true;
                },
            };
            if !rule.enabled {
                continue;
            }
            let Some(tree) = rule.condition_tree() else {
                continue;
            };
            for leaf in tree.leaves() {
                if !leaf.is_device_kind() || leaf.device_id != device_id {
                    continue;
                }
                if attribute_changed(
                    new_state.get(&leaf.key),
                    last_state.get(&leaf.key),
                    leaf.min_change,
                ) {
                    return true;
                }
            }
        }
        false
    }
}

/// Did one referenced attribute move enough to matter?
fn attribute_changed(new: Option<&Value>, last: Option<&Value>, min_change: f64) -> bool {
    match (new, last) {
        (None, None) => false,
        (Some(new), Some(last)) => {
            if let (Some(a), Some(b)) = (new.as_f64(), last.as_f64()) {
                (a - b).abs() > min_change
            } else {
                new != last
            }
        },
        // Attribute appeared or disappeared
        _ => true,
    }
}
