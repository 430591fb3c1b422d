//! Device→rule index
//!
//! Materialized inverted index in the realtime store: for each device ID, the
//! set of enabled rule IDs whose condition trees reference it. A device
//! update consults its set to decide which rules need re-evaluation.
//!
//! Concurrent refreshes for distinct rules touch disjoint set members and are
//! safe; for the same rule the rule record is the serialized authority, so
//! last writer wins.

use crate::error::Result;
use crate::keys;
use crate::models::Rule;
use crate::repository::Repository;
use hearth_rtdb::Rtdb;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maintains the `device:{id}:rules` sets
pub struct DeviceRuleIndex {
    rtdb: Arc<dyn Rtdb>,
    repo: Arc<dyn Repository>,
}

impl DeviceRuleIndex {
    pub fn new(rtdb: Arc<dyn Rtdb>, repo: Arc<dyn Repository>) -> Self {
        Self { rtdb, repo }
    }

    /// Rule IDs referencing a device
    pub async fn rules_for_device(&self, device_id: &str) -> Result<Vec<String>> {
        let mut rule_ids = self
            .rtdb
            .smembers(&keys::device_rules(device_id))
            .await
            .map_err(crate::error::AutosrvError::InternalError)?;
        rule_ids.sort();
        Ok(rule_ids)
    }

    /// Rebuild the whole index from the enabled rule set
    ///
    /// Wipes every existing entry first so deleted rules cannot linger.
    pub async fn populate(&self) -> Result<()> {
        let stale = self
            .rtdb
            .scan_match(keys::DEVICE_RULES_PATTERN)
            .await
            .map_err(crate::error::AutosrvError::InternalError)?;
        for key in &stale {
            if let Err(e) = self.rtdb.del(key).await {
                warn!("Failed to clear index entry {key}: {e}");
            }
        }

        let rules = self.repo.list_enabled_rules().await?;
        info!("Populating device-rule index from {} enabled rules", rules.len());
        for rule in &rules {
            self.add_rule_entries(rule).await;
        }
        Ok(())
    }

    /// Re-derive one rule's entries after a mutation
    pub async fn refresh(&self, rule_id: &str) -> Result<()> {
        self.remove(rule_id).await?;

        let Some(rule) = self.repo.get_rule(rule_id).await? else {
            debug!("Rule {rule_id} no longer exists, index entries removed");
            return Ok(());
        };
        if !rule.enabled {
            debug!("Rule {rule_id} is disabled, keeping it out of the index");
            return Ok(());
        }
        self.add_rule_entries(&rule).await;
        Ok(())
    }

    /// Drop a rule from every device set
    pub async fn remove(&self, rule_id: &str) -> Result<()> {
        let entries = self
            .rtdb
            .scan_match(keys::DEVICE_RULES_PATTERN)
            .await
            .map_err(crate::error::AutosrvError::InternalError)?;
        for key in &entries {
            if let Err(e) = self.rtdb.srem(key, rule_id).await {
                warn!("Failed to remove rule {rule_id} from {key}: {e}");
            }
        }
        Ok(())
    }

    async fn add_rule_entries(&self, rule: &Rule) {
        for device_id in rule.referenced_devices() {
            match self
                .rtdb
                .sadd(&keys::device_rules(&device_id), &rule.id)
                .await
            {
                Ok(_) => debug!("Indexed rule {} under device {device_id}", rule.id),
                Err(e) => warn!(
                    "Failed to index rule {} under device {device_id}: {e}",
                    rule.id
                ),
            }
        }
    }
}
