//! Relational store access
//!
//! Rules, devices, and schedules live in Postgres as the source of truth;
//! everything in the realtime store is reconstructible from here. The
//! `Repository` trait keeps the engine testable without a database: the
//! production backend is `PgRepository`, tests use `MemoryRepository`.

use crate::error::Result;
use crate::models::{Device, Rule, Schedule};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistence operations the engine depends on
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    /// Fetch a rule by ID
    async fn get_rule(&self, id: &str) -> Result<Option<Rule>>;

    /// All enabled rules
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>>;

    /// Fetch a device by ID
    async fn get_device(&self, id: &str) -> Result<Option<Device>>;

    /// Insert a newly observed device (unaccepted until an operator approves)
    async fn insert_device(&self, device: &Device) -> Result<()>;

    /// Persist the latest device state
    async fn update_device_state(&self, id: &str, state: &Value) -> Result<()>;

    /// Devices awaiting operator acceptance
    async fn list_pending_devices(&self) -> Result<Vec<Device>>;

    /// Accept a device, optionally assigning an owner
    async fn accept_device(&self, id: &str, owner_id: Option<&str>) -> Result<()>;

    /// Remove a device
    async fn delete_device(&self, id: &str) -> Result<()>;

    /// All enabled schedules
    async fn list_enabled_schedules(&self) -> Result<Vec<Schedule>>;

    /// Schedules belonging to one rule
    async fn schedules_for_rule(&self, rule_id: &str) -> Result<Vec<Schedule>>;

    /// Insert a schedule unless an identical (rule_id, cron) row exists
    async fn upsert_schedule(&self, rule_id: &str, cron_expression: &str) -> Result<Schedule>;

    /// Drop every schedule belonging to a rule
    async fn delete_schedules_for_rule(&self, rule_id: &str) -> Result<()>;

    /// Append an audit row after a dispatch
    async fn log_state_history(&self, rule_id: &str, device_id: &str, state: &Value)
        -> Result<()>;
}

// ========== Postgres backend ==========

/// Postgres-backed repository
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn hydrate_rule(row: PgRow) -> Result<Rule> {
    Ok(Rule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        conditions: row.try_get("conditions")?,
        actions: row.try_get("actions")?,
        enabled: row.try_get("enabled")?,
        owner_id: row.try_get("owner_id")?,
    })
}

fn hydrate_device(row: PgRow) -> Result<Device> {
    Ok(Device {
        id: row.try_get("device_id")?,
        name: row.try_get("name")?,
        kind: row.try_get("type")?,
        state: row.try_get("state")?,
        mqtt_topic: row.try_get("mqtt_topic")?,
        accepted: row.try_get("accepted")?,
        owner_id: row.try_get("owner_id")?,
    })
}

fn hydrate_schedule(row: PgRow) -> Result<Schedule> {
    Ok(Schedule {
        id: row.try_get("id")?,
        rule_id: row.try_get("rule_id")?,
        cron_expression: row.try_get("cron_expression")?,
        enabled: row.try_get("enabled")?,
    })
}

#[async_trait]
impl Repository for PgRepository {
    async fn get_rule(&self, id: &str) -> Result<Option<Rule>> {
        let row = sqlx::query(
            "SELECT id, name, conditions, actions, enabled, owner_id FROM rules WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(hydrate_rule).transpose()
    }

    async fn list_enabled_rules(&self) -> Result<Vec<Rule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, conditions, actions, enabled, owner_id
            FROM rules
            WHERE enabled = true
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate_rule).collect()
    }

    async fn get_device(&self, id: &str) -> Result<Option<Device>> {
        let row = sqlx::query(
            r#"
            SELECT device_id, name, type, state, mqtt_topic, accepted, owner_id
            FROM devices
            WHERE device_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(hydrate_device).transpose()
    }

    async fn insert_device(&self, device: &Device) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, name, type, mqtt_topic, state, accepted)
            VALUES ($1, $2, $3, $4, $5, false)
            "#,
        )
        .bind(&device.id)
        .bind(&device.name)
        .bind(&device.kind)
        .bind(&device.mqtt_topic)
        .bind(&device.state)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_device_state(&self, id: &str, state: &Value) -> Result<()> {
        sqlx::query("UPDATE devices SET state = $1 WHERE device_id = $2")
            .bind(state)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_pending_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query(
            r#"
            SELECT device_id, name, type, state, mqtt_topic, accepted, owner_id
            FROM devices
            WHERE accepted = false
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate_device).collect()
    }

    async fn accept_device(&self, id: &str, owner_id: Option<&str>) -> Result<()> {
        match owner_id {
            Some(owner) => {
                sqlx::query("UPDATE devices SET accepted = true, owner_id = $1 WHERE device_id = $2")
                    .bind(owner)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            },
            None => {
                sqlx::query("UPDATE devices SET accepted = true WHERE device_id = $1")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            },
        }
        Ok(())
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM devices WHERE device_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_enabled_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(
            "SELECT id, rule_id, cron_expression, enabled FROM schedules WHERE enabled = true",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate_schedule).collect()
    }

    async fn schedules_for_rule(&self, rule_id: &str) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(
            "SELECT id, rule_id, cron_expression, enabled FROM schedules WHERE rule_id = $1",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate_schedule).collect()
    }

    async fn upsert_schedule(&self, rule_id: &str, cron_expression: &str) -> Result<Schedule> {
        let existing = sqlx::query(
            r#"
            SELECT id, rule_id, cron_expression, enabled
            FROM schedules
            WHERE rule_id = $1 AND cron_expression = $2
            "#,
        )
        .bind(rule_id)
        .bind(cron_expression)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            return hydrate_schedule(row);
        }

        let schedule = Schedule {
            id: Uuid::new_v4().to_string(),
            rule_id: rule_id.to_string(),
            cron_expression: cron_expression.to_string(),
            enabled: true,
        };
        sqlx::query(
            r#"
            INSERT INTO schedules (id, rule_id, cron_expression, enabled)
            VALUES ($1, $2, $3, true)
            "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.rule_id)
        .bind(&schedule.cron_expression)
        .execute(&self.pool)
        .await?;
        Ok(schedule)
    }

    async fn delete_schedules_for_rule(&self, rule_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM schedules WHERE rule_id = $1")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn log_state_history(
        &self,
        rule_id: &str,
        device_id: &str,
        state: &Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_states_history (rule_id, device_id, timestamp, state)
            VALUES ($1, $2, NOW(), $3)
            "#,
        )
        .bind(rule_id)
        .bind(device_id)
        .bind(state)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ========== In-memory backend ==========

/// In-memory repository for tests and embedded scenarios
#[derive(Default)]
pub struct MemoryRepository {
    rules: RwLock<HashMap<String, Rule>>,
    devices: RwLock<HashMap<String, Device>>,
    schedules: RwLock<Vec<Schedule>>,
    history: RwLock<Vec<(String, String, Value)>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a rule (test setup)
    pub async fn put_rule(&self, rule: Rule) {
        self.rules.write().await.insert(rule.id.clone(), rule);
    }

    /// Insert or replace a device (test setup)
    pub async fn put_device(&self, device: Device) {
        self.devices.write().await.insert(device.id.clone(), device);
    }

    /// Audit rows recorded so far
    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_rule(&self, id: &str) -> Result<Option<Rule>> {
        Ok(self.rules.read().await.get(id).cloned())
    }

    async fn list_enabled_rules(&self) -> Result<Vec<Rule>> {
        let mut rules: Vec<Rule> = self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    async fn get_device(&self, id: &str) -> Result<Option<Device>> {
        Ok(self.devices.read().await.get(id).cloned())
    }

    async fn insert_device(&self, device: &Device) -> Result<()> {
        self.devices
            .write()
            .await
            .insert(device.id.clone(), device.clone());
        Ok(())
    }

    async fn update_device_state(&self, id: &str, state: &Value) -> Result<()> {
        if let Some(device) = self.devices.write().await.get_mut(id) {
            device.state = state.clone();
        }
        Ok(())
    }

    async fn list_pending_devices(&self) -> Result<Vec<Device>> {
        Ok(self
            .devices
            .read()
            .await
            .values()
            .filter(|d| !d.accepted)
            .cloned()
            .collect())
    }

    async fn accept_device(&self, id: &str, owner_id: Option<&str>) -> Result<()> {
        if let Some(device) = self.devices.write().await.get_mut(id) {
            device.accepted = true;
            if let Some(owner) = owner_id {
                device.owner_id = Some(owner.to_string());
            }
        }
        Ok(())
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        self.devices.write().await.remove(id);
        Ok(())
    }

    async fn list_enabled_schedules(&self) -> Result<Vec<Schedule>> {
        Ok(self
            .schedules
            .read()
            .await
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }

    async fn schedules_for_rule(&self, rule_id: &str) -> Result<Vec<Schedule>> {
        Ok(self
            .schedules
            .read()
            .await
            .iter()
            .filter(|s| s.rule_id == rule_id)
            .cloned()
            .collect())
    }

    async fn upsert_schedule(&self, rule_id: &str, cron_expression: &str) -> Result<Schedule> {
        let mut schedules = self.schedules.write().await;
        if let Some(existing) = schedules
            .iter()
            .find(|s| s.rule_id == rule_id && s.cron_expression == cron_expression)
        {
            return Ok(existing.clone());
        }
        let schedule = Schedule {
            id: Uuid::new_v4().to_string(),
            rule_id: rule_id.to_string(),
            cron_expression: cron_expression.to_string(),
            enabled: true,
        };
        schedules.push(schedule.clone());
        Ok(schedule)
    }

    async fn delete_schedules_for_rule(&self, rule_id: &str) -> Result<()> {
        self.schedules.write().await.retain(|s| s.rule_id != rule_id);
        Ok(())
    }

    async fn log_state_history(
        &self,
        rule_id: &str,
        device_id: &str,
        state: &Value,
    ) -> Result<()> {
        self.history.write().await.push((
            rule_id.to_string(),
            device_id.to_string(),
            state.clone(),
        ));
        Ok(())
    }
}
