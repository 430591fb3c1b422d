//! Command dispatch
//!
//! Resolved commands are published to `devices/{id}/commands` with
//! at-least-once delivery and no retained flag. Dispatch is fire-and-forget:
//! nobody waits for a device acknowledgement, the loop closes when the device
//! republishes its new state on its state topic.

use crate::error::Result;
use crate::keys;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde_json::Value;
use tracing::{debug, info};

/// Publishes resolved device commands
#[async_trait]
pub trait CommandSink: Send + Sync + 'static {
    /// Publish a merged attribute map to one device's command topic
    async fn publish_command(&self, device_id: &str, params: &Value) -> Result<()>;
}

/// MQTT-backed sink
pub struct MqttSink {
    client: AsyncClient,
}

impl MqttSink {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CommandSink for MqttSink {
    async fn publish_command(&self, device_id: &str, params: &Value) -> Result<()> {
        let topic = keys::command_topic(device_id);
        let payload = serde_json::to_vec(params)?;
        debug!("Publishing command to {topic}: {params}");
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}

/// Recording sink for tests and embedded scenarios
#[derive(Default)]
pub struct MemorySink {
    published: Mutex<Vec<(String, Value)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, as (device_id, params) pairs
    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().clone()
    }

    /// Commands published to one device
    pub fn commands_for(&self, device_id: &str) -> Vec<Value> {
        self.published
            .lock()
            .iter()
            .filter(|(id, _)| id == device_id)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

#[async_trait]
impl CommandSink for MemorySink {
    async fn publish_command(&self, device_id: &str, params: &Value) -> Result<()> {
        self.published
            .lock()
            .push((device_id.to_string(), params.clone()));
        Ok(())
    }
}

/// Deliver a non-device action.
///
/// There is no notification transport yet; the message is logged and the
/// action succeeds.
pub fn notify(action: &str, params: &serde_json::Map<String, Value>) {
    let message = params
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    info!("Notification ({action}): {message}");
}
