//! Store key naming
//!
//! Every key the engine writes to the realtime store is minted here so the
//! keyspace can be audited in one place.

/// Cached device state, JSON object of attribute → scalar. TTL 1 hour.
pub fn device_state(device_id: &str) -> String {
    format!("device:{device_id}")
}

/// Set of rule IDs whose conditions reference the device.
pub fn device_rules(device_id: &str) -> String {
    format!("device:{device_id}:rules")
}

/// Scan pattern covering every device→rule index entry.
pub const DEVICE_RULES_PATTERN: &str = "device:*:rules";

/// Memoized time-leaf result ("true"/"false"). TTL 60 seconds.
pub fn time_memo(op: &str, value: &str) -> String {
    format!("time:{op}:{value}")
}

/// Bounded per-device stream of raw state observations.
pub fn device_stream(device_id: &str) -> String {
    format!("stream:device:{device_id}")
}

/// Scan pattern covering every live debounce stream.
pub const DEVICE_STREAM_PATTERN: &str = "stream:device:*";

/// Last consumed entry ID for a device stream.
pub fn stream_last_read(stream_key: &str) -> String {
    format!("last_read:{stream_key}")
}

/// Pending task list consumed by the worker pool.
pub const TASK_QUEUE: &str = "queue:tasks";

/// Tasks that exhausted their retries.
pub const DEAD_LETTER_QUEUE: &str = "queue:dead";

/// Device ID embedded in a stream key, if the key has the expected shape.
pub fn device_of_stream(stream_key: &str) -> Option<&str> {
    stream_key.strip_prefix("stream:device:")
}

/// Device ID embedded in a state topic (`devices/{id}/state`).
pub fn device_of_state_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix("devices/")
        .and_then(|rest| rest.strip_suffix("/state"))
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

/// Command topic for a device.
pub fn command_topic(device_id: &str) -> String {
    format!("devices/{device_id}/commands")
}

/// State topic for a device.
pub fn state_topic(device_id: &str) -> String {
    format!("devices/{device_id}/state")
}

/// Subscription pattern for all device state topics.
pub const STATE_TOPIC_PATTERN: &str = "devices/+/state";
