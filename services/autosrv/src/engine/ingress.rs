//! MQTT ingress and debouncing
//!
//! Raw state messages land on a bounded per-device stream; a periodic drain
//! forwards only the newest unseen entry per device as a `device_update`
//! task. Bursts collapse to one observation per debounce window, and the
//! stream cap bounds memory during storms. Per device, the last observation
//! wins; intermediate states are dropped.

use crate::error::Result;
use crate::keys;
use crate::models::DeviceState;
use crate::taskqueue::{Task, TaskQueue};
use bytes::Bytes;
use hearth_rtdb::Rtdb;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// MQTT subscriber feeding the debounce streams
pub struct Ingress {
    client: AsyncClient,
    event_loop: EventLoop,
    rtdb: Arc<dyn Rtdb>,
    stream_max_len: usize,
}

impl Ingress {
    pub fn new(
        client: AsyncClient,
        event_loop: EventLoop,
        rtdb: Arc<dyn Rtdb>,
        stream_max_len: usize,
    ) -> Self {
        Self {
            client,
            event_loop,
            rtdb,
            stream_max_len,
        }
    }

    /// Drive the MQTT event loop until the task is aborted.
    ///
    /// Subscribes on every ConnAck, so reconnects re-establish the
    /// subscription; in-flight messages lost across a reconnect are
    /// acceptable because devices republish their state.
    pub async fn run(mut self) {
        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Broker connected, subscribing to {}", keys::STATE_TOPIC_PATTERN);
                    if let Err(e) = self
                        .client
                        .subscribe(keys::STATE_TOPIC_PATTERN, QoS::AtLeastOnce)
                        .await
                    {
                        warn!("Subscribe failed: {e}");
                    }
                },
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    ingest_state_message(
                        self.rtdb.as_ref(),
                        self.stream_max_len,
                        &publish.topic,
                        &publish.payload,
                    )
                    .await;
                },
                Ok(_) => {},
                Err(e) => {
                    warn!("Broker connection error: {e}, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                },
            }
        }
    }
}

/// Validate one raw state message and append it to the device's stream.
///
/// Malformed topics and payloads are logged and dropped, never fatal.
pub async fn ingest_state_message(
    rtdb: &dyn Rtdb,
    stream_max_len: usize,
    topic: &str,
    payload: &[u8],
) {
    let Some(device_id) = keys::device_of_state_topic(topic) else {
        debug!("Ignoring message on unexpected topic {topic}");
        return;
    };
    if serde_json::from_slice::<DeviceState>(payload).is_err() {
        warn!("Dropping malformed state payload from device {device_id}");
        return;
    }
    if let Err(e) = rtdb
        .stream_add(
            &keys::device_stream(device_id),
            Bytes::copy_from_slice(payload),
            stream_max_len,
        )
        .await
    {
        warn!("Failed to buffer state for device {device_id}: {e}");
    }
}

/// Forward the newest unseen entry of every device stream, then drop the
/// buffered burst.
pub async fn drain_once(rtdb: &dyn Rtdb, queue: &TaskQueue) -> Result<()> {
    let streams = rtdb
        .scan_match(keys::DEVICE_STREAM_PATTERN)
        .await
        .map_err(crate::error::AutosrvError::InternalError)?;

    for stream_key in streams {
        let Some(device_id) = keys::device_of_stream(&stream_key) else {
            continue;
        };
        let last = rtdb
            .stream_last(&stream_key)
            .await
            .map_err(crate::error::AutosrvError::InternalError)?;
        let Some((entry_id, payload)) = last else {
            let _ = rtdb.stream_clear(&stream_key).await;
            continue;
        };

        let last_read_key = keys::stream_last_read(&stream_key);
        let already_seen = match rtdb.get(&last_read_key).await {
            Ok(Some(seen)) => seen.as_ref() == entry_id.as_bytes(),
            _ => false,
        };

        if !already_seen {
            match serde_json::from_slice::<DeviceState>(&payload) {
                Ok(state) => {
                    debug!("Debounced update for device {device_id} (entry {entry_id})");
                    queue.enqueue(Task::device_update(device_id, state)).await?;
                },
                Err(e) => warn!("Dropping malformed buffered state for {device_id}: {e}"),
            }
            if let Err(e) = rtdb
                .set(&last_read_key, Bytes::from(entry_id.clone()))
                .await
            {
                warn!("Failed to record last read for {stream_key}: {e}");
            }
        }

        if let Err(e) = rtdb.stream_clear(&stream_key).await {
            warn!("Failed to clear stream {stream_key}: {e}");
        }
    }
    Ok(())
}

/// Periodic debounce drain, one pass per window.
pub async fn run_debounce_drain(
    rtdb: Arc<dyn Rtdb>,
    queue: Arc<TaskQueue>,
    window: Duration,
    shutdown: Arc<Notify>,
) {
    let mut tick = tokio::time::interval(window);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {},
            _ = shutdown.notified() => break,
        }
        if let Err(e) = drain_once(rtdb.as_ref(), &queue).await {
            warn!("Debounce drain failed: {e}");
        }
    }
    debug!("Debounce drain stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::taskqueue::TaskKind;
    use hearth_rtdb::MemoryRtdb;
    use serde_json::json;

    fn fixture() -> (Arc<dyn Rtdb>, Arc<TaskQueue>) {
        let rtdb: Arc<dyn Rtdb> = Arc::new(MemoryRtdb::new());
        let queue = Arc::new(TaskQueue::new(Arc::clone(&rtdb), &EngineConfig::default()));
        (rtdb, queue)
    }

    #[tokio::test]
    async fn test_ingest_buffers_valid_payloads() {
        let (rtdb, _queue) = fixture();
        ingest_state_message(
            rtdb.as_ref(),
            100,
            "devices/t1/state",
            br#"{"temperature": 21.5}"#,
        )
        .await;
        assert!(rtdb.stream_last("stream:device:t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ingest_drops_garbage() {
        let (rtdb, _queue) = fixture();
        ingest_state_message(rtdb.as_ref(), 100, "devices/t1/state", b"not json").await;
        ingest_state_message(rtdb.as_ref(), 100, "devices/t1/state", b"[1,2,3]").await;
        ingest_state_message(rtdb.as_ref(), 100, "other/topic", br#"{"a":1}"#).await;
        assert!(rtdb.stream_last("stream:device:t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_takes_latest_entry_only() {
        let (rtdb, queue) = fixture();
        for temp in [20.0, 21.0, 22.0] {
            ingest_state_message(
                rtdb.as_ref(),
                100,
                "devices/t1/state",
                json!({"temperature": temp}).to_string().as_bytes(),
            )
            .await;
        }

        drain_once(rtdb.as_ref(), &queue).await.unwrap();
        let task = queue.try_pop().await.unwrap().unwrap();
        match task.kind {
            TaskKind::DeviceUpdate { device_id, state } => {
                assert_eq!(device_id, "t1");
                assert_eq!(state["temperature"], json!(22.0));
            },
            other => panic!("unexpected task: {other:?}"),
        }
        assert!(queue.try_pop().await.unwrap().is_none());

        // The burst is gone; a second pass finds nothing
        drain_once(rtdb.as_ref(), &queue).await.unwrap();
        assert!(queue.try_pop().await.unwrap().is_none());
        assert!(rtdb.stream_last("stream:device:t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_handles_multiple_devices() {
        let (rtdb, queue) = fixture();
        ingest_state_message(rtdb.as_ref(), 100, "devices/t1/state", br#"{"a":1}"#).await;
        ingest_state_message(rtdb.as_ref(), 100, "devices/t2/state", br#"{"b":2}"#).await;

        drain_once(rtdb.as_ref(), &queue).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_drain_records_last_read() {
        let (rtdb, queue) = fixture();
        ingest_state_message(rtdb.as_ref(), 100, "devices/t1/state", br#"{"a":1}"#).await;
        drain_once(rtdb.as_ref(), &queue).await.unwrap();

        assert!(rtdb
            .get("last_read:stream:device:t1")
            .await
            .unwrap()
            .is_some());
    }
}
