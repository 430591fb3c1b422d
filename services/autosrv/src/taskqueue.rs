//! Durable task queue
//!
//! Work items are JSON envelopes on a store-backed list, so they survive a
//! process restart and are shared by every worker in the pool. Two task kinds
//! exist: `device_update` (a debounced state observation) and `evaluate_rule`
//! (one rule to evaluate). Failed tasks are retried with exponential backoff
//! up to the retry cap, then parked on a dead-letter list.

use crate::config::EngineConfig;
use crate::error::{AutosrvError, Result};
use crate::keys;
use crate::models::DeviceState;
use async_trait::async_trait;
use bytes::Bytes;
use hearth_rtdb::Rtdb;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Poll interval for the blocking dequeue, seconds. Short enough that
/// shutdown and the drain flag are observed promptly.
const DEQUEUE_BLOCK_SECS: u64 = 1;

/// Task payloads, tagged by kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum TaskKind {
    /// A debounced device state observation
    DeviceUpdate {
        #[serde(rename = "DeviceID")]
        device_id: String,
        #[serde(rename = "State")]
        state: DeviceState,
    },

    /// Evaluate one rule, optionally noting which device update triggered it
    EvaluateRule {
        #[serde(rename = "RuleID")]
        rule_id: String,
        #[serde(rename = "UpdatedDeviceID", default)]
        updated_device_id: String,
    },
}

/// Queue envelope around a task payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    #[serde(default)]
    pub retried: u32,
}

impl Task {
    pub fn device_update(device_id: &str, state: DeviceState) -> Self {
        Self::wrap(TaskKind::DeviceUpdate {
            device_id: device_id.to_string(),
            state,
        })
    }

    pub fn evaluate_rule(rule_id: &str, updated_device_id: &str) -> Self {
        Self::wrap(TaskKind::EvaluateRule {
            rule_id: rule_id.to_string(),
            updated_device_id: updated_device_id.to_string(),
        })
    }

    fn wrap(kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            retried: 0,
        }
    }
}

/// Executes dequeued tasks
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: &Task) -> Result<()>;
}

/// Store-backed work queue with a bounded worker pool
pub struct TaskQueue {
    rtdb: Arc<dyn Rtdb>,
    task_timeout: Duration,
    max_retries: u32,
    shutdown: Arc<Notify>,
    draining: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(rtdb: Arc<dyn Rtdb>, config: &EngineConfig) -> Self {
        Self {
            rtdb,
            task_timeout: config.task_timeout(),
            max_retries: config.max_retries,
            shutdown: Arc::new(Notify::new()),
            draining: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a task for the worker pool
    pub async fn enqueue(&self, task: Task) -> Result<()> {
        if self.draining.load(Ordering::Relaxed) {
            return Err(AutosrvError::TaskError("queue is draining".to_string()));
        }
        let payload = serde_json::to_vec(&task)?;
        self.rtdb
            .list_rpush(keys::TASK_QUEUE, Bytes::from(payload))
            .await
            .map_err(AutosrvError::InternalError)?;
        debug!(task_id = %task.id, "Enqueued task");
        Ok(())
    }

    /// Pop one pending task without blocking
    ///
    /// Undecodable entries are dropped with an error log; retrying garbage
    /// cannot succeed.
    pub async fn try_pop(&self) -> Result<Option<Task>> {
        loop {
            let Some(payload) = self
                .rtdb
                .list_lpop(keys::TASK_QUEUE)
                .await
                .map_err(AutosrvError::InternalError)?
            else {
                return Ok(None);
            };
            match serde_json::from_slice::<Task>(&payload) {
                Ok(task) => return Ok(Some(task)),
                Err(e) => error!("Dropping undecodable task payload: {e}"),
            }
        }
    }

    /// Number of tasks waiting to run
    pub async fn pending(&self) -> Result<usize> {
        self.rtdb
            .list_len(keys::TASK_QUEUE)
            .await
            .map_err(AutosrvError::InternalError)
    }

    /// Number of dead-lettered tasks
    pub async fn dead_letter_count(&self) -> Result<usize> {
        self.rtdb
            .list_len(keys::DEAD_LETTER_QUEUE)
            .await
            .map_err(AutosrvError::InternalError)
    }

    /// Spawn the worker pool
    pub fn start(self: &Arc<Self>, handler: Arc<dyn TaskHandler>, concurrency: usize) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!("Worker pool already running");
            return;
        }
        info!("Starting {concurrency} task workers");
        for worker_id in 0..concurrency {
            let queue = Arc::clone(self);
            let handler = Arc::clone(&handler);
            workers.push(tokio::spawn(async move {
                queue.worker_loop(worker_id, handler).await;
            }));
        }
    }

    /// Stop accepting work, let in-flight tasks finish, and join the pool
    pub async fn shutdown(&self) {
        self.draining.store(true, Ordering::Relaxed);
        self.shutdown.notify_waiters();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Worker exited abnormally: {e}");
            }
        }
        info!("Task workers drained");
    }

    async fn worker_loop(&self, worker_id: usize, handler: Arc<dyn TaskHandler>) {
        debug!("Worker {worker_id} started");
        loop {
            if self.draining.load(Ordering::Relaxed) {
                break;
            }
            let popped = tokio::select! {
                result = self
                    .rtdb
                    .list_blpop(&[keys::TASK_QUEUE], DEQUEUE_BLOCK_SECS) => result,
                _ = self.shutdown.notified() => break,
            };
            match popped {
                Ok(Some((_, payload))) => self.process(&handler, payload).await,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Worker {worker_id} dequeue failed: {e}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                },
            }
        }
        debug!("Worker {worker_id} stopped");
    }

    async fn process(&self, handler: &Arc<dyn TaskHandler>, payload: Bytes) {
        let task = match serde_json::from_slice::<Task>(&payload) {
            Ok(task) => task,
            Err(e) => {
                error!("Dropping undecodable task payload: {e}");
                return;
            },
        };

        let outcome = match tokio::time::timeout(self.task_timeout, handler.handle(&task)).await {
            Ok(Ok(())) => {
                debug!(task_id = %task.id, "Task succeeded");
                return;
            },
            Ok(Err(e)) => e,
            Err(_) => AutosrvError::TaskTimeout(self.task_timeout.as_secs()),
        };

        self.reschedule(task, outcome).await;
    }

    async fn reschedule(&self, mut task: Task, cause: AutosrvError) {
        task.retried += 1;
        if task.retried > self.max_retries {
            error!(
                task_id = %task.id,
                retries = task.retried - 1,
                "Task exhausted retries, dead-lettering: {cause}"
            );
            let payload = match serde_json::to_vec(&task) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to serialize dead-lettered task: {e}");
                    return;
                },
            };
            if let Err(e) = self
                .rtdb
                .list_rpush(keys::DEAD_LETTER_QUEUE, Bytes::from(payload))
                .await
            {
                error!("Failed to dead-letter task: {e}");
            }
            return;
        }

        let backoff = Duration::from_secs(2u64.saturating_pow(task.retried).min(30));
        warn!(
            task_id = %task.id,
            attempt = task.retried,
            "Task failed ({cause}), retrying in {}s",
            backoff.as_secs()
        );
        let rtdb = Arc::clone(&self.rtdb);
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let payload = match serde_json::to_vec(&task) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to serialize retried task: {e}");
                    return;
                },
            };
            if let Err(e) = rtdb.list_rpush(keys::TASK_QUEUE, Bytes::from(payload)).await {
                error!("Failed to requeue task: {e}");
            }
        });
    }
}
