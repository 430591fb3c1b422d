//! Automation engine core
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌────────────────┐
//! │ MQTT Ingress │──►│ Debounce +    │──►│ Task Queue     │
//! │ (state msgs) │   │ Significance  │   │ (worker pool)  │
//! └──────────────┘   └───────────────┘   └───────┬────────┘
//!        ▲                                       │
//! ┌──────┴───────┐   ┌───────────────┐   ┌───────▼────────┐
//! │ Devices      │◄──│ Dispatcher    │◄──│ Evaluator +    │
//! │ (commands)   │   │ (QoS 1)       │   │ Conflict Res.  │
//! └──────────────┘   └───────────────┘   └────────────────┘
//!              Scheduler (cron) ──► Task Queue
//! ```
//!
//! `Engine` wires the pieces together and owns the lifecycle: startup builds
//! the device→rule index, loads schedules, and starts the worker pool;
//! shutdown stops the scheduler first (no new enqueues), drains in-flight
//! tasks, then tears down the ingress loops.

pub mod dispatcher;
pub mod evaluator;
pub mod ingress;
pub mod updater;

pub use dispatcher::{CommandSink, MemorySink, MqttSink};
pub use ingress::Ingress;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::index::DeviceRuleIndex;
use crate::repository::Repository;
use crate::scheduler::Scheduler;
use crate::taskqueue::{Task, TaskHandler, TaskKind, TaskQueue};
use crate::time_extractor;
use async_trait::async_trait;
use evaluator::RuleExecutor;
use hearth_rtdb::{Rtdb, TimeProvider};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;
use updater::DeviceUpdater;

pub struct Engine {
    repo: Arc<dyn Repository>,
    rtdb: Arc<dyn Rtdb>,
    queue: Arc<TaskQueue>,
    scheduler: Arc<Scheduler>,
    index: Arc<DeviceRuleIndex>,
    updater: DeviceUpdater,
    executor: RuleExecutor,
    config: EngineConfig,
    shutdown: Arc<Notify>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        rtdb: Arc<dyn Rtdb>,
        repo: Arc<dyn Repository>,
        sink: Arc<dyn CommandSink>,
        clock: Arc<dyn TimeProvider>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let queue = Arc::new(TaskQueue::new(Arc::clone(&rtdb), &config));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&repo), Arc::clone(&queue)));
        let index = Arc::new(DeviceRuleIndex::new(Arc::clone(&rtdb), Arc::clone(&repo)));
        let updater = DeviceUpdater::new(
            Arc::clone(&rtdb),
            Arc::clone(&repo),
            Arc::clone(&index),
            Arc::clone(&queue),
            config.state_ttl_secs,
        );
        let executor = RuleExecutor::new(
            Arc::clone(&rtdb),
            Arc::clone(&repo),
            sink,
            clock,
            config.time_memo_ttl_secs,
        );
        Arc::new(Self {
            repo,
            rtdb,
            queue,
            scheduler,
            index,
            updater,
            executor,
            config,
            shutdown: Arc::new(Notify::new()),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn index(&self) -> &Arc<DeviceRuleIndex> {
        &self.index
    }

    /// Bring the engine up: index, schedules, workers, debounce drain.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("Starting automation engine");
        self.index.populate().await?;
        let loaded = self.scheduler.load_all().await?;
        info!("Loaded {loaded} schedule(s)");

        self.queue
            .start(Arc::clone(self) as Arc<dyn TaskHandler>, self.config.worker_concurrency);

        let drain = tokio::spawn(ingress::run_debounce_drain(
            Arc::clone(&self.rtdb),
            Arc::clone(&self.queue),
            self.config.debounce_window(),
            Arc::clone(&self.shutdown),
        ));
        self.background.lock().push(drain);

        info!("Automation engine started");
        Ok(())
    }

    /// Attach the broker ingress loop to the engine's lifecycle.
    pub fn spawn_ingress(&self, ingress: Ingress) {
        self.background.lock().push(tokio::spawn(ingress.run()));
    }

    /// Graceful shutdown: scheduler first, then worker drain, then the
    /// ingress and debounce loops.
    pub async fn shutdown(&self) {
        info!("Stopping automation engine");
        self.scheduler.shutdown().await;
        self.shutdown.notify_waiters();
        self.queue.shutdown().await;
        for task in self.background.lock().drain(..) {
            task.abort();
        }
        info!("Automation engine stopped");
    }

    // ----- Entry points for the external CRUD surface -----

    /// React to a rule create/update: refresh its index entries, regenerate
    /// its auto-synthesized schedules, and reconcile the live cron jobs.
    pub async fn refresh_rule(&self, rule_id: &str) -> Result<()> {
        self.index.refresh(rule_id).await?;

        // Stale jobs must be cancelled through their schedule IDs
        for stale in self.repo.schedules_for_rule(rule_id).await? {
            self.scheduler.remove(&stale.id).await;
        }

        let Some(rule) = self.repo.get_rule(rule_id).await? else {
            self.repo.delete_schedules_for_rule(rule_id).await?;
            return Ok(());
        };
        let schedules = time_extractor::sync_rule_schedules(self.repo.as_ref(), &rule).await?;
        for schedule in &schedules {
            self.scheduler
                .add_or_update(
                    &schedule.id,
                    &schedule.rule_id,
                    &schedule.cron_expression,
                    schedule.enabled,
                )
                .await?;
        }
        info!("Refreshed rule {rule_id}");
        Ok(())
    }

    /// React to a rule deletion: drop index entries, schedules, and jobs.
    pub async fn remove_rule(&self, rule_id: &str) -> Result<()> {
        self.index.remove(rule_id).await?;
        for stale in self.repo.schedules_for_rule(rule_id).await? {
            self.scheduler.remove(&stale.id).await;
        }
        self.repo.delete_schedules_for_rule(rule_id).await?;
        info!("Removed rule {rule_id}");
        Ok(())
    }

    /// Rebuild the whole device→rule index.
    pub async fn reindex(&self) -> Result<()> {
        self.index.populate().await
    }

    /// Queue an immediate evaluation of one rule.
    pub async fn trigger_rule(&self, rule_id: &str) -> Result<()> {
        self.queue.enqueue(Task::evaluate_rule(rule_id, "")).await
    }
}

#[async_trait]
impl TaskHandler for Engine {
    async fn handle(&self, task: &Task) -> Result<()> {
        match &task.kind {
            TaskKind::DeviceUpdate { device_id, state } => {
                self.updater.handle_update(device_id, state).await
            },
            TaskKind::EvaluateRule {
                rule_id,
                updated_device_id,
            } => self.executor.execute(rule_id, updated_device_id).await,
        }
    }
}
