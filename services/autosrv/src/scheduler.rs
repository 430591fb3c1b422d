//! Cron scheduler
//!
//! Fires time-based rule evaluations by enqueuing `evaluate_rule` tasks.
//! Scheduler jobs do exactly one thing; the evaluation itself always runs
//! on the shared worker pool with its usual timeout and retry envelope.
//!
//! Live jobs are tracked in a `schedule_id → handle` map so an updated or
//! removed schedule can always find the job it replaced. Without the map,
//! stale jobs accumulate and keep firing forever.

use crate::error::{AutosrvError, Result};
use crate::repository::Repository;
use crate::taskqueue::{Task, TaskQueue};
use chrono::Utc;
use cron::Schedule as CronSchedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct ScheduledJob {
    rule_id: String,
    handle: JoinHandle<()>,
}

/// Cron dispatcher mapping schedule IDs to live job handles
pub struct Scheduler {
    repo: Arc<dyn Repository>,
    queue: Arc<TaskQueue>,
    jobs: RwLock<HashMap<String, ScheduledJob>>,
}

/// Parse a cron expression, accepting the standard five-field form.
///
/// The `cron` crate wants a seconds field; auto-generated expressions are
/// five-field, so a `0` seconds column is prepended when needed.
pub fn parse_cron(expression: &str) -> Result<CronSchedule> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    CronSchedule::from_str(&normalized).map_err(|e| AutosrvError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

impl Scheduler {
    pub fn new(repo: Arc<dyn Repository>, queue: Arc<TaskQueue>) -> Self {
        Self {
            repo,
            queue,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a job for every enabled schedule
    pub async fn load_all(&self) -> Result<usize> {
        let schedules = self.repo.list_enabled_schedules().await?;
        info!("Loading {} enabled schedule(s)", schedules.len());

        let mut loaded = 0;
        for schedule in schedules {
            match self
                .register(&schedule.id, &schedule.rule_id, &schedule.cron_expression)
                .await
            {
                Ok(()) => loaded += 1,
                Err(e) => error!(
                    "Failed to schedule rule {} with cron '{}': {e}",
                    schedule.rule_id, schedule.cron_expression
                ),
            }
        }
        Ok(loaded)
    }

    /// Drop every registered job and reload from the store
    pub async fn reload(&self) -> Result<usize> {
        self.clear().await;
        self.load_all().await
    }

    /// Replace (or create) the job for one schedule
    pub async fn add_or_update(
        &self,
        schedule_id: &str,
        rule_id: &str,
        cron_expression: &str,
        enabled: bool,
    ) -> Result<()> {
        self.remove(schedule_id).await;
        if !enabled {
            debug!("Schedule {schedule_id} is disabled, not registering");
            return Ok(());
        }
        self.register(schedule_id, rule_id, cron_expression).await
    }

    /// Cancel the job for one schedule, if registered
    pub async fn remove(&self, schedule_id: &str) {
        if let Some(job) = self.jobs.write().await.remove(schedule_id) {
            job.handle.abort();
            debug!(
                "Removed schedule {schedule_id} (rule {})",
                job.rule_id
            );
        }
    }

    /// Cancel every job
    pub async fn clear(&self) {
        let mut jobs = self.jobs.write().await;
        for (schedule_id, job) in jobs.drain() {
            job.handle.abort();
            debug!("Removed schedule {schedule_id}");
        }
    }

    /// Stop the scheduler; no further evaluations are enqueued
    pub async fn shutdown(&self) {
        self.clear().await;
        info!("Scheduler stopped");
    }

    /// Number of live jobs
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    async fn register(
        &self,
        schedule_id: &str,
        rule_id: &str,
        cron_expression: &str,
    ) -> Result<()> {
        let schedule = parse_cron(cron_expression)?;
        let queue = Arc::clone(&self.queue);
        let job_rule_id = rule_id.to_string();
        let job_schedule_id = schedule_id.to_string();

        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = schedule.after(&now).next() else {
                    warn!("Schedule {job_schedule_id} has no future fire times");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;

                debug!(
                    "Cron fired for rule {job_rule_id} (schedule {job_schedule_id})"
                );
                if let Err(e) = queue.enqueue(Task::evaluate_rule(&job_rule_id, "")).await {
                    warn!("Failed to enqueue evaluation for rule {job_rule_id}: {e}");
                }
            }
        });

        self.jobs.write().await.insert(
            schedule_id.to_string(),
            ScheduledJob {
                rule_id: rule_id.to_string(),
                handle,
            },
        );
        info!("Scheduled rule {rule_id} with cron '{cron_expression}' (schedule {schedule_id})");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::repository::MemoryRepository;
    use hearth_rtdb::MemoryRtdb;

    fn fixture() -> (Arc<MemoryRepository>, Arc<TaskQueue>, Scheduler) {
        let rtdb: Arc<dyn hearth_rtdb::Rtdb> = Arc::new(MemoryRtdb::new());
        let repo = Arc::new(MemoryRepository::new());
        let queue = Arc::new(TaskQueue::new(rtdb, &EngineConfig::default()));
        let scheduler = Scheduler::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            Arc::clone(&queue),
        );
        (repo, queue, scheduler)
    }

    #[test]
    fn test_parse_cron_accepts_five_fields() {
        assert!(parse_cron("0 18 * * *").is_ok());
        assert!(parse_cron("30 7 * * *").is_ok());
        // Six fields pass through untouched
        assert!(parse_cron("0 0 18 * * *").is_ok());
        assert!(parse_cron("whenever").is_err());
        assert!(parse_cron("99 99 * * *").is_err());
    }

    #[tokio::test]
    async fn test_load_all_registers_enabled_schedules() {
        let (repo, _queue, scheduler) = fixture();
        repo.upsert_schedule("r1", "0 18 * * *").await.unwrap();
        repo.upsert_schedule("r2", "30 7 * * *").await.unwrap();

        assert_eq!(scheduler.load_all().await.unwrap(), 2);
        assert_eq!(scheduler.job_count().await, 2);

        scheduler.shutdown().await;
        assert_eq!(scheduler.job_count().await, 0);
    }

    #[tokio::test]
    async fn test_add_or_update_replaces_without_leaking() {
        let (_repo, _queue, scheduler) = fixture();
        scheduler
            .add_or_update("s1", "r1", "0 18 * * *", true)
            .await
            .unwrap();
        scheduler
            .add_or_update("s1", "r1", "0 19 * * *", true)
            .await
            .unwrap();
        assert_eq!(scheduler.job_count().await, 1);

        // Disabling removes the job entirely
        scheduler
            .add_or_update("s1", "r1", "0 19 * * *", false)
            .await
            .unwrap();
        assert_eq!(scheduler.job_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_schedule_is_harmless() {
        let (_repo, _queue, scheduler) = fixture();
        scheduler.remove("nope").await;
        assert_eq!(scheduler.job_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fired_job_enqueues_evaluation() {
        let (_repo, queue, scheduler) = fixture();
        scheduler
            .add_or_update("s1", "r1", "* * * * *", true)
            .await
            .unwrap();

        // Virtual clock sails past the next minute boundary
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(queue.pending().await.unwrap() >= 1);

        scheduler.shutdown().await;
    }
}
