//! Periodic enqueueing of the maintenance sweeps

use intake_common::config::AppConfig;
use intake_common::extraction::registry::{route, PURGE_RESULTS, SWEEP_STUCK};
use intake_common::extraction::Priority;
use intake_common::queue::{TaskEnvelope, TaskQueue};
use intake_common::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

pub struct Scheduler {
    queue: Arc<dyn TaskQueue>,
    config: Arc<AppConfig>,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn TaskQueue>, config: Arc<AppConfig>) -> Self {
        Self { queue, config }
    }

    /// Enqueue each sweep once per period until `shutdown` flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let sweeps = &self.config.sweeps;
        let mut stuck = ticker(sweeps.stuck_interval());
        let mut retention = ticker(sweeps.retention_interval());

        info!(
            stuck_interval_secs = sweeps.stuck_interval_secs,
            retention_interval_secs = sweeps.retention_interval_secs,
            "Sweep scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = stuck.tick() => self.submit(SWEEP_STUCK).await,
                _ = retention.tick() => self.submit(PURGE_RESULTS).await,
            }
        }

        info!("Sweep scheduler stopped");
    }

    async fn submit(&self, task: &str) {
        if let Err(e) = self.enqueue(task).await {
            error!(task, error = %e, "Failed to enqueue sweep");
        }
    }

    pub async fn enqueue(&self, task: &str) -> Result<String> {
        let envelope = TaskEnvelope::new(
            task,
            route(task, &self.config.queue),
            Priority::Sweep.value(),
            &(),
        )?;
        let job_id = self.queue.enqueue(envelope, Duration::ZERO).await?;
        info!(task, job_id = %job_id, "Sweep enqueued");
        Ok(job_id)
    }
}

/// First tick one full period after start
fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use intake_common::queue::MemoryQueue;

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_enqueued_on_schedule() {
        let queue = Arc::new(MemoryQueue::default());
        let mut config = AppConfig::default();
        config.sweeps.stuck_interval_secs = 300;
        config.sweeps.retention_interval_secs = 1_000;
        let scheduler = Scheduler::new(queue.clone(), Arc::new(config));

        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(queue.pending("default").is_empty());

        tokio::time::sleep(Duration::from_secs(700)).await;
        let tasks: Vec<String> = queue.pending("default").into_iter().map(|e| e.task).collect();
        assert_eq!(tasks, vec![SWEEP_STUCK.to_string(), SWEEP_STUCK.to_string()]);

        tokio::time::sleep(Duration::from_secs(300)).await;
        let pending = queue.pending("default");
        assert!(pending.iter().any(|e| e.task == PURGE_RESULTS));
        assert!(pending.iter().all(|e| e.priority == Priority::Sweep.value()));

        tx.send(true).unwrap();
        running.await.unwrap();
    }
}
