//! Queue consumer loop
//!
//! Pulls envelopes from one named queue and dispatches them through the task
//! registry. Successful jobs are acked, deferred ones go back to the queue
//! under the same job id. Failed jobs stay in flight and are redelivered
//! after the visibility timeout, except malformed ones, which are acked and
//! dropped. Repeated failures open a circuit breaker that pauses
//! the consumer.

use intake_common::errors::AppError;
use intake_common::queue::{Delivery, TaskQueue};
use intake_common::extraction::Handled;
use intake_common::TaskRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const MAX_FAILURES: u32 = 5;
const CIRCUIT_BREAK_DURATION: Duration = Duration::from_secs(30);
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Consecutive-failure breaker
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.consecutive_failures
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_failures >= MAX_FAILURES
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

/// What one poll did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Idle,
    Completed,
    Deferred,
    Dropped,
    Failed,
}

pub struct Consumer {
    name: String,
    queue_name: String,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<TaskRegistry>,
    poll_interval: Duration,
    breaker: CircuitBreaker,
}

impl Consumer {
    pub fn new(
        name: String,
        queue_name: String,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<TaskRegistry>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name,
            queue_name,
            queue,
            registry,
            poll_interval,
            breaker: CircuitBreaker::default(),
        }
    }

    /// Poll until `shutdown` flips to true. A job already dispatched runs to
    /// completion before the loop exits.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(consumer = %self.name, queue = %self.queue_name, "Consumer started");

        while !*shutdown.borrow() {
            if self.breaker.is_open() {
                warn!(
                    consumer = %self.name,
                    failures = self.breaker.consecutive_failures,
                    "Circuit breaker open, pausing..."
                );
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(CIRCUIT_BREAK_DURATION) => {}
                }
                self.breaker.reset();
                info!(consumer = %self.name, "Circuit breaker reset, resuming...");
            }

            if self.poll_once().await == PollOutcome::Idle {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!(consumer = %self.name, "Consumer stopped");
    }

    /// Receive and handle at most one job
    pub async fn poll_once(&mut self) -> PollOutcome {
        let delivery = match self.queue.dequeue(&self.queue_name).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return PollOutcome::Idle,
            Err(e) => {
                let failures = self.breaker.record_failure();
                error!(error = %e, failures, "Failed to receive from queue");
                tokio::time::sleep(RECEIVE_ERROR_PAUSE).await;
                return PollOutcome::Failed;
            }
        };

        let envelope = &delivery.envelope;
        debug!(job_id = %envelope.job_id, task = %envelope.task, "Received job");

        match self.registry.dispatch(envelope).await {
            Ok(Handled::Done) => {
                self.breaker.record_success();
                self.ack(&delivery).await;
                PollOutcome::Completed
            }
            Ok(Handled::Defer(countdown)) => {
                self.breaker.record_success();
                match self.queue.defer(&delivery, countdown).await {
                    Ok(true) => debug!(
                        job_id = %envelope.job_id,
                        countdown_ms = countdown.as_millis() as u64,
                        "Job deferred"
                    ),
                    Ok(false) => debug!(job_id = %envelope.job_id, "Deferred job was revoked"),
                    // Still in flight; the visibility timeout redelivers it
                    Err(e) => error!(job_id = %envelope.job_id, error = %e, "Failed to defer job"),
                }
                PollOutcome::Deferred
            }
            Err(e @ AppError::QueueError { .. }) => {
                error!(job_id = %envelope.job_id, error = %e, "Dropping undeliverable job");
                self.ack(&delivery).await;
                PollOutcome::Dropped
            }
            Err(e) => {
                let failures = self.breaker.record_failure();
                error!(
                    job_id = %envelope.job_id,
                    task = %envelope.task,
                    error = %e,
                    failures,
                    "Failed to process job"
                );
                // Left in flight for redelivery
                PollOutcome::Failed
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.ack(delivery).await {
            error!(job_id = %delivery.job_id(), error = %e, "Failed to ack job");
        }
    }
}
