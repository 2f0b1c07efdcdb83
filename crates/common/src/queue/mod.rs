//! Priority task queue for async job processing
//!
//! Provides:
//! - Task envelopes routed to named queues
//! - Priority ordering (lower number first) with optional countdown
//! - At-least-once delivery through an in-flight set with visibility timeout
//! - Deferral of a delivered job without losing its id
//! - Best-effort revocation of queued jobs
//!
//! Two backends implement [`TaskQueue`]: [`RedisQueue`] for deployments and
//! [`MemoryQueue`] for tests and single-process runs.

mod memory;
mod redis_queue;

pub use self::memory::MemoryQueue;
pub use self::redis_queue::RedisQueue;

use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A unit of work addressed to a registered task handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub job_id: String,
    /// Registered task name, e.g. `extraction.process_document`
    pub task: String,
    pub queue: String,
    pub priority: u8,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new<T: Serialize>(
        task: &str,
        queue: &str,
        priority: u8,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self {
            job_id: Uuid::new_v4().to_string(),
            task: task.to_string(),
            queue: queue.to_string(),
            priority,
            payload: serde_json::to_value(payload)?,
            enqueued_at: Utc::now(),
        })
    }

    /// Parse the payload as a typed message
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| AppError::QueueError {
            message: format!("Failed to parse payload of job {}: {}", self.job_id, e),
        })
    }
}

/// A delivered envelope that must be acknowledged once handled
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: TaskEnvelope,
}

impl Delivery {
    pub fn job_id(&self) -> &str {
        &self.envelope.job_id
    }
}

/// Broker contract for the task pipeline
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue an envelope on its queue, visible after `countdown`
    async fn enqueue(&self, envelope: TaskEnvelope, countdown: Duration) -> Result<String>;

    /// Take the highest-priority visible job of `queue`, if any
    async fn dequeue(&self, queue: &str) -> Result<Option<Delivery>>;

    /// Remove a delivered job for good
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Hand a delivered job back, visible again after `countdown` under the
    /// same job id. Returns false when the job was revoked meanwhile.
    async fn defer(&self, delivery: &Delivery, countdown: Duration) -> Result<bool>;

    /// Drop a job that has not been delivered yet. Returns whether anything
    /// was removed; a job already executing is left to finish.
    async fn revoke(&self, queue: &str, job_id: &str) -> Result<bool>;

    /// Check broker connectivity
    async fn ping(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        document_id: Uuid,
    }

    #[test]
    fn test_envelope_payload_roundtrip() {
        let payload = Payload {
            document_id: Uuid::new_v4(),
        };
        let envelope = TaskEnvelope::new("extraction.process_document", "ocr", 0, &payload).unwrap();
        assert_eq!(envelope.queue, "ocr");
        assert_eq!(envelope.parse_payload::<Payload>().unwrap(), payload);
    }

    #[test]
    fn test_bad_payload_is_queue_error() {
        let mut envelope = TaskEnvelope::new("t", "q", 0, &json!({})).unwrap();
        envelope.payload = json!({"document_id": 7});
        let err = envelope.parse_payload::<Payload>().unwrap_err();
        assert!(matches!(err, AppError::QueueError { .. }));
    }
}
