//! Live progress notifications
//!
//! Every document has exactly one topic, `extraction:{document_id}`. Delivery
//! is at-most-once to whoever is subscribed at publish time; there is no
//! replay, so late subscribers read persisted state first.

mod broadcast;
mod redis_pubsub;

pub use self::broadcast::BroadcastPublisher;
pub use self::redis_pubsub::RedisPublisher;

use crate::errors::Result;
use crate::extraction::model::{ExtractionTask, TaskStatus};
use crate::metrics;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Topic carrying events for one document
pub fn topic(document_id: Uuid) -> String {
    format!("extraction:{document_id}")
}

/// Status payload pushed to live subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub document_id: Uuid,
    pub complete: bool,
    pub progress: i32,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub retry_count: i32,
}

impl ProgressEvent {
    pub fn from_task(task: &ExtractionTask) -> Self {
        Self {
            document_id: task.document_id,
            complete: task.status == TaskStatus::Succeeded,
            progress: task.progress,
            status: task.status,
            message: task.error_message.clone(),
            retry_count: task.retry_count,
        }
    }
}

/// Everything that travels on a live-status channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    Status(ProgressEvent),
    ActionResult {
        action: String,
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
    },
}

/// Fan-out transport for channel messages
#[async_trait]
pub trait ProgressPublisher: Send + Sync {
    async fn publish(&self, topic: &str, message: &ChannelMessage) -> Result<()>;

    /// Stream of messages published to `topic` after this call returns
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, ChannelMessage>>;
}

/// Publishes progress without ever failing the caller
#[derive(Clone)]
pub struct Notifier {
    publisher: Arc<dyn ProgressPublisher>,
}

impl Notifier {
    pub fn new(publisher: Arc<dyn ProgressPublisher>) -> Self {
        Self { publisher }
    }

    pub fn publisher(&self) -> Arc<dyn ProgressPublisher> {
        Arc::clone(&self.publisher)
    }

    pub async fn notify(&self, event: ProgressEvent) {
        let document_id = event.document_id;
        if let Err(e) = self
            .publisher
            .publish(&topic(document_id), &ChannelMessage::Status(event))
            .await
        {
            metrics::record_notification_dropped();
            warn!(document_id = %document_id, error = %e, "Failed to publish progress");
        }
    }

    /// Publish the current state of a task record
    pub async fn notify_task(&self, task: &ExtractionTask) {
        self.notify(ProgressEvent::from_task(task)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_wire_shape() {
        let id = Uuid::new_v4();
        let message = ChannelMessage::Status(ProgressEvent {
            document_id: id,
            complete: false,
            progress: 40,
            status: TaskStatus::Running,
            message: None,
            retry_count: 1,
        });
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["progress"], 40);
        assert_eq!(value["status"], "running");
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_action_result_wire_shape() {
        let message = ChannelMessage::ActionResult {
            action: "retry_ocr".into(),
            accepted: false,
            message: Some("retry limit reached".into()),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "action_result",
                "action": "retry_ocr",
                "accepted": false,
                "message": "retry limit reached"
            })
        );
    }

    struct Unreachable;

    #[async_trait]
    impl ProgressPublisher for Unreachable {
        async fn publish(&self, _: &str, _: &ChannelMessage) -> Result<()> {
            Err(crate::errors::AppError::Broker {
                message: "connection refused".into(),
            })
        }

        async fn subscribe(&self, _: &str) -> Result<BoxStream<'static, ChannelMessage>> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    #[test]
    fn test_publish_failure_is_swallowed() {
        let notifier = Notifier::new(Arc::new(Unreachable));
        let task = ExtractionTask::new(Uuid::new_v4());
        tokio_test::block_on(notifier.notify_task(&task));
    }

    #[test]
    fn test_topic_format() {
        let id = Uuid::nil();
        assert_eq!(topic(id), "extraction:00000000-0000-0000-0000-000000000000");
    }
}
