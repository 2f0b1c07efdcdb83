use super::{ChannelMessage, ProgressPublisher};
use crate::errors::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// In-process topic fan-out over `tokio::sync::broadcast`
#[derive(Clone)]
pub struct BroadcastPublisher {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<ChannelMessage>>>>,
    capacity: usize,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<ChannelMessage> {
        let mut topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl ProgressPublisher for BroadcastPublisher {
    async fn publish(&self, topic: &str, message: &ChannelMessage) -> Result<()> {
        let sender = {
            let mut topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
            match topics.get(topic) {
                Some(sender) if sender.receiver_count() > 0 => sender.clone(),
                Some(_) => {
                    topics.remove(topic);
                    return Ok(());
                }
                None => return Ok(()),
            }
        };
        // No receivers is fine
        let _ = sender.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, ChannelMessage>> {
        let receiver = self.sender(topic).subscribe();
        let topic = topic.to_string();
        let stream = stream::unfold(receiver, move |mut rx| {
            let topic = topic.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(message) => return Some((message, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(topic = %topic, skipped, "Subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::model::TaskStatus;
    use crate::notify::{topic, ProgressEvent};
    use uuid::Uuid;

    fn status(document_id: Uuid, progress: i32) -> ChannelMessage {
        ChannelMessage::Status(ProgressEvent {
            document_id,
            complete: false,
            progress,
            status: TaskStatus::Running,
            message: None,
            retry_count: 0,
        })
    }

    #[tokio::test]
    async fn test_only_topic_subscribers_receive() {
        let publisher = BroadcastPublisher::default();
        let mine = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut stream = publisher.subscribe(&topic(mine)).await.unwrap();
        let mut other_stream = publisher.subscribe(&topic(other)).await.unwrap();

        publisher.publish(&topic(mine), &status(mine, 10)).await.unwrap();
        assert_eq!(stream.next().await, Some(status(mine, 10)));

        publisher.publish(&topic(other), &status(other, 20)).await.unwrap();
        assert_eq!(other_stream.next().await, Some(status(other, 20)));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = BroadcastPublisher::default();
        let id = Uuid::new_v4();
        publisher.publish(&topic(id), &status(id, 10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let publisher = BroadcastPublisher::default();
        let id = Uuid::new_v4();
        let _early = publisher.subscribe(&topic(id)).await.unwrap();
        publisher.publish(&topic(id), &status(id, 10)).await.unwrap();

        let mut late = publisher.subscribe(&topic(id)).await.unwrap();
        publisher.publish(&topic(id), &status(id, 20)).await.unwrap();
        assert_eq!(late.next().await, Some(status(id, 20)));
    }
}
