use super::{ChannelMessage, ProgressPublisher};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, warn};

/// Topic fan-out over Redis PUBLISH / SUBSCRIBE
pub struct RedisPublisher {
    client: Client,
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisPublisher {
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| AppError::Broker {
            message: format!("Failed to create Redis client: {}", e),
        })?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| AppError::Broker {
                message: format!("Failed to connect to Redis: {}", e),
            })?;

        Ok(Self {
            client,
            conn,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn channel(&self, topic: &str) -> String {
        format!("{}:{}", self.key_prefix, topic)
    }
}

#[async_trait]
impl ProgressPublisher for RedisPublisher {
    async fn publish(&self, topic: &str, message: &ChannelMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(self.channel(topic), payload).await?;
        debug!(topic, receivers, "Published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, ChannelMessage>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel(topic)).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Unreadable pub/sub payload");
                    return None;
                }
            };
            match serde_json::from_str::<ChannelMessage>(&payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "Malformed channel message");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
