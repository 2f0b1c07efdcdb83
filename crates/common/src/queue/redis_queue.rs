use super::{Delivery, TaskEnvelope, TaskQueue};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue, RedisError, Script};
use std::time::Duration;
use tracing::{debug, warn};

/// Stores the body and rank, then lands the job in `ready` or `delayed`
const ENQUEUE: &str = r#"
redis.call('HSET', KEYS[4], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[5], ARGV[1], ARGV[3])
if tonumber(ARGV[4]) > tonumber(ARGV[5]) then
  redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
else
  redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
end
return 1
"#;

/// Promotes due and expired jobs, then moves the head of `ready` in flight
const DEQUEUE: &str = r#"
local now = tonumber(ARGV[1])
local function requeue(set)
  local ids = redis.call('ZRANGEBYSCORE', set, '-inf', now)
  for _, id in ipairs(ids) do
    redis.call('ZREM', set, id)
    local rank = redis.call('HGET', KEYS[5], id)
    if rank then redis.call('ZADD', KEYS[1], rank, id) end
  end
end
requeue(KEYS[2])
requeue(KEYS[3])
while true do
  local head = redis.call('ZRANGE', KEYS[1], 0, 0)
  if #head == 0 then return false end
  local id = head[1]
  redis.call('ZREM', KEYS[1], id)
  local body = redis.call('HGET', KEYS[4], id)
  if body then
    redis.call('ZADD', KEYS[3], now + tonumber(ARGV[2]), id)
    return body
  end
end
"#;

/// Moves an in-flight job to `delayed`; a revoked job has no body left
const DEFER: &str = r#"
if redis.call('ZREM', KEYS[3], ARGV[1]) == 0 then return 0 end
if redis.call('HEXISTS', KEYS[4], ARGV[1]) == 0 then return 0 end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

/// Removes a job from every set plus its body
const FORGET: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[5], ARGV[1])
return redis.call('HDEL', KEYS[4], ARGV[1])
"#;

/// Ready score: priority first, then enqueue time
fn rank(priority: u8, enqueued_ms: i64) -> i64 {
    i64::from(priority) * 10_000_000_000_000 + enqueued_ms
}

/// Redis-backed priority queue
///
/// Per queue: `ready` and `delayed` sorted sets, an `inflight` sorted set
/// scored by visibility deadline, and `jobs` / `ranks` hashes keyed by job id.
pub struct RedisQueue {
    conn: ConnectionManager,
    key_prefix: String,
    visibility_timeout: Duration,
    enqueue_script: Script,
    dequeue_script: Script,
    defer_script: Script,
    forget_script: Script,
}

impl RedisQueue {
    pub async fn connect(url: &str, key_prefix: &str, visibility_timeout: Duration) -> Result<Self> {
        let client = Client::open(url).map_err(|e| AppError::Broker {
            message: format!("Failed to create Redis client: {}", e),
        })?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Broker {
                message: format!("Failed to connect to Redis: {}", e),
            })?;

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            visibility_timeout,
            enqueue_script: Script::new(ENQUEUE),
            dequeue_script: Script::new(DEQUEUE),
            defer_script: Script::new(DEFER),
            forget_script: Script::new(FORGET),
        })
    }

    /// KEYS layout shared by all scripts: ready, delayed, inflight, jobs, ranks
    fn keys(&self, queue: &str) -> [String; 5] {
        let base = format!("{}:queue:{}", self.key_prefix, queue);
        [
            format!("{base}:ready"),
            format!("{base}:delayed"),
            format!("{base}:inflight"),
            format!("{base}:jobs"),
            format!("{base}:ranks"),
        ]
    }

    fn policy() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            max_elapsed_time: Some(Duration::from_secs(5)),
            ..ExponentialBackoff::default()
        }
    }

    async fn run<T: FromRedisValue + Send>(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<T> {
        let conn = &self.conn;
        let op = move || async move {
            let mut conn = conn.clone();
            let mut invocation = script.prepare_invoke();
            for key in keys {
                invocation.key(key);
            }
            for arg in args {
                invocation.arg(arg);
            }
            invocation
                .invoke_async::<T>(&mut conn)
                .await
                .map_err(classify)
        };

        retry(Self::policy(), op).await.map_err(AppError::from)
    }
}

/// Connection-level failures are worth retrying, script errors are not
fn classify(err: RedisError) -> backoff::Error<RedisError> {
    if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
        warn!(error = %err, "Transient broker error, retrying");
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn enqueue(&self, envelope: TaskEnvelope, countdown: Duration) -> Result<String> {
        let now_ms = Utc::now().timestamp_millis();
        let due_ms = now_ms + countdown.as_millis() as i64;
        let body = serde_json::to_string(&envelope)?;
        let args = [
            envelope.job_id.clone(),
            body,
            rank(envelope.priority, envelope.enqueued_at.timestamp_millis()).to_string(),
            due_ms.to_string(),
            now_ms.to_string(),
        ];

        self.run::<i64>(&self.enqueue_script, &self.keys(&envelope.queue), &args)
            .await?;

        debug!(
            job_id = %envelope.job_id,
            queue = %envelope.queue,
            priority = envelope.priority,
            countdown_ms = countdown.as_millis() as u64,
            "Job enqueued"
        );
        Ok(envelope.job_id)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Delivery>> {
        let args = [
            Utc::now().timestamp_millis().to_string(),
            (self.visibility_timeout.as_millis() as i64).to_string(),
        ];
        let body: Option<String> = self.run(&self.dequeue_script, &self.keys(queue), &args).await?;

        match body {
            Some(json) => {
                let envelope: TaskEnvelope =
                    serde_json::from_str(&json).map_err(|e| AppError::QueueError {
                        message: format!("Failed to parse job body: {}", e),
                    })?;
                debug!(job_id = %envelope.job_id, queue, "Job delivered");
                Ok(Some(Delivery { envelope }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let keys = self.keys(&delivery.envelope.queue);
        self.run::<i64>(&self.forget_script, &keys, &[delivery.job_id().to_string()])
            .await?;
        Ok(())
    }

    async fn defer(&self, delivery: &Delivery, countdown: Duration) -> Result<bool> {
        let due_ms = Utc::now().timestamp_millis() + countdown.as_millis() as i64;
        let args = [delivery.job_id().to_string(), due_ms.to_string()];
        let moved: i64 = self
            .run(&self.defer_script, &self.keys(&delivery.envelope.queue), &args)
            .await?;
        debug!(job_id = %delivery.job_id(), deferred = moved > 0, "Job deferred");
        Ok(moved > 0)
    }

    async fn revoke(&self, queue: &str, job_id: &str) -> Result<bool> {
        let removed: i64 = self
            .run(&self.forget_script, &self.keys(queue), &[job_id.to_string()])
            .await?;
        debug!(job_id, queue, removed = removed > 0, "Job revoked");
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| AppError::Broker {
                message: format!("Redis ping failed: {}", e),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_orders_by_priority_first() {
        let now = Utc::now().timestamp_millis();
        assert!(rank(0, now + 60_000) < rank(3, now));
        assert!(rank(3, now) < rank(6, now - 60_000));
        assert!(rank(0, now) < rank(0, now + 1));
        // Scores stay exact as Redis doubles
        assert!(rank(9, now) < 1_i64 << 53);
    }
}
