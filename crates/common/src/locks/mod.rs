//! Per-document advisory leases
//!
//! A worker holds the lease for a document while it runs an attempt, so a
//! duplicate delivery of the same document is skipped instead of executed
//! twice. Leases expire on their own if the holder dies.

use crate::errors::{AppError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Proof of holding a document's lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub document_id: Uuid,
    pub token: String,
}

impl Lease {
    fn new(document_id: Uuid) -> Self {
        Self {
            document_id,
            token: Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
pub trait DocumentLocks: Send + Sync {
    /// `None` when another holder has a live lease
    async fn try_acquire(&self, document_id: Uuid, ttl: Duration) -> Result<Option<Lease>>;

    /// Release only if `lease` is still the holder
    async fn release(&self, lease: &Lease) -> Result<()>;
}

const RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// `SET NX PX` leases with compare-and-delete release
pub struct RedisLocks {
    conn: ConnectionManager,
    key_prefix: String,
    release_script: Script,
}

impl RedisLocks {
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
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
            release_script: Script::new(RELEASE),
        })
    }

    fn key(&self, document_id: Uuid) -> String {
        format!("{}:lease:{}", self.key_prefix, document_id)
    }
}

#[async_trait]
impl DocumentLocks for RedisLocks {
    async fn try_acquire(&self, document_id: Uuid, ttl: Duration) -> Result<Option<Lease>> {
        let lease = Lease::new(document_id);
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.key(document_id))
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.map(|_| lease))
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release_script
            .key(self.key(lease.document_id))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Process-local leases
#[derive(Default)]
pub struct MemoryLocks {
    held: Mutex<HashMap<Uuid, (String, Instant)>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentLocks for MemoryLocks {
    async fn try_acquire(&self, document_id: Uuid, ttl: Duration) -> Result<Option<Lease>> {
        let now = Instant::now();
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((_, expires)) = held.get(&document_id) {
            if *expires > now {
                return Ok(None);
            }
        }
        let lease = Lease::new(document_id);
        held.insert(document_id, (lease.token.clone(), now + ttl));
        Ok(Some(lease))
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if held
            .get(&lease.document_id)
            .is_some_and(|(token, _)| *token == lease.token)
        {
            held.remove(&lease.document_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_fails_until_release() {
        let locks = MemoryLocks::new();
        let id = Uuid::new_v4();
        let ttl = Duration::from_secs(60);
        let lease = locks.try_acquire(id, ttl).await.unwrap().unwrap();
        assert!(locks.try_acquire(id, ttl).await.unwrap().is_none());
        locks.release(&lease).await.unwrap();
        assert!(locks.try_acquire(id, ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_release_does_not_steal() {
        let locks = MemoryLocks::new();
        let id = Uuid::new_v4();
        let stale = Lease::new(id);
        let live = locks.try_acquire(id, Duration::from_secs(60)).await.unwrap().unwrap();
        locks.release(&stale).await.unwrap();
        assert!(locks.try_acquire(id, Duration::from_secs(60)).await.unwrap().is_none());
        locks.release(&live).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_can_be_taken() {
        let locks = MemoryLocks::new();
        let id = Uuid::new_v4();
        let _lease = locks.try_acquire(id, Duration::from_secs(5)).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(locks.try_acquire(id, Duration::from_secs(5)).await.unwrap().is_some());
    }
}
