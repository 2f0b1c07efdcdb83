//! Process-wide service handles
//!
//! Built once at startup from [`AppConfig`], injected into the gateway, the
//! worker and the sweeps, and torn down explicitly on shutdown.

use crate::config::{AppConfig, Backend};
use crate::db::{DbPool, Repository};
use crate::errors::Result;
use crate::extraction::documents::{DocumentDirectory, FileStore, MemoryDocuments};
use crate::extraction::retry::RetryPolicy;
use crate::extraction::store::{CacheStore, MemoryStore, TaskStore};
use crate::locks::{DocumentLocks, MemoryLocks, RedisLocks};
use crate::notify::{BroadcastPublisher, Notifier, ProgressPublisher, RedisPublisher};
use crate::provider::{create_recognizer, TextRecognizer};
use crate::queue::{MemoryQueue, RedisQueue, TaskQueue};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Shared clients for one process
#[derive(Clone)]
pub struct Services {
    pub config: Arc<AppConfig>,
    pub tasks: Arc<dyn TaskStore>,
    pub cache: Arc<dyn CacheStore>,
    pub documents: Arc<dyn DocumentDirectory>,
    pub queue: Arc<dyn TaskQueue>,
    pub publisher: Arc<dyn ProgressPublisher>,
    pub notifier: Notifier,
    pub locks: Arc<dyn DocumentLocks>,
    pub recognizer: Arc<dyn TextRecognizer>,
    pub files: FileStore,
    pub policy: RetryPolicy,
    pub db: Option<DbPool>,
}

/// Connectivity of the backing services
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub database: bool,
    pub broker: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.database && self.broker
    }
}

impl Services {
    /// Build the handles selected by `queue.backend`
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        match config.queue.backend {
            Backend::External => Self::connect(config).await,
            Backend::Memory => Self::in_memory(config),
        }
    }

    /// PostgreSQL for records, Redis for queue, pub/sub and leases
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let pool = DbPool::new(&config.database).await?;
        let repository = Arc::new(Repository::new(pool.clone()));
        repository.ensure_schema().await?;

        let redis = &config.redis;
        let queue = RedisQueue::connect(
            &redis.url,
            &redis.key_prefix,
            config.queue.visibility_timeout(),
        )
        .await?;
        let publisher: Arc<dyn ProgressPublisher> =
            Arc::new(RedisPublisher::connect(&redis.url, &redis.key_prefix).await?);
        let locks = RedisLocks::connect(&redis.url, &redis.key_prefix).await?;

        info!("Connected to database and broker");

        Ok(Self {
            tasks: repository.clone(),
            cache: repository.clone(),
            documents: repository,
            queue: Arc::new(queue),
            notifier: Notifier::new(publisher.clone()),
            publisher,
            locks: Arc::new(locks),
            recognizer: create_recognizer(&config.extraction)?,
            files: FileStore::new(&config.extraction.storage_root),
            policy: RetryPolicy::from_config(&config.retry),
            db: Some(pool),
            config: Arc::new(config),
        })
    }

    /// Process-local structures only
    pub fn in_memory(config: AppConfig) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let publisher: Arc<dyn ProgressPublisher> = Arc::new(BroadcastPublisher::default());
        warn!("Using in-memory backends; state is lost on exit");

        Ok(Self {
            tasks: store.clone(),
            cache: store,
            documents: Arc::new(MemoryDocuments::new()),
            queue: Arc::new(MemoryQueue::new(config.queue.visibility_timeout())),
            notifier: Notifier::new(publisher.clone()),
            publisher,
            locks: Arc::new(MemoryLocks::new()),
            recognizer: create_recognizer(&config.extraction)?,
            files: FileStore::new(&config.extraction.storage_root),
            policy: RetryPolicy::from_config(&config.retry),
            db: None,
            config: Arc::new(config),
        })
    }

    /// Lease lifetime: longest possible attempt plus a margin
    pub fn lease_ttl(&self) -> Duration {
        self.config.extraction.hard_time_limit() + Duration::from_secs(30)
    }

    pub async fn health(&self) -> HealthReport {
        let database = match &self.db {
            Some(pool) => pool.ping().await.is_ok(),
            None => true,
        };
        let broker = self.queue.ping().await.is_ok();
        HealthReport { database, broker }
    }

    pub async fn shutdown(self) {
        if let Some(pool) = self.db {
            pool.close().await;
        }
        info!("Services shut down");
    }
}
