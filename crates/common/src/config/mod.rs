//! Configuration management for Intake services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Redis configuration (queue broker, pub/sub, leases)
    #[serde(default)]
    pub redis: RedisConfig,

    /// Queue routing and consumption
    #[serde(default)]
    pub queue: QueueConfig,

    /// Extraction pipeline settings
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Retry caps and backoff
    #[serde(default)]
    pub retry: RetryConfig,

    /// Reconciliation sweep schedule
    #[serde(default)]
    pub sweeps: SweepConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Requests per second across the API
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub rate_limit_enabled: bool,
}

/// Storage backend selection shared by the store, queue, pub/sub and leases
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// PostgreSQL + Redis
    External,
    /// Process-local structures, for development and tests
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Key prefix for namespacing
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Backend for store, queue, pub/sub and leases
    #[serde(default = "default_backend")]
    pub backend: Backend,

    /// Queue that receives extraction work
    #[serde(default = "default_extraction_queue")]
    pub extraction_queue: String,

    /// Queue that receives maintenance work
    #[serde(default = "default_maintenance_queue")]
    pub maintenance_queue: String,

    /// Seconds a delivered job stays invisible before redelivery
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// Idle poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Milliseconds before a job that found its document leased runs again
    #[serde(default = "default_lease_retry_delay")]
    pub lease_retry_delay_ms: u64,

    /// Concurrent consumers per worker process
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractionConfig {
    /// Text recognition provider: vision, simulated
    #[serde(default = "default_provider")]
    pub provider: String,

    /// API key for the recognition provider
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Per-call provider timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,

    /// Confidence above which the document is flagged as verified
    #[serde(default = "default_verification_threshold")]
    pub verification_threshold: f64,

    /// Root directory that document file references resolve against
    #[serde(default = "default_storage_root")]
    pub storage_root: String,

    /// Soft time limit in seconds
    #[serde(default = "default_soft_time_limit")]
    pub soft_time_limit_secs: u64,

    /// Hard time limit in seconds
    #[serde(default = "default_hard_time_limit")]
    pub hard_time_limit_secs: u64,

    /// Reuse results for identical content
    #[serde(default = "default_enabled")]
    pub cache_enabled: bool,

    /// Maximum number of cached results
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Attempts before a transient failure becomes permanent
    #[serde(default = "default_auto_max_attempts")]
    pub auto_max_attempts: i32,

    /// Cap for user-triggered retries
    #[serde(default = "default_manual_cap")]
    pub manual_cap: i32,

    /// Cap for sweep-driven rescues
    #[serde(default = "default_sweep_cap")]
    pub sweep_cap: i32,

    /// First backoff delay in seconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Maximum backoff delay in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Randomization factor applied to each delay
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SweepConfig {
    /// Stuck-task sweep interval in seconds
    #[serde(default = "default_stuck_interval")]
    pub stuck_interval_secs: u64,

    /// Age of `updated_at` after which an unfinished task counts as stuck
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Maximum rows handled per stuck sweep run
    #[serde(default = "default_stuck_batch")]
    pub stuck_batch_size: u64,

    /// Retention sweep interval in seconds
    #[serde(default = "default_retention_interval")]
    pub retention_interval_secs: u64,

    /// Days a succeeded task is kept
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_rate_limit() -> u32 { 50 }
fn default_burst() -> u32 { 100 }
fn default_enabled() -> bool { true }
fn default_database_url() -> String { "postgres://localhost/intake".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "intake".to_string() }
fn default_backend() -> Backend { Backend::Memory }
fn default_extraction_queue() -> String { "ocr".to_string() }
fn default_maintenance_queue() -> String { "default".to_string() }
fn default_visibility_timeout() -> u64 { 360 }
fn default_poll_interval() -> u64 { 500 }
fn default_lease_retry_delay() -> u64 { 5_000 }
fn default_concurrency() -> usize { 2 }
fn default_provider() -> String { "simulated".to_string() }
fn default_provider_timeout() -> u64 { 60 }
fn default_verification_threshold() -> f64 { 0.8 }
fn default_storage_root() -> String { "./media".to_string() }
fn default_soft_time_limit() -> u64 { 240 }
fn default_hard_time_limit() -> u64 { 300 }
fn default_cache_max_entries() -> u64 { 10_000 }
fn default_auto_max_attempts() -> i32 { 5 }
fn default_manual_cap() -> i32 { 5 }
fn default_sweep_cap() -> i32 { 3 }
fn default_initial_delay() -> u64 { 30 }
fn default_max_delay() -> u64 { 600 }
fn default_multiplier() -> f64 { 2.0 }
fn default_jitter() -> f64 { 0.2 }
fn default_stuck_interval() -> u64 { 900 }
fn default_stale_after() -> u64 { 900 }
fn default_stuck_batch() -> u64 { 200 }
fn default_retention_interval() -> u64 { 86_400 }
fn default_retention_days() -> i64 { 90 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "intake".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            rate_limit_enabled: default_enabled(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            read_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            extraction_queue: default_extraction_queue(),
            maintenance_queue: default_maintenance_queue(),
            visibility_timeout_secs: default_visibility_timeout(),
            poll_interval_ms: default_poll_interval(),
            lease_retry_delay_ms: default_lease_retry_delay(),
            concurrency: default_concurrency(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            api_base: None,
            provider_timeout_secs: default_provider_timeout(),
            verification_threshold: default_verification_threshold(),
            storage_root: default_storage_root(),
            soft_time_limit_secs: default_soft_time_limit(),
            hard_time_limit_secs: default_hard_time_limit(),
            cache_enabled: default_enabled(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            auto_max_attempts: default_auto_max_attempts(),
            manual_cap: default_manual_cap(),
            sweep_cap: default_sweep_cap(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            stuck_interval_secs: default_stuck_interval(),
            stale_after_secs: default_stale_after(),
            stuck_batch_size: default_stuck_batch(),
            retention_interval_secs: default_retention_interval(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let mut builder = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false));

        // Development runs sweep stuck work more aggressively
        if env == "development" {
            builder = builder.set_default("sweeps.stuck_interval_secs", 300)?;
        }

        let config = builder
            // e.g., APP__RETRY__AUTO_MAX_ATTEMPTS=3
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lease_retry_delay_ms)
    }
}

impl ExtractionConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_secs)
    }

    pub fn hard_time_limit(&self) -> Duration {
        Duration::from_secs(self.hard_time_limit_secs)
    }
}

impl SweepConfig {
    pub fn stuck_interval(&self) -> Duration {
        Duration::from_secs(self.stuck_interval_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            queue: QueueConfig::default(),
            extraction: ExtractionConfig::default(),
            retry: RetryConfig::default(),
            sweeps: SweepConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}
