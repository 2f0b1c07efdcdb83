//! Intake Common Library
//!
//! Shared code for the Intake gateway and worker including:
//! - Extraction task model, field rules and the OCR worker
//! - Database models and repository patterns
//! - Priority task queue, progress notifications and document leases
//! - Text recognition providers
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod config;
pub mod db;
pub mod errors;
pub mod extraction;
pub mod locks;
pub mod metrics;
pub mod notify;
pub mod provider;
pub mod queue;
pub mod runtime;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::Repository;
pub use errors::{AppError, Result};
pub use extraction::{ExtractionService, TaskRegistry};
pub use runtime::Services;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
