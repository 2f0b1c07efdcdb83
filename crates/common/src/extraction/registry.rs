//! Task names, queue routing and handler dispatch

use crate::config::QueueConfig;
use crate::errors::{AppError, Result};
use crate::extraction::sweeps::Sweeper;
use crate::extraction::worker::OcrWorker;
use crate::queue::TaskEnvelope;
use crate::runtime::Services;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const PROCESS_DOCUMENT: &str = "extraction.process_document";
pub const SWEEP_STUCK: &str = "maintenance.sweep_stuck";
pub const PURGE_RESULTS: &str = "maintenance.purge_results";

/// Queue a task is routed to
pub fn route<'a>(task: &str, queues: &'a QueueConfig) -> &'a str {
    if task.starts_with("extraction.") {
        &queues.extraction_queue
    } else {
        &queues.maintenance_queue
    }
}

/// How a handled job leaves the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Finished with; ack it
    Done,
    /// Not runnable yet; deliver it again after the delay
    Defer(Duration),
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<Handled>;
}

/// Name-to-handler table built at startup
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extraction and maintenance handlers over `services`
    pub fn standard(services: &Services) -> Self {
        let sweeper = Arc::new(Sweeper::new(services.clone()));
        let mut registry = Self::new();
        registry.register(PROCESS_DOCUMENT, Arc::new(OcrWorker::new(services.clone())));
        registry.register(SWEEP_STUCK, sweeper.clone());
        registry.register(PURGE_RESULTS, sweeper);
        registry
    }

    pub fn register(&mut self, task: &str, handler: Arc<dyn TaskHandler>) {
        info!(task, "Registered task handler");
        self.handlers.insert(task.to_string(), handler);
    }

    pub fn is_registered(&self, task: &str) -> bool {
        self.handlers.contains_key(task)
    }

    /// Distinct queues the registered tasks route to
    pub fn queues(&self, config: &QueueConfig) -> Vec<String> {
        let mut queues: Vec<String> = self
            .handlers
            .keys()
            .map(|task| route(task, config).to_string())
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }

    pub async fn dispatch(&self, envelope: &TaskEnvelope) -> Result<Handled> {
        let handler = self
            .handlers
            .get(&envelope.task)
            .ok_or_else(|| AppError::QueueError {
                message: format!("No handler registered for task {}", envelope.task),
            })?;
        handler.handle(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::testing::Harness;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl TaskHandler for Counter {
        async fn handle(&self, _: &TaskEnvelope) -> Result<Handled> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Handled::Done)
        }
    }

    #[test]
    fn test_routing_table() {
        let queues = QueueConfig::default();
        assert_eq!(route(PROCESS_DOCUMENT, &queues), "ocr");
        assert_eq!(route(SWEEP_STUCK, &queues), "default");
        assert_eq!(route(PURGE_RESULTS, &queues), "default");
    }

    #[tokio::test]
    async fn test_dispatch_by_name() {
        let counter = Arc::new(Counter::default());
        let mut registry = TaskRegistry::new();
        registry.register("maintenance.count", counter.clone());

        let envelope = TaskEnvelope::new("maintenance.count", "default", 0, &()).unwrap();
        assert_eq!(registry.dispatch(&envelope).await.unwrap(), Handled::Done);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        let unknown = TaskEnvelope::new("maintenance.unknown", "default", 0, &()).unwrap();
        assert!(matches!(
            registry.dispatch(&unknown).await,
            Err(AppError::QueueError { .. })
        ));
    }

    #[test]
    fn test_standard_registry_covers_both_queues() {
        let harness = Harness::new();
        let registry = TaskRegistry::standard(&harness.services);
        assert!(registry.is_registered(PROCESS_DOCUMENT));
        assert!(registry.is_registered(SWEEP_STUCK));
        assert_eq!(
            registry.queues(&harness.services.config.queue),
            vec!["default".to_string(), "ocr".to_string()]
        );
    }
}
