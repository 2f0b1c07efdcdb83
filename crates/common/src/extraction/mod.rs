//! Document extraction pipeline
//!
//! - [`model`]: task record, statuses and API views
//! - [`fields`]: category rules turning recognized text into fields
//! - [`retry`]: caps, backoff and queue priorities
//! - [`store`] / [`documents`]: persistence and document access contracts
//! - [`service`]: operations exposed to the gateway
//! - [`worker`]: the per-document attempt state machine
//! - [`sweeps`]: stuck-task and retention reconciliation
//! - [`registry`]: task names, routing and dispatch

pub mod documents;
pub mod fields;
pub mod model;
pub mod registry;
pub mod retry;
pub mod service;
pub mod store;
pub mod sweeps;
pub mod worker;

pub use model::{
    DocumentCategory, ExtractedData, ExtractionResult, ExtractionTask, RetryDecision, StatusView,
    TaskStatus, Trigger,
};
pub use registry::{Handled, TaskHandler, TaskRegistry};
pub use retry::{Priority, RetryPolicy};
pub use service::ExtractionService;
pub use sweeps::Sweeper;
pub use worker::{AttemptOutcome, ExtractionJob, OcrWorker};

#[cfg(test)]
pub(crate) mod testing {
    use super::documents::{DocumentHandle, MemoryDocuments};
    use super::model::DocumentCategory;
    use super::retry::RetryPolicy;
    use super::store::MemoryStore;
    use super::worker::{AttemptOutcome, ExtractionJob, OcrWorker};
    use crate::config::AppConfig;
    use crate::extraction::documents::FileStore;
    use crate::locks::MemoryLocks;
    use crate::notify::{BroadcastPublisher, Notifier, ProgressPublisher};
    use crate::provider::{SimulatedRecognizer, TextRecognizer};
    use crate::queue::{MemoryQueue, TaskQueue};
    use crate::runtime::Services;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    /// In-memory services with handles to the concrete backends
    pub struct Harness {
        pub services: Services,
        pub store: Arc<MemoryStore>,
        pub documents: Arc<MemoryDocuments>,
        pub queue: Arc<MemoryQueue>,
        pub publisher: Arc<BroadcastPublisher>,
        pub dir: tempfile::TempDir,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_recognizer(Arc::new(SimulatedRecognizer))
        }

        pub fn with_recognizer(recognizer: Arc<dyn TextRecognizer>) -> Self {
            Self::build(recognizer, AppConfig::default())
        }

        pub fn build(recognizer: Arc<dyn TextRecognizer>, mut config: AppConfig) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            config.extraction.storage_root = dir.path().display().to_string();

            let store = Arc::new(MemoryStore::new());
            let documents = Arc::new(MemoryDocuments::new());
            let queue = Arc::new(MemoryQueue::new(Duration::from_secs(360)));
            let publisher = Arc::new(BroadcastPublisher::default());
            let dyn_publisher: Arc<dyn ProgressPublisher> = publisher.clone();

            let services = Services {
                tasks: store.clone(),
                cache: store.clone(),
                documents: documents.clone(),
                queue: queue.clone(),
                notifier: Notifier::new(dyn_publisher.clone()),
                publisher: dyn_publisher,
                locks: Arc::new(MemoryLocks::new()),
                recognizer,
                files: FileStore::new(dir.path()),
                policy: RetryPolicy::immediate(&config.retry),
                db: None,
                config: Arc::new(config),
            };

            Self {
                services,
                store,
                documents,
                queue,
                publisher,
                dir,
            }
        }

        /// Register a document whose file holds `contents`
        pub fn add_document(&self, category: DocumentCategory, contents: &str) -> Uuid {
            let id = Uuid::new_v4();
            let file_ref = format!("{id}.txt");
            std::fs::write(self.dir.path().join(&file_ref), contents).expect("write document");
            self.documents.insert(DocumentHandle {
                id,
                category,
                file_ref,
            });
            id
        }

        /// Run every visible extraction job until the queue is empty. Deferred
        /// jobs go back to the queue.
        pub async fn drain(&self) -> Vec<AttemptOutcome> {
            let worker = OcrWorker::new(self.services.clone());
            let queue_name = self.services.config.queue.extraction_queue.clone();
            let mut outcomes = Vec::new();
            for _ in 0..50 {
                let Some(delivery) = self.queue.dequeue(&queue_name).await.expect("dequeue") else {
                    break;
                };
                let job: ExtractionJob = delivery.envelope.parse_payload().expect("payload");
                let outcome = worker
                    .process(delivery.job_id(), &job)
                    .await
                    .expect("process");
                match outcome {
                    AttemptOutcome::Deferred { delay } => {
                        self.queue.defer(&delivery, delay).await.expect("defer");
                    }
                    _ => self.queue.ack(&delivery).await.expect("ack"),
                }
                outcomes.push(outcome);
            }
            outcomes
        }
    }
}
