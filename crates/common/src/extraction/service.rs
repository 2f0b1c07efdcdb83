//! Extraction operations exposed to the gateway

use crate::errors::{AppError, Result};
use crate::extraction::model::{
    ExtractionResult, ExtractionTask, RetryDecision, StatusView, TaskStatus, Trigger,
};
use crate::extraction::retry::Priority;
use crate::extraction::worker::ExtractionJob;
use crate::metrics;
use crate::runtime::Services;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Enqueue, inspect and retry extractions
#[derive(Clone)]
pub struct ExtractionService {
    services: Services,
}

impl ExtractionService {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Start extraction for a document. A document that already has a job
    /// keeps it and its id is returned.
    #[instrument(skip(self))]
    pub async fn enqueue_extraction(&self, document_id: Uuid, priority: Priority) -> Result<String> {
        self.require_document(document_id).await?;

        let (task, _) = self.services.tasks.get_or_create(document_id).await?;
        if let Some(job_id) = task.job_id.clone() {
            info!(job_id = %job_id, status = %task.status, "Extraction already enqueued");
            return Ok(job_id);
        }

        let trigger = match priority {
            Priority::Manual => Trigger::Manual,
            Priority::Sweep => Trigger::Sweep,
            Priority::Initial => Trigger::Upload,
        };
        match self.dispatch(task, trigger, priority).await? {
            Some(job_id) => Ok(job_id),
            None => {
                let job_id = self.current_job(document_id).await?;
                info!(job_id = %job_id, "Extraction enqueued concurrently");
                Ok(job_id)
            }
        }
    }

    pub async fn get_status(&self, document_id: Uuid) -> Result<StatusView> {
        self.services
            .tasks
            .find(document_id)
            .await?
            .map(|task| task.status_view())
            .ok_or_else(|| AppError::TaskNotFound {
                id: document_id.to_string(),
            })
    }

    /// Stored result of a succeeded task
    pub async fn get_result(&self, document_id: Uuid) -> Result<ExtractionResult> {
        let not_found = || AppError::ResultNotFound {
            id: document_id.to_string(),
        };

        let task = self
            .services
            .tasks
            .find(document_id)
            .await?
            .ok_or_else(not_found)?;
        if task.status != TaskStatus::Succeeded {
            return Err(not_found());
        }

        Ok(ExtractionResult {
            document_id,
            extracted_data: task.extracted_data.ok_or_else(not_found)?,
            confidence_score: task.confidence_score.unwrap_or_default(),
        })
    }

    /// User-triggered retry, bounded by the manual cap
    #[instrument(skip(self))]
    pub async fn request_retry(&self, document_id: Uuid) -> Result<RetryDecision> {
        self.require_document(document_id).await?;
        let s = &self.services;

        let (mut task, created) = s.tasks.get_or_create(document_id).await?;
        if created || task.job_id.is_none() {
            let job_id = match self.dispatch(task, Trigger::Manual, Priority::Manual).await? {
                Some(job_id) => job_id,
                None => self.current_job(document_id).await?,
            };
            return Ok(RetryDecision::accepted(job_id));
        }

        if task.status == TaskStatus::Succeeded {
            return Ok(RetryDecision::rejected("extraction already succeeded"));
        }
        if task.retry_count >= s.policy.manual_cap {
            info!(retry_count = task.retry_count, "Manual retry rejected at cap");
            return Ok(RetryDecision::rejected("retry limit reached"));
        }

        if let Some(previous) = task.job_id.as_deref() {
            match s.queue.revoke(&s.config.queue.extraction_queue, previous).await {
                Ok(revoked) => info!(job_id = previous, revoked, "Revoked previous job"),
                Err(e) => warn!(job_id = previous, error = %e, "Failed to revoke previous job"),
            }
        }

        task.retry_count += 1;
        match self.dispatch(task, Trigger::Manual, Priority::Manual).await? {
            Some(job_id) => Ok(RetryDecision::accepted(job_id)),
            None => Ok(RetryDecision::rejected("extraction restarted concurrently")),
        }
    }

    /// Current status, enqueueing an initial extraction when none exists yet
    pub async fn ensure_started(&self, document_id: Uuid) -> Result<StatusView> {
        self.require_document(document_id).await?;

        if self.services.tasks.find(document_id).await?.is_none() {
            info!(document_id = %document_id, "No extraction yet, starting one");
            self.enqueue_extraction(document_id, Priority::Initial).await?;
        }
        self.get_status(document_id).await
    }

    async fn current_job(&self, document_id: Uuid) -> Result<String> {
        self.services
            .tasks
            .find(document_id)
            .await?
            .and_then(|task| task.job_id)
            .ok_or_else(|| AppError::TaskNotFound {
                id: document_id.to_string(),
            })
    }

    async fn require_document(&self, document_id: Uuid) -> Result<()> {
        match self.services.documents.get_document(document_id).await? {
            Some(_) => Ok(()),
            None => Err(AppError::DocumentNotFound {
                id: document_id.to_string(),
            }),
        }
    }

    /// Reopen the task under a new job and enqueue it. `None` when the task
    /// changed owner since it was read; nothing is enqueued then.
    async fn dispatch(
        &self,
        mut task: ExtractionTask,
        trigger: Trigger,
        priority: Priority,
    ) -> Result<Option<String>> {
        let s = &self.services;
        let job = ExtractionJob::new(task.document_id, trigger, task.retry_count);
        let envelope = job.envelope(&s.config.queue, priority)?;
        let job_id = envelope.job_id.clone();

        let observed = task.job_id.take();
        task.reopen(job_id.clone());
        let Some(task) = s.tasks.save_if_job(&task, observed.as_deref()).await? else {
            return Ok(None);
        };
        s.queue.enqueue(envelope, std::time::Duration::ZERO).await?;

        match trigger {
            Trigger::Upload => metrics::record_task_started(trigger.as_str()),
            _ => metrics::record_task_retried(trigger.as_str()),
        }
        info!(
            document_id = %task.document_id,
            job_id = %job_id,
            trigger = trigger.as_str(),
            retry_count = task.retry_count,
            "Extraction enqueued"
        );

        s.notifier.notify_task(&task).await;
        Ok(Some(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::model::DocumentCategory;
    use crate::extraction::store::TaskStore;
    use crate::extraction::testing::Harness;
    use crate::extraction::worker::AttemptOutcome;
    use crate::provider::{ProviderError, TextRecognizer};
    use crate::queue::TaskQueue;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Echoes the file as text, counting calls
    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl TextRecognizer for Counting {
        async fn recognize_text(&self, bytes: &[u8]) -> std::result::Result<String, ProviderError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_deduplicated() {
        let harness = Harness::new();
        let id = harness.add_document(DocumentCategory::TaxId, "CPF 123.456.789-00");
        let service = ExtractionService::new(harness.services.clone());

        let first = service.enqueue_extraction(id, Priority::Initial).await.unwrap();
        let second = service.enqueue_extraction(id, Priority::Initial).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(harness.queue.pending("ocr").len(), 1);
        assert_eq!(harness.store.task_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_enqueues_run_one_extraction() {
        let recognizer = Arc::new(Counting::default());
        let harness = Harness::with_recognizer(recognizer.clone());
        let id = harness.add_document(DocumentCategory::TaxId, "NOME\nFulano\nCPF 123.456.789-00");
        let service = ExtractionService::new(harness.services.clone());

        let spawn_enqueue = || {
            let service = service.clone();
            tokio::spawn(async move { service.enqueue_extraction(id, Priority::Initial).await })
        };
        let (first, second) = tokio::join!(spawn_enqueue(), spawn_enqueue());
        let first = first.unwrap().unwrap();
        let second = second.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(harness.queue.pending("ocr").len(), 1);

        let outcomes = harness.drain().await;
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, AttemptOutcome::Succeeded { .. }))
                .count(),
            1
        );
        assert_eq!(recognizer.0.load(Ordering::SeqCst), 1);
        assert!(harness.documents.flag_writes().len() <= 1);
        assert_eq!(harness.store.task_count(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_unknown_document() {
        let harness = Harness::new();
        let service = ExtractionService::new(harness.services.clone());
        let err = service
            .enqueue_extraction(Uuid::new_v4(), Priority::Initial)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DocumentNotFound { .. }));
        assert_eq!(harness.store.task_count(), 0);
    }

    #[tokio::test]
    async fn test_status_and_result_before_completion() {
        let harness = Harness::new();
        let id = harness.add_document(DocumentCategory::IncomeProof, "R$ 10,00");
        let service = ExtractionService::new(harness.services.clone());

        assert!(matches!(
            service.get_status(id).await,
            Err(AppError::TaskNotFound { .. })
        ));

        service.enqueue_extraction(id, Priority::Initial).await.unwrap();
        let status = service.get_status(id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Pending);
        assert_eq!(status.progress, 0);
        assert!(!status.complete);

        assert!(matches!(
            service.get_result(id).await,
            Err(AppError::ResultNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_result_after_success() {
        let harness = Harness::new();
        let id = harness.add_document(DocumentCategory::TaxId, "NOME\nFulano\nCPF 123.456.789-00");
        let service = ExtractionService::new(harness.services.clone());
        service.enqueue_extraction(id, Priority::Initial).await.unwrap();
        harness.drain().await;

        let result = service.get_result(id).await.unwrap();
        assert_eq!(result.extracted_data["tax_id"], "123.456.789-00");
        assert!((0.0..=1.0).contains(&result.confidence_score));
        assert!(service.get_status(id).await.unwrap().complete);
    }

    #[tokio::test]
    async fn test_manual_retry_rejected_at_cap() {
        let harness = Harness::new();
        let id = harness.add_document(DocumentCategory::IdCard, "RG 12.345.678-9");
        let mut task = ExtractionTask::new(id);
        task.job_id = Some("job-5".into());
        task.retry_count = 5;
        task.mark_failed("provider timed out; retries exhausted");
        harness.store.save(&task).await.unwrap();

        let service = ExtractionService::new(harness.services.clone());
        let decision = service.request_retry(id).await.unwrap();
        assert!(!decision.accepted);
        assert_eq!(decision.reason.as_deref(), Some("retry limit reached"));
        assert!(harness.queue.pending("ocr").is_empty());
        assert_eq!(harness.store.find(id).await.unwrap().unwrap().retry_count, 5);
    }

    #[tokio::test]
    async fn test_manual_retry_reopens_failed_task() {
        let harness = Harness::new();
        let id = harness.add_document(DocumentCategory::IdCard, "RG 12.345.678-9");
        let service = ExtractionService::new(harness.services.clone());
        let first = service.enqueue_extraction(id, Priority::Initial).await.unwrap();

        let mut task = harness.store.find(id).await.unwrap().unwrap();
        task.retry_count = 2;
        task.progress = 40;
        task.mark_failed("file unreadable");
        harness.store.save(&task).await.unwrap();

        let decision = service.request_retry(id).await.unwrap();
        assert!(decision.accepted);
        let job_id = decision.job_id.unwrap();
        assert_ne!(job_id, first);

        let task = harness.store.find(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.retry_count, 3);
        assert_eq!(task.job_id.as_deref(), Some(job_id.as_str()));
        assert_eq!(task.error_message.as_deref(), Some("file unreadable"));

        // The first job was revoked, only the retry is queued
        let pending = harness.queue.pending("ocr");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, job_id);
        assert_eq!(pending[0].priority, Priority::Manual.value());
    }

    #[tokio::test]
    async fn test_retry_rejected_after_success() {
        let harness = Harness::new();
        let id = harness.add_document(DocumentCategory::TaxId, "CPF 123.456.789-00");
        let service = ExtractionService::new(harness.services.clone());
        service.enqueue_extraction(id, Priority::Initial).await.unwrap();
        harness.drain().await;

        let decision = service.request_retry(id).await.unwrap();
        assert!(!decision.accepted);
        assert_eq!(decision.reason.as_deref(), Some("extraction already succeeded"));
    }

    #[tokio::test]
    async fn test_retry_for_nonexistent_document() {
        let harness = Harness::new();
        let service = ExtractionService::new(harness.services.clone());
        let err = service.request_retry(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::DocumentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_ensure_started_enqueues_once() {
        let harness = Harness::new();
        let id = harness.add_document(DocumentCategory::AddressProof, "Rua Exemplo, 123");
        let service = ExtractionService::new(harness.services.clone());

        let view = service.ensure_started(id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Pending);
        service.ensure_started(id).await.unwrap();
        assert_eq!(harness.queue.pending("ocr").len(), 1);

        let delivery = harness.queue.dequeue("ocr").await.unwrap().unwrap();
        let job: ExtractionJob = delivery.envelope.parse_payload().unwrap();
        assert_eq!(job.trigger, Trigger::Upload);
    }
}
