//! OCR task worker
//!
//! Runs one extraction attempt for one document. The attempt walks the
//! checkpoints 10, 20, 30, 40, 60, 70, 85, 95 and 100; each one raises the
//! stored progress and emits a live notification. Transient failures are
//! retried with backoff up to the automatic cap, permanent ones fail at once.

use crate::config::QueueConfig;
use crate::errors::{AppError, Result};
use crate::extraction::fields::extract_fields;
use crate::extraction::model::{ExtractedData, ExtractionTask, TaskStatus, Trigger};
use crate::extraction::registry::{route, Handled, TaskHandler, PROCESS_DOCUMENT};
use crate::extraction::retry::Priority;
use crate::metrics;
use crate::notify::ProgressEvent;
use crate::provider::ProviderError;
use crate::queue::TaskEnvelope;
use crate::runtime::Services;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Payload of an `extraction.process_document` job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub document_id: Uuid,
    pub trigger: Trigger,
    /// Retry count of the task when the job was enqueued
    #[serde(default)]
    pub retry_count: i32,
}

impl ExtractionJob {
    pub fn new(document_id: Uuid, trigger: Trigger, retry_count: i32) -> Self {
        Self {
            document_id,
            trigger,
            retry_count,
        }
    }

    /// Envelope routed to the extraction queue
    pub fn envelope(&self, queues: &QueueConfig, priority: Priority) -> Result<TaskEnvelope> {
        TaskEnvelope::new(
            PROCESS_DOCUMENT,
            route(PROCESS_DOCUMENT, queues),
            priority.value(),
            self,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Permanent,
    Transient,
}

/// Why an attempt did not produce a result
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("document {0} no longer exists")]
    DocumentMissing(Uuid),

    #[error("document file unreachable: {0}")]
    FileUnreachable(String),

    #[error("text recognition failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("soft time limit of {0:?} exceeded")]
    SoftTimeLimit(Duration),

    #[error("hard time limit of {0:?} exceeded")]
    HardTimeLimit(Duration),

    #[error("storage error: {0}")]
    Store(#[from] AppError),
}

impl ExtractionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExtractionError::DocumentMissing(_) | ExtractionError::FileUnreachable(_) => {
                FailureKind::Permanent
            }
            ExtractionError::Provider(e) if !e.is_transient() => FailureKind::Permanent,
            ExtractionError::Provider(_)
            | ExtractionError::SoftTimeLimit(_)
            | ExtractionError::HardTimeLimit(_)
            | ExtractionError::Store(_) => FailureKind::Transient,
        }
    }
}

type StepResult<T> = std::result::Result<T, ExtractionError>;

/// Deliveries that end without running an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The task already succeeded
    AlreadyComplete,
    /// This job already ran to a terminal failure
    Finished,
    /// A newer job owns the task
    Superseded,
    /// Another delivery holds the lease and this job no longer owns the task
    Duplicate,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AlreadyComplete => "already_complete",
            SkipReason::Finished => "finished",
            SkipReason::Superseded => "superseded",
            SkipReason::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded { confidence: f64, cached: bool },
    Retrying { job_id: String, delay: Duration },
    Failed { reason: String },
    /// The document is leased but this job owns the task; run it later
    Deferred { delay: Duration },
    Skipped(SkipReason),
}

struct Extracted {
    data: ExtractedData,
    confidence: f64,
    cached: bool,
}

/// Identity of the running attempt
struct Attempt<'a> {
    job_id: &'a str,
    document_id: Uuid,
    retry_count: i32,
    started: Instant,
}

pub struct OcrWorker {
    services: Services,
}

impl OcrWorker {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Handle one delivery of an extraction job
    #[instrument(
        skip(self, job),
        fields(document_id = %job.document_id, trigger = job.trigger.as_str())
    )]
    pub async fn process(&self, job_id: &str, job: &ExtractionJob) -> Result<AttemptOutcome> {
        let locks = &self.services.locks;
        let Some(lease) = locks
            .try_acquire(job.document_id, self.services.lease_ttl())
            .await?
        else {
            return self.contended(job_id, job).await;
        };

        let outcome = self.attempt(job_id, job).await;

        if let Err(e) = locks.release(&lease).await {
            warn!(error = %e, "Failed to release document lease");
        }
        outcome
    }

    /// Another delivery holds the lease. A job that still owns an unfinished
    /// task goes back to the queue; any other job is a duplicate.
    async fn contended(&self, job_id: &str, job: &ExtractionJob) -> Result<AttemptOutcome> {
        let owns_task = self
            .services
            .tasks
            .find(job.document_id)
            .await?
            .is_some_and(|task| task.job_id.as_deref() == Some(job_id) && task.status.is_active());

        if !owns_task {
            debug!("Another delivery holds the document lease");
            return Ok(self.skipped(SkipReason::Duplicate));
        }

        let delay = self.services.config.queue.lease_retry_delay();
        debug!(
            job_id,
            delay_ms = delay.as_millis() as u64,
            "Document leased by an older attempt, deferring"
        );
        Ok(AttemptOutcome::Deferred { delay })
    }

    async fn attempt(&self, job_id: &str, job: &ExtractionJob) -> Result<AttemptOutcome> {
        let s = &self.services;
        let (mut task, _) = s.tasks.get_or_create(job.document_id).await?;

        if task.status == TaskStatus::Succeeded {
            return Ok(self.skipped(SkipReason::AlreadyComplete));
        }
        let observed = task.job_id.clone();
        match task.job_id.as_deref() {
            Some(current) if current != job_id => {
                return Ok(self.skipped(SkipReason::Superseded));
            }
            Some(_) if task.status == TaskStatus::Failed => {
                return Ok(self.skipped(SkipReason::Finished));
            }
            Some(_) => {}
            None => task.job_id = Some(job_id.to_string()),
        }

        let attempt = Attempt {
            job_id,
            document_id: job.document_id,
            retry_count: task.retry_count,
            started: Instant::now(),
        };
        metrics::record_task_started(job.trigger.as_str());
        info!(job_id, retry_count = task.retry_count, "Extraction attempt started");

        task.status = TaskStatus::Running;
        task.progress = task.progress.max(10);
        let Some(task) = s.tasks.save_if_job(&task, observed.as_deref()).await? else {
            return Ok(self.skipped(SkipReason::Superseded));
        };
        s.notifier.notify_task(&task).await;

        let hard = s.config.extraction.hard_time_limit();
        let result = match tokio::time::timeout(hard, self.run_steps(&attempt)).await {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::HardTimeLimit(hard)),
        };

        // Checkpoints moved the stored progress; a manual retry may also
        // have handed the task to a newer job meanwhile
        let current = s.tasks.find(job.document_id).await?.unwrap_or(task);
        if current.job_id.as_deref() != Some(job_id) {
            return Ok(self.superseded(&attempt));
        }

        match result {
            Ok(extracted) => self.succeed(current, extracted, &attempt).await,
            Err(err) => self.fail(current, err, &attempt).await,
        }
    }

    async fn run_steps(&self, attempt: &Attempt<'_>) -> StepResult<Extracted> {
        let s = &self.services;
        let settings = &s.config.extraction;

        self.checkpoint(attempt, 20).await?;
        let document = s
            .documents
            .get_document(attempt.document_id)
            .await?
            .ok_or(ExtractionError::DocumentMissing(attempt.document_id))?;

        self.checkpoint(attempt, 30).await?;
        let file = s.files.load(&document.file_ref).await.map_err(|e| {
            ExtractionError::FileUnreachable(format!("{}: {}", document.file_ref, e))
        })?;

        self.checkpoint(attempt, 40).await?;
        let cached = if settings.cache_enabled {
            match s.cache.lookup(document.category, &file.content_hash).await {
                Ok(hit) => {
                    metrics::record_cache(hit.is_some(), document.category.as_str());
                    hit
                }
                Err(e) => {
                    warn!(error = %e, "Cache lookup failed, calling provider");
                    None
                }
            }
        } else {
            None
        };

        let extracted = match cached {
            Some(hit) => {
                debug!(use_count = hit.use_count, "Reusing cached extraction");
                self.checkpoint(attempt, 70).await?;
                Extracted {
                    data: hit.extracted_data,
                    confidence: hit.confidence_score,
                    cached: true,
                }
            }
            None => {
                let text = self.recognize(&file.bytes).await?;
                self.checkpoint(attempt, 60).await?;

                let fields = extract_fields(&text, document.category);
                self.checkpoint(attempt, 70).await?;

                if settings.cache_enabled {
                    if let Err(e) = s
                        .cache
                        .remember(
                            document.category,
                            &file.content_hash,
                            &fields.data,
                            fields.confidence,
                            settings.cache_max_entries,
                        )
                        .await
                    {
                        warn!(error = %e, "Failed to cache extraction");
                    }
                }
                Extracted {
                    data: fields.data,
                    confidence: fields.confidence,
                    cached: false,
                }
            }
        };

        self.checkpoint(attempt, 85).await?;
        Ok(extracted)
    }

    async fn recognize(&self, bytes: &[u8]) -> StepResult<String> {
        let s = &self.services;
        let timeout = s.config.extraction.provider_timeout();
        let started = Instant::now();

        let result = match tokio::time::timeout(timeout, s.recognizer.recognize_text(bytes)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        };

        metrics::record_provider_call(
            started.elapsed().as_secs_f64(),
            s.recognizer.name(),
            result.is_ok(),
        );
        Ok(result?)
    }

    /// Enforce the soft limit, then record and announce progress
    async fn checkpoint(&self, attempt: &Attempt<'_>, progress: i32) -> StepResult<()> {
        let soft = self.services.config.extraction.soft_time_limit();
        if attempt.started.elapsed() > soft {
            return Err(ExtractionError::SoftTimeLimit(soft));
        }
        self.announce(attempt, progress).await;
        Ok(())
    }

    async fn announce(&self, attempt: &Attempt<'_>, progress: i32) {
        let s = &self.services;
        if let Err(e) = s
            .tasks
            .advance(attempt.document_id, attempt.job_id, progress, TaskStatus::Running)
            .await
        {
            warn!(progress, error = %e, "Failed to record progress");
        }
        s.notifier
            .notify(ProgressEvent {
                document_id: attempt.document_id,
                complete: false,
                progress,
                status: TaskStatus::Running,
                message: None,
                retry_count: attempt.retry_count,
            })
            .await;
    }

    async fn succeed(
        &self,
        mut task: ExtractionTask,
        extracted: Extracted,
        attempt: &Attempt<'_>,
    ) -> Result<AttemptOutcome> {
        let s = &self.services;
        self.announce(attempt, 95).await;

        let elapsed = attempt.started.elapsed();
        task.mark_succeeded(extracted.data, extracted.confidence, elapsed.as_millis() as i64);
        let Some(task) = s.tasks.save_if_job(&task, Some(attempt.job_id)).await? else {
            return Ok(self.superseded(attempt));
        };
        let confidence = task.confidence_score.unwrap_or_default();

        metrics::record_task_finished(TaskStatus::Succeeded.as_str(), elapsed.as_secs_f64());
        info!(
            confidence,
            cached = extracted.cached,
            process_time_ms = elapsed.as_millis() as u64,
            "Extraction succeeded"
        );

        if confidence > s.config.extraction.verification_threshold {
            if let Err(e) = s.documents.set_verification_flag(task.document_id, true).await {
                warn!(error = %e, "Failed to set verification flag");
            }
        }

        s.notifier.notify_task(&task).await;
        Ok(AttemptOutcome::Succeeded {
            confidence,
            cached: extracted.cached,
        })
    }

    async fn fail(
        &self,
        mut task: ExtractionTask,
        err: ExtractionError,
        attempt: &Attempt<'_>,
    ) -> Result<AttemptOutcome> {
        let s = &self.services;
        let reason = err.to_string();

        match err.kind() {
            FailureKind::Permanent => task.mark_failed(&reason),
            FailureKind::Transient => {
                if task.retry_count < s.policy.auto_max_attempts {
                    task.retry_count += 1;
                }
                if s.policy.should_retry_automatically(task.retry_count) {
                    return self.schedule_retry(task, reason, attempt).await;
                }
                task.mark_failed(format!("{reason}; retries exhausted"));
            }
        }

        let Some(task) = s.tasks.save_if_job(&task, Some(attempt.job_id)).await? else {
            return Ok(self.superseded(attempt));
        };
        metrics::record_task_finished(
            TaskStatus::Failed.as_str(),
            attempt.started.elapsed().as_secs_f64(),
        );
        warn!(error = %reason, retry_count = task.retry_count, "Extraction failed");

        s.notifier.notify_task(&task).await;
        Ok(AttemptOutcome::Failed { reason })
    }

    async fn schedule_retry(
        &self,
        mut task: ExtractionTask,
        reason: String,
        attempt: &Attempt<'_>,
    ) -> Result<AttemptOutcome> {
        let s = &self.services;
        let delay = s.policy.delay_for(task.retry_count);
        let next = ExtractionJob::new(task.document_id, Trigger::Automatic, task.retry_count);
        let envelope = next.envelope(&s.config.queue, Priority::for_trigger(Trigger::Automatic))?;
        let job_id = envelope.job_id.clone();

        task.mark_retrying(&reason, job_id.clone());
        let Some(task) = s.tasks.save_if_job(&task, Some(attempt.job_id)).await? else {
            return Ok(self.superseded(attempt));
        };

        if let Err(e) = s.queue.enqueue(envelope, delay).await {
            // Left in `retrying`; the stuck sweep picks it up
            error!(error = %e, "Failed to enqueue automatic retry");
        }

        metrics::record_task_retried(Trigger::Automatic.as_str());
        info!(
            error = %reason,
            retry_count = task.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Extraction scheduled for automatic retry"
        );

        s.notifier.notify_task(&task).await;
        Ok(AttemptOutcome::Retrying { job_id, delay })
    }

    /// A newer job took the task while this attempt ran
    fn superseded(&self, attempt: &Attempt<'_>) -> AttemptOutcome {
        info!(job_id = attempt.job_id, "Attempt superseded while running, discarding outcome");
        self.skipped(SkipReason::Superseded)
    }

    fn skipped(&self, reason: SkipReason) -> AttemptOutcome {
        metrics::record_delivery_skipped(reason.as_str());
        debug!(reason = reason.as_str(), "Delivery skipped");
        AttemptOutcome::Skipped(reason)
    }
}

#[async_trait]
impl TaskHandler for OcrWorker {
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<Handled> {
        let job: ExtractionJob = envelope.parse_payload()?;
        let outcome = self.process(&envelope.job_id, &job).await?;
        debug!(job_id = %envelope.job_id, ?outcome, "Extraction job handled");
        match outcome {
            AttemptOutcome::Deferred { delay } => Ok(Handled::Defer(delay)),
            _ => Ok(Handled::Done),
        }
    }
}
