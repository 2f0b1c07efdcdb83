//! Reconciliation sweeps
//!
//! The stuck sweep looks at unfinished tasks whose `updated_at` went stale:
//! it deletes rows whose document disappeared, re-enqueues the rest at sweep
//! priority while under the sweep cap, and fails them once the cap is hit.
//! The retention sweep purges old succeeded rows.

use crate::errors::{AppError, Result};
use crate::extraction::model::{TaskStatus, Trigger};
use crate::extraction::registry::{Handled, TaskHandler, PURGE_RESULTS, SWEEP_STUCK};
use crate::extraction::retry::Priority;
use crate::extraction::worker::ExtractionJob;
use crate::metrics;
use crate::notify::ProgressEvent;
use crate::queue::TaskEnvelope;
use crate::runtime::Services;
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Counts from one stuck sweep run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub rescued: usize,
    pub failed: usize,
    pub orphaned: usize,
    pub skipped: usize,
}

pub struct Sweeper {
    services: Services,
}

impl Sweeper {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    #[instrument(skip(self))]
    pub async fn sweep_stuck(&self) -> Result<SweepReport> {
        let s = &self.services;
        let before = Utc::now() - s.config.sweeps.stale_after();
        let stale = s
            .tasks
            .find_stale(before, s.config.sweeps.stuck_batch_size)
            .await?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };

        for mut task in stale {
            let document_id = task.document_id;
            let observed = task.job_id.clone();

            if s.documents.get_document(document_id).await?.is_none() {
                s.tasks.delete(document_id).await?;
                info!(document_id = %document_id, "Deleted task of removed document");
                report.orphaned += 1;
                continue;
            }

            if task.retry_count < s.policy.sweep_cap {
                if let Some(previous) = task.job_id.as_deref() {
                    if let Err(e) = s.queue.revoke(&s.config.queue.extraction_queue, previous).await {
                        warn!(document_id = %document_id, error = %e, "Failed to revoke stuck job");
                    }
                }

                task.retry_count += 1;
                let job = ExtractionJob::new(document_id, Trigger::Sweep, task.retry_count);
                let envelope = job.envelope(&s.config.queue, Priority::Sweep)?;
                task.reopen(envelope.job_id.clone());
                let Some(task) = s.tasks.save_if_job(&task, observed.as_deref()).await? else {
                    debug!(document_id = %document_id, "Stuck task restarted meanwhile");
                    report.skipped += 1;
                    continue;
                };
                s.queue.enqueue(envelope, Duration::ZERO).await?;

                info!(
                    document_id = %document_id,
                    retry_count = task.retry_count,
                    "Re-enqueued stuck task"
                );
                s.notifier.notify_task(&task).await;
                report.rescued += 1;
            } else if task.status != TaskStatus::Failed {
                task.mark_failed("retries exhausted");
                let Some(task) = s.tasks.save_if_job(&task, observed.as_deref()).await? else {
                    debug!(document_id = %document_id, "Stuck task restarted meanwhile");
                    report.skipped += 1;
                    continue;
                };

                warn!(
                    document_id = %document_id,
                    retry_count = task.retry_count,
                    "Failed stuck task at sweep cap"
                );
                s.notifier
                    .notify(ProgressEvent {
                        progress: 0,
                        ..ProgressEvent::from_task(&task)
                    })
                    .await;
                report.failed += 1;
            } else {
                debug!(document_id = %document_id, "Stuck task already failed at cap");
                report.skipped += 1;
            }
        }

        metrics::record_sweep("rescued", report.rescued as u64);
        metrics::record_sweep("failed", report.failed as u64);
        metrics::record_sweep("orphaned", report.orphaned as u64);
        info!(?report, "Stuck sweep finished");
        Ok(report)
    }

    /// Delete succeeded tasks older than the retention window
    #[instrument(skip(self))]
    pub async fn purge_results(&self) -> Result<u64> {
        let before = Utc::now() - self.services.config.sweeps.retention_window();
        let purged = self.services.tasks.purge_succeeded(before).await?;

        metrics::record_sweep("purged", purged);
        info!(purged, "Retention sweep finished");
        Ok(purged)
    }
}

#[async_trait]
impl TaskHandler for Sweeper {
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<Handled> {
        match envelope.task.as_str() {
            SWEEP_STUCK => self.sweep_stuck().await.map(|_| Handled::Done),
            PURGE_RESULTS => self.purge_results().await.map(|_| Handled::Done),
            other => Err(AppError::QueueError {
                message: format!("Sweeper cannot handle task {other}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::model::{DocumentCategory, ExtractedData, ExtractionTask};
    use crate::extraction::store::TaskStore;
    use crate::extraction::testing::Harness;
    use crate::notify::{topic, ChannelMessage};
    use futures::StreamExt;
    use uuid::Uuid;

    fn long_ago() -> chrono::DateTime<Utc> {
        Utc::now() - chrono::Duration::days(120)
    }

    async fn stale_task(harness: &Harness, id: Uuid, status: TaskStatus, retry_count: i32) {
        let mut task = ExtractionTask::new(id);
        task.job_id = Some(format!("job-{retry_count}"));
        task.retry_count = retry_count;
        task.status = status;
        task.progress = 40;
        harness.store.save(&task).await.unwrap();
        harness.store.backdate(id, long_ago());
    }

    #[tokio::test]
    async fn test_orphaned_task_is_deleted_silently() {
        let harness = Harness::new();
        let id = Uuid::new_v4();
        stale_task(&harness, id, TaskStatus::Running, 0).await;
        let mut stream = harness.services.publisher.subscribe(&topic(id)).await.unwrap();

        let report = Sweeper::new(harness.services.clone()).sweep_stuck().await.unwrap();
        assert_eq!(report.orphaned, 1);
        assert!(harness.store.find(id).await.unwrap().is_none());

        let next = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(next.is_err(), "no notification expected");
    }

    #[tokio::test]
    async fn test_stuck_task_under_cap_is_rescued() {
        let harness = Harness::new();
        let id = harness.add_document(DocumentCategory::TaxId, "CPF 123.456.789-00");
        stale_task(&harness, id, TaskStatus::Running, 1).await;

        let report = Sweeper::new(harness.services.clone()).sweep_stuck().await.unwrap();
        assert_eq!(report.rescued, 1);

        let task = harness.store.find(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.retry_count, 2);

        let pending = harness.queue.pending("ocr");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].priority, Priority::Sweep.value());
        assert_eq!(task.job_id.as_deref(), Some(pending[0].job_id.as_str()));

        // The rescued job runs to completion
        harness.drain().await;
        let task = harness.store.find(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_stuck_task_at_cap_is_failed_with_notification() {
        let harness = Harness::new();
        let id = harness.add_document(DocumentCategory::IdCard, "RG 12.345.678-9");
        stale_task(&harness, id, TaskStatus::Running, 3).await;
        let mut stream = harness.services.publisher.subscribe(&topic(id)).await.unwrap();

        let report = Sweeper::new(harness.services.clone()).sweep_stuck().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(harness.queue.pending("ocr").is_empty());

        let task = harness.store.find(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 3);
        assert_eq!(task.error_message.as_deref(), Some("retries exhausted"));

        match stream.next().await {
            Some(ChannelMessage::Status(event)) => {
                assert_eq!(event.status, TaskStatus::Failed);
                assert_eq!(event.progress, 0);
                assert!(!event.complete);
            }
            other => panic!("unexpected message {other:?}"),
        }

        // Already failed at the cap: left alone on the next run
        harness.store.backdate(id, long_ago());
        let report = Sweeper::new(harness.services.clone()).sweep_stuck().await.unwrap();
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_fresh_tasks_are_not_swept() {
        let harness = Harness::new();
        let id = harness.add_document(DocumentCategory::TaxId, "CPF 123.456.789-00");
        let mut task = ExtractionTask::new(id);
        task.status = TaskStatus::Running;
        harness.store.save(&task).await.unwrap();

        let report = Sweeper::new(harness.services.clone()).sweep_stuck().await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_retention_purges_only_old_succeeded() {
        let harness = Harness::new();
        let (old_ok, old_failed, recent_ok) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        for id in [old_ok, recent_ok] {
            let mut task = ExtractionTask::new(id);
            task.mark_succeeded(ExtractedData::new(), 0.7, 10);
            harness.store.save(&task).await.unwrap();
        }
        let mut failed = ExtractionTask::new(old_failed);
        failed.mark_failed("provider down");
        harness.store.save(&failed).await.unwrap();

        harness.store.backdate(old_ok, long_ago());
        harness.store.backdate(old_failed, long_ago());

        let purged = Sweeper::new(harness.services.clone()).purge_results().await.unwrap();
        assert_eq!(purged, 1);
        assert!(harness.store.find(old_ok).await.unwrap().is_none());
        assert!(harness.store.find(old_failed).await.unwrap().is_some());
        assert!(harness.store.find(recent_ok).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_handler_dispatches_by_task_name() {
        let harness = Harness::new();
        let sweeper = Sweeper::new(harness.services.clone());
        let envelope = TaskEnvelope::new(PURGE_RESULTS, "default", 6, &()).unwrap();
        sweeper.handle(&envelope).await.unwrap();

        let wrong = TaskEnvelope::new("extraction.process_document", "ocr", 0, &()).unwrap();
        assert!(sweeper.handle(&wrong).await.is_err());
    }
}
