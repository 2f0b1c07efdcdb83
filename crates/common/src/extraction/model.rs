//! Domain types for extraction tasks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of an extraction task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    /// Terminal for the current attempt
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Progress may only grow while the task is in one of these states
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl From<String> for TaskStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "retrying" => TaskStatus::Retrying,
            "succeeded" => TaskStatus::Succeeded,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document category, drives the field extraction rules
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentCategory {
    IdCard,
    TaxId,
    IncomeProof,
    AddressProof,
    #[serde(other)]
    Other,
}

impl DocumentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentCategory::IdCard => "id_card",
            DocumentCategory::TaxId => "tax_id",
            DocumentCategory::IncomeProof => "income_proof",
            DocumentCategory::AddressProof => "address_proof",
            DocumentCategory::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "id_card" | "rg" => DocumentCategory::IdCard,
            "tax_id" | "cpf" => DocumentCategory::TaxId,
            "income_proof" | "proof_income" => DocumentCategory::IncomeProof,
            "address_proof" => DocumentCategory::AddressProof,
            _ => DocumentCategory::Other,
        }
    }
}

impl fmt::Display for DocumentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused an attempt to be enqueued
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Upload,
    Manual,
    Automatic,
    Sweep,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Upload => "upload",
            Trigger::Manual => "manual",
            Trigger::Automatic => "automatic",
            Trigger::Sweep => "sweep",
        }
    }
}

/// Structured output of the field extractor
pub type ExtractedData = serde_json::Map<String, serde_json::Value>;

/// The single persisted extraction record for a document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractionTask {
    pub document_id: Uuid,
    pub status: TaskStatus,
    pub progress: i32,
    pub job_id: Option<String>,
    pub retry_count: i32,
    pub extracted_data: Option<ExtractedData>,
    pub confidence_score: Option<f64>,
    pub error_message: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub process_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExtractionTask {
    /// A fresh pending record
    pub fn new(document_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            document_id,
            status: TaskStatus::Pending,
            progress: 0,
            job_id: None,
            retry_count: 0,
            extracted_data: None,
            confidence_score: None,
            error_message: None,
            last_error_at: None,
            process_time_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Open a fresh attempt: new job, progress back to zero. History
    /// (retry count, last error) is kept.
    pub fn reopen(&mut self, job_id: String) {
        self.status = TaskStatus::Pending;
        self.progress = 0;
        self.job_id = Some(job_id);
        self.extracted_data = None;
        self.confidence_score = None;
    }

    pub fn mark_succeeded(&mut self, data: ExtractedData, confidence: f64, process_time_ms: i64) {
        self.status = TaskStatus::Succeeded;
        self.progress = 100;
        self.extracted_data = Some(data);
        self.confidence_score = Some(confidence.clamp(0.0, 1.0));
        self.error_message = None;
        self.process_time_ms = Some(process_time_ms);
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error_message = Some(reason.into());
        self.last_error_at = Some(Utc::now());
    }

    pub fn mark_retrying(&mut self, reason: impl Into<String>, job_id: String) {
        self.status = TaskStatus::Retrying;
        self.error_message = Some(reason.into());
        self.last_error_at = Some(Utc::now());
        self.job_id = Some(job_id);
    }

    /// Point-in-time view for status endpoints
    pub fn status_view(&self) -> StatusView {
        StatusView {
            document_id: self.document_id,
            status: self.status,
            progress: self.progress,
            retry_count: self.retry_count,
            complete: self.status == TaskStatus::Succeeded,
            error: self.error_message.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Answer to `get_status`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub document_id: Uuid,
    pub status: TaskStatus,
    pub progress: i32,
    pub retry_count: i32,
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Answer to `get_result`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub document_id: Uuid,
    pub extracted_data: ExtractedData,
    pub confidence_score: f64,
}

/// Answer to `request_retry`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryDecision {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RetryDecision {
    pub fn accepted(job_id: String) -> Self {
        Self {
            accepted: true,
            job_id: Some(job_id),
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            job_id: None,
            reason: Some(reason.into()),
        }
    }
}

/// Previously computed extraction for identical content
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedExtraction {
    pub category: DocumentCategory,
    pub content_hash: String,
    pub extracted_data: ExtractedData,
    pub confidence_score: f64,
    pub use_count: i32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Retrying,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::from(String::from(status)), status);
        }
        assert_eq!(TaskStatus::from("bogus".to_string()), TaskStatus::Pending);
    }

    #[test]
    fn test_category_aliases() {
        assert_eq!(DocumentCategory::parse("rg"), DocumentCategory::IdCard);
        assert_eq!(DocumentCategory::parse("proof_income"), DocumentCategory::IncomeProof);
        assert_eq!(DocumentCategory::parse("selfie"), DocumentCategory::Other);
        let parsed: DocumentCategory = serde_json::from_str("\"work_card\"").unwrap();
        assert_eq!(parsed, DocumentCategory::Other);
    }

    #[test]
    fn test_success_invariant() {
        let mut task = ExtractionTask::new(Uuid::new_v4());
        task.error_message = Some("earlier failure".into());
        task.mark_succeeded(ExtractedData::new(), 1.4, 12);
        assert_eq!(task.progress, 100);
        assert_eq!(task.confidence_score, Some(1.0));
        assert!(task.extracted_data.is_some());
        assert!(task.error_message.is_none());
    }

    #[test]
    fn test_reopen_keeps_history() {
        let mut task = ExtractionTask::new(Uuid::new_v4());
        task.retry_count = 2;
        task.progress = 40;
        task.mark_failed("provider down");
        task.reopen("job-2".into());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.error_message.as_deref(), Some("provider down"));
    }
}
