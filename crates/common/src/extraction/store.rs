//! Result store contracts and the in-process implementation
//!
//! All writes are single-row and keyed by `document_id`. The store owns the
//! `updated_at` stamp so that sweep staleness reflects the last write.

use crate::errors::Result;
use crate::extraction::model::{
    CachedExtraction, DocumentCategory, ExtractedData, ExtractionTask, TaskStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Persistence for extraction task records
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fetch the record for a document, creating a pending one if absent.
    /// Returns the record and whether it was created by this call.
    async fn get_or_create(&self, document_id: Uuid) -> Result<(ExtractionTask, bool)>;

    /// Current record for a document. Reads observe every committed write,
    /// since the result is checked for ownership and saved back.
    async fn find(&self, document_id: Uuid) -> Result<Option<ExtractionTask>>;

    /// Upsert the full record; stamps `updated_at`
    async fn save(&self, task: &ExtractionTask) -> Result<ExtractionTask>;

    /// Replace an existing record only while its stored `job_id` is still
    /// `expected`. `None` when another writer changed the owner first.
    async fn save_if_job(
        &self,
        task: &ExtractionTask,
        expected: Option<&str>,
    ) -> Result<Option<ExtractionTask>>;

    /// Raise progress and set status while `job_id` still owns the record.
    /// Never lowers progress.
    async fn advance(
        &self,
        document_id: Uuid,
        job_id: &str,
        progress: i32,
        status: TaskStatus,
    ) -> Result<()>;

    async fn delete(&self, document_id: Uuid) -> Result<bool>;

    /// Unfinished tasks whose last write is older than `before`, oldest first
    async fn find_stale(&self, before: DateTime<Utc>, limit: u64) -> Result<Vec<ExtractionTask>>;

    /// Delete succeeded tasks last written before `before`
    async fn purge_succeeded(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Content-hash keyed reuse of previous extractions
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up and register a use
    async fn lookup(
        &self,
        category: DocumentCategory,
        content_hash: &str,
    ) -> Result<Option<CachedExtraction>>;

    /// Store a result, evicting least recently used entries above `max_entries`
    async fn remember(
        &self,
        category: DocumentCategory,
        content_hash: &str,
        data: &ExtractedData,
        confidence: f64,
        max_entries: u64,
    ) -> Result<()>;
}

/// In-process store for tests and local runs
#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<HashMap<Uuid, ExtractionTask>>,
    cache: Mutex<HashMap<(DocumentCategory, String), CachedExtraction>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a record's `updated_at` into the past
    pub fn backdate(&self, document_id: Uuid, updated_at: DateTime<Utc>) {
        if let Some(task) = self.lock_tasks().get_mut(&document_id) {
            task.updated_at = updated_at;
        }
    }

    pub fn task_count(&self) -> usize {
        self.lock_tasks().len()
    }

    pub fn cache_len(&self) -> usize {
        self.lock_cache().len()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ExtractionTask>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_cache(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(DocumentCategory, String), CachedExtraction>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn get_or_create(&self, document_id: Uuid) -> Result<(ExtractionTask, bool)> {
        let mut tasks = self.lock_tasks();
        if let Some(existing) = tasks.get(&document_id) {
            return Ok((existing.clone(), false));
        }
        let task = ExtractionTask::new(document_id);
        tasks.insert(document_id, task.clone());
        Ok((task, true))
    }

    async fn find(&self, document_id: Uuid) -> Result<Option<ExtractionTask>> {
        Ok(self.lock_tasks().get(&document_id).cloned())
    }

    async fn save(&self, task: &ExtractionTask) -> Result<ExtractionTask> {
        let mut tasks = self.lock_tasks();
        let mut stored = task.clone();
        stored.updated_at = Utc::now();
        if let Some(existing) = tasks.get(&task.document_id) {
            stored.created_at = existing.created_at;
        }
        tasks.insert(task.document_id, stored.clone());
        Ok(stored)
    }

    async fn save_if_job(
        &self,
        task: &ExtractionTask,
        expected: Option<&str>,
    ) -> Result<Option<ExtractionTask>> {
        let mut tasks = self.lock_tasks();
        let Some(existing) = tasks.get(&task.document_id) else {
            return Ok(None);
        };
        if existing.job_id.as_deref() != expected {
            return Ok(None);
        }
        let mut stored = task.clone();
        stored.updated_at = Utc::now();
        stored.created_at = existing.created_at;
        tasks.insert(task.document_id, stored.clone());
        Ok(Some(stored))
    }

    async fn advance(
        &self,
        document_id: Uuid,
        job_id: &str,
        progress: i32,
        status: TaskStatus,
    ) -> Result<()> {
        if let Some(task) = self.lock_tasks().get_mut(&document_id) {
            if task.job_id.as_deref() == Some(job_id) && task.progress <= progress {
                task.progress = progress;
                task.status = status;
                task.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn delete(&self, document_id: Uuid) -> Result<bool> {
        Ok(self.lock_tasks().remove(&document_id).is_some())
    }

    async fn find_stale(&self, before: DateTime<Utc>, limit: u64) -> Result<Vec<ExtractionTask>> {
        let mut stale: Vec<ExtractionTask> = self
            .lock_tasks()
            .values()
            .filter(|t| t.status != TaskStatus::Succeeded && t.updated_at < before)
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.updated_at);
        stale.truncate(limit as usize);
        Ok(stale)
    }

    async fn purge_succeeded(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut tasks = self.lock_tasks();
        let len = tasks.len();
        tasks.retain(|_, t| !(t.status == TaskStatus::Succeeded && t.updated_at < before));
        Ok((len - tasks.len()) as u64)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn lookup(
        &self,
        category: DocumentCategory,
        content_hash: &str,
    ) -> Result<Option<CachedExtraction>> {
        let mut cache = self.lock_cache();
        Ok(cache
            .get_mut(&(category, content_hash.to_string()))
            .map(|entry| {
                entry.use_count += 1;
                entry.last_used_at = Utc::now();
                entry.clone()
            }))
    }

    async fn remember(
        &self,
        category: DocumentCategory,
        content_hash: &str,
        data: &ExtractedData,
        confidence: f64,
        max_entries: u64,
    ) -> Result<()> {
        let mut cache = self.lock_cache();
        let now = Utc::now();
        cache.insert(
            (category, content_hash.to_string()),
            CachedExtraction {
                category,
                content_hash: content_hash.to_string(),
                extracted_data: data.clone(),
                confidence_score: confidence,
                use_count: 1,
                created_at: now,
                last_used_at: now,
            },
        );

        while cache.len() as u64 > max_entries {
            let oldest = cache
                .iter()
                .min_by_key(|(_, e)| e.last_used_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    cache.remove(&key);
                }
                None => break,
            }
        }
        Ok(())
    }
}
