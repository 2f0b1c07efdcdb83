//! Access to externally owned documents and their files

use crate::errors::{AppError, Result};
use crate::extraction::model::DocumentCategory;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Opaque handle for an uploaded document
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentHandle {
    pub id: Uuid,
    pub category: DocumentCategory,
    pub file_ref: String,
}

/// Narrow view of the document registry owned by the proposal domain
#[async_trait]
pub trait DocumentDirectory: Send + Sync {
    /// `None` when the document no longer exists
    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentHandle>>;

    async fn set_verification_flag(&self, id: Uuid, verified: bool) -> Result<()>;
}

/// In-process document registry
#[derive(Default)]
pub struct MemoryDocuments {
    documents: Mutex<HashMap<Uuid, DocumentHandle>>,
    flags: Mutex<Vec<(Uuid, bool)>>,
}

impl MemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: DocumentHandle) {
        self.documents
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(handle.id, handle);
    }

    pub fn remove(&self, id: Uuid) {
        self.documents
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
    }

    /// Every verification flag write, in order
    pub fn flag_writes(&self) -> Vec<(Uuid, bool)> {
        self.flags.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl DocumentDirectory for MemoryDocuments {
    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentHandle>> {
        Ok(self
            .documents
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned())
    }

    async fn set_verification_flag(&self, id: Uuid, verified: bool) -> Result<()> {
        if !self
            .documents
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&id)
        {
            return Err(AppError::DocumentNotFound { id: id.to_string() });
        }
        self.flags
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, verified));
        Ok(())
    }
}

/// Resolves file references below a storage root
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

/// File contents plus their SHA-256 digest
#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub bytes: Vec<u8>,
    pub content_hash: String,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a reference; rejects absolute paths and parent traversal
    pub fn resolve(&self, file_ref: &str) -> Result<PathBuf> {
        let relative = Path::new(file_ref);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if file_ref.is_empty() || escapes {
            return Err(AppError::InvalidFormat {
                message: format!("file reference outside storage root: {file_ref}"),
            });
        }
        Ok(self.root.join(relative))
    }

    pub async fn load(&self, file_ref: &str) -> Result<LoadedFile> {
        let path = self.resolve(file_ref)?;
        let bytes = tokio::fs::read(&path).await?;
        let content_hash = hex::encode(Sha256::digest(&bytes));
        Ok(LoadedFile { bytes, content_hash })
    }
}
