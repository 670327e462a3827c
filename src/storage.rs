use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::accounts::repo_types::Document;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize user document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Whole-document persistence for user records.
///
/// `write_all` must update what `read_all` returns before attempting
/// durable storage, so a failed write still leaves the new document
/// visible for the rest of the process lifetime.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn read_all(&self) -> Document;
    async fn write_all(&self, doc: Document) -> Result<(), StoreError>;
    async fn flush(&self) -> Result<(), StoreError>;
}

/// JSON file backed store with an in-memory copy that stays authoritative.
pub struct JsonFileStore {
    path: Option<PathBuf>,
    doc: RwLock<Document>,
}

impl JsonFileStore {
    /// Store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            doc: RwLock::new(Document::default()),
        }
    }

    /// Load the document at `path`. Any load failure falls back to an
    /// empty document; later writes still target `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = match load(&path).await {
            Ok(Some(doc)) => {
                info!(path = %path.display(), users = doc.users.len(), "user document loaded");
                doc
            }
            Ok(None) => {
                info!(path = %path.display(), "no user document yet; starting empty");
                Document::default()
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), path = %path.display(), "using in-memory database (fallback)");
                Document::default()
            }
        };
        Self {
            path: Some(path),
            doc: RwLock::new(doc),
        }
    }

    async fn persist(&self, doc: &Document) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(doc)?;
        tokio::fs::write(path, json)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), users = doc.users.len(), "user document persisted");
        Ok(())
    }
}

async fn load(path: &Path) -> anyhow::Result<Option<Document>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let doc = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(doc))
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn read_all(&self) -> Document {
        self.doc.read().await.clone()
    }

    async fn write_all(&self, doc: Document) -> Result<(), StoreError> {
        // Held across the file write so the file never lags behind an older document.
        let mut guard = self.doc.write().await;
        *guard = doc;
        self.persist(&guard).await
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let guard = self.doc.read().await;
        self.persist(&guard).await
    }
}
