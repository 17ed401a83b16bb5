/// Durable storage for canonical document snapshots
use async_trait::async_trait;
use beatmap::DocumentId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{CollaborationError, Result};

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_snapshot(&self, document: &DocumentId) -> Result<Option<Vec<u8>>>;

    async fn save_snapshot(&self, document: &DocumentId, bytes: Vec<u8>) -> Result<()>;
}

/// One `<document id>.json` file per document under a root directory
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, document: &DocumentId) -> PathBuf {
        self.root.join(format!("{}.json", document))
    }
}

fn persistence_error(action: &str, path: &Path, e: std::io::Error) -> CollaborationError {
    CollaborationError::Persistence(format!("{} {}: {}", action, path.display(), e))
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load_snapshot(&self, document: &DocumentId) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(document);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(persistence_error("read", &path, e)),
        }
    }

    async fn save_snapshot(&self, document: &DocumentId, bytes: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| persistence_error("create", &self.root, e))?;

        let path = self.path_for(document);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| persistence_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| persistence_error("rename", &path, e))?;

        tracing::debug!(document = %document, bytes = bytes.len(), "snapshot saved");
        Ok(())
    }
}

/// In-process store, mainly for tests
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<DocumentId, Vec<u8>>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail until switched back
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn get(&self, document: &DocumentId) -> Option<Vec<u8>> {
        self.snapshots.lock().get(document).cloned()
    }

    pub fn insert(&self, document: DocumentId, bytes: Vec<u8>) {
        self.snapshots.lock().insert(document, bytes);
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load_snapshot(&self, document: &DocumentId) -> Result<Option<Vec<u8>>> {
        Ok(self.get(document))
    }

    async fn save_snapshot(&self, document: &DocumentId, bytes: Vec<u8>) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(CollaborationError::Persistence(
                "memory store configured to fail".to_string(),
            ));
        }
        self.insert(*document, bytes);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
