//! Local configuration mirror.
//!
//! Each device keeps its working tree plus the base recorded at the
//! last confirmed sync: version, lineage and content hash, and the base
//! tree itself for three-way resolution. `LocalVersionInfo` for the
//! detector is derived from the two. The file-backed store writes
//! through a temp file and atomic rename, so a crash mid-write never
//! leaves a half-written mirror.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::detector::LocalVersionInfo;
use crate::error::{SyncError, SyncResult};
use crate::snapshot::content_hash;

/// What the mirror remembers about its last confirmed sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedBase {
    pub version: u64,
    pub previous_version: u64,
    pub content_hash: String,
    pub synced_at: DateTime<Utc>,
}

/// Device-local snapshot storage.
pub trait LocalStore: Send + Sync {
    /// The current working tree.
    fn working_tree(&self) -> SyncResult<Value>;

    /// Replace the working tree with a local edit.
    fn set_working_tree(&self, tree: Value) -> SyncResult<()>;

    /// Base recorded at the last confirmed sync, if any.
    fn base(&self) -> SyncResult<Option<SyncedBase>>;

    /// The tree as it was at the last confirmed sync.
    fn base_tree(&self) -> SyncResult<Option<Value>>;

    /// Record a confirmed sync: `tree` becomes both the working tree and
    /// the new base.
    fn commit_synced(&self, tree: &Value, base: SyncedBase) -> SyncResult<()>;

    /// When the working tree last changed.
    fn modified_at(&self) -> SyncResult<DateTime<Utc>>;

    /// Version info for the detector, derived from tree and base.
    fn local_info(&self) -> SyncResult<LocalVersionInfo> {
        let working = self.working_tree()?;
        let base = self.base()?;
        let working_hash = content_hash(&working)?;
        let has_content = working.as_object().map(|m| !m.is_empty()).unwrap_or(true);
        Ok(LocalVersionInfo {
            version: base.as_ref().map(|b| b.version).unwrap_or(0),
            previous_version: base.as_ref().map(|b| b.previous_version).unwrap_or(0),
            base_hash: base.map(|b| b.content_hash),
            working_hash,
            has_content,
        })
    }

    /// Whether the working tree differs from the synced base.
    fn is_dirty(&self) -> SyncResult<bool> {
        Ok(self.local_info()?.is_dirty())
    }
}

fn check_commit(tree: &Value, base: &SyncedBase) -> SyncResult<()> {
    let hash = content_hash(tree)?;
    if hash != base.content_hash {
        return Err(SyncError::InternalError(format!(
            "commit hash mismatch: base records {}, tree hashes to {}",
            base.content_hash, hash
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct MirrorState {
    working: Value,
    base: Option<SyncedBase>,
    base_tree: Option<Value>,
    modified_at: DateTime<Utc>,
}

impl MirrorState {
    fn empty() -> Self {
        Self {
            working: Value::Object(serde_json::Map::new()),
            base: None,
            base_tree: None,
            modified_at: Utc::now(),
        }
    }
}

/// In-memory mirror; state is lost on drop.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<MirrorState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MirrorState::empty()),
        }
    }

    /// Start with a working tree already in place, as an application
    /// would after loading its config file.
    pub fn with_tree(tree: Value) -> Self {
        let store = Self::new();
        store.inner.write().working = tree;
        store
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryStore {
    fn working_tree(&self) -> SyncResult<Value> {
        Ok(self.inner.read().working.clone())
    }

    fn set_working_tree(&self, tree: Value) -> SyncResult<()> {
        let mut inner = self.inner.write();
        inner.working = tree;
        inner.modified_at = Utc::now();
        Ok(())
    }

    fn base(&self) -> SyncResult<Option<SyncedBase>> {
        Ok(self.inner.read().base.clone())
    }

    fn base_tree(&self) -> SyncResult<Option<Value>> {
        Ok(self.inner.read().base_tree.clone())
    }

    fn commit_synced(&self, tree: &Value, base: SyncedBase) -> SyncResult<()> {
        check_commit(tree, &base)?;
        let mut inner = self.inner.write();
        inner.working = tree.clone();
        inner.base_tree = Some(tree.clone());
        inner.modified_at = base.synced_at;
        inner.base = Some(base);
        Ok(())
    }

    fn modified_at(&self) -> SyncResult<DateTime<Utc>> {
        Ok(self.inner.read().modified_at)
    }
}

/// On-disk serialization of the mirror.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedMirror {
    working: Value,
    base: Option<SyncedBase>,
    base_tree: Option<Value>,
    modified_at: DateTime<Utc>,
}

/// File-backed mirror with atomic writes.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: RwLock<MirrorState>,
}

impl FileStore {
    /// Open an existing mirror file, or start empty when none exists.
    pub fn open(path: impl Into<PathBuf>) -> SyncResult<Self> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => {
                let persisted: PersistedMirror = serde_json::from_slice(&bytes)?;
                MirrorState {
                    working: persisted.working,
                    base: persisted.base,
                    base_tree: persisted.base_tree,
                    modified_at: persisted.modified_at,
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => MirrorState::empty(),
            Err(err) => return Err(SyncError::IoError(err)),
        };
        let base_version = state.base.as_ref().map(|b| b.version).unwrap_or(0);
        debug!(path = %path.display(), version = base_version, "opened local mirror");
        Ok(Self {
            path,
            inner: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, state: &MirrorState) -> SyncResult<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(dir)?;
        let persisted = PersistedMirror {
            working: state.working.clone(),
            base: state.base.clone(),
            base_tree: state.base_tree.clone(),
            modified_at: state.modified_at,
        };
        serde_json::to_writer(tmp.as_file(), &persisted)?;
        tmp.persist(&self.path)
            .map_err(|e| SyncError::StorageFailed(format!("atomic replace failed: {}", e)))?;
        Ok(())
    }
}

impl LocalStore for FileStore {
    fn working_tree(&self) -> SyncResult<Value> {
        Ok(self.inner.read().working.clone())
    }

    fn set_working_tree(&self, tree: Value) -> SyncResult<()> {
        let mut inner = self.inner.write();
        inner.working = tree;
        inner.modified_at = Utc::now();
        self.persist(&inner)
    }

    fn base(&self) -> SyncResult<Option<SyncedBase>> {
        Ok(self.inner.read().base.clone())
    }

    fn base_tree(&self) -> SyncResult<Option<Value>> {
        Ok(self.inner.read().base_tree.clone())
    }

    fn commit_synced(&self, tree: &Value, base: SyncedBase) -> SyncResult<()> {
        check_commit(tree, &base)?;
        let mut inner = self.inner.write();
        inner.working = tree.clone();
        inner.base_tree = Some(tree.clone());
        inner.modified_at = base.synced_at;
        inner.base = Some(base);
        self.persist(&inner)
    }

    fn modified_at(&self) -> SyncResult<DateTime<Utc>> {
        Ok(self.inner.read().modified_at)
    }
}
