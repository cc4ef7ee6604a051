//! Session persistence
//!
//! [`FileSessionStore`] keeps one JSON document per session under a
//! directory, replaced atomically (write to a temporary file, then rename),
//! plus a `latest` file naming the most recently saved session.

use crate::session::{SessionId, SessionRecord};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const LATEST: &str = "latest";

/// Persistence failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Document could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store contents are inconsistent
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

/// Where sessions survive restarts
pub trait SessionStore: Send + Sync {
    /// Insert or replace a session record and mark it latest
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Load one session
    fn load(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError>;

    /// Load the most recently saved session
    fn load_latest(&self) -> Result<Option<SessionRecord>, StoreError>;

    /// Ids of every stored session
    fn list(&self) -> Result<Vec<SessionId>, StoreError>;
}

/// One JSON file per session
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Open (creating if needed) a store directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Store directory
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let id = record.session.id;
        let json = serde_json::to_vec_pretty(record)?;
        self.write_atomic(&self.session_path(id), &json)?;
        self.write_atomic(&self.dir.join(LATEST), id.to_string().as_bytes())?;
        tracing::debug!("Persisted session {} to {}", id, self.dir.display());
        Ok(())
    }

    fn load(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let path = self.session_path(id);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn load_latest(&self) -> Result<Option<SessionRecord>, StoreError> {
        let latest = match fs::read_to_string(self.dir.join(LATEST)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let id: SessionId = latest
            .trim()
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("bad latest pointer `{}`: {e}", latest.trim())))?;
        match self.load(id)? {
            Some(record) => Ok(Some(record)),
            None => Err(StoreError::Corrupt(format!(
                "latest pointer names missing session {id}"
            ))),
        }
    }

    fn list(&self) -> Result<Vec<SessionId>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Volatile store for tests and embedding
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: Mutex<(BTreeMap<SessionId, SessionRecord>, Option<SessionId>)>,
}

impl MemorySessionStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut guard = self.inner.lock();
        guard.0.insert(record.session.id, record.clone());
        guard.1 = Some(record.session.id);
        Ok(())
    }

    fn load(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.inner.lock().0.get(&id).cloned())
    }

    fn load_latest(&self) -> Result<Option<SessionRecord>, StoreError> {
        let guard = self.inner.lock();
        Ok(guard.1.and_then(|id| guard.0.get(&id).cloned()))
    }

    fn list(&self) -> Result<Vec<SessionId>, StoreError> {
        Ok(self.inner.lock().0.keys().copied().collect())
    }
}
