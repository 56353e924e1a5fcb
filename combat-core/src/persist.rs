//! Session persistence.
//!
//! Sessions are plain serde data, so any key-value store works. Two stores
//! ship with the crate: an in-memory map and a directory of versioned JSON
//! files, one per session.
//!
//! Saves are revision-monotonic: a session older than the stored copy is
//! ignored, so overlapping saves that finish out of order never roll the
//! store back.

use crate::clock::Clock;
use crate::state::{CombatSession, SessionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Current save file version.
pub const SAVE_VERSION: u32 = 1;

/// Storage for combat sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store `session` unless a newer revision is already stored.
    async fn save(&self, session: &CombatSession) -> Result<(), PersistError>;

    async fn load(&self, id: SessionId) -> Result<Option<CombatSession>, PersistError>;

    async fn remove(&self, id: SessionId) -> Result<(), PersistError>;
}

/// Keeps sessions in memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionId, CombatSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save(&self, session: &CombatSession) -> Result<(), PersistError> {
        let mut sessions = self.sessions.write().await;
        if let Some(stored) = sessions.get(&session.id) {
            if is_stale(session, stored.revision) {
                return Ok(());
            }
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn load(&self, id: SessionId) -> Result<Option<CombatSession>, PersistError> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn remove(&self, id: SessionId) -> Result<(), PersistError> {
        self.sessions.write().await.remove(&id);
        Ok(())
    }
}

fn is_stale(session: &CombatSession, stored_revision: u64) -> bool {
    if session.revision >= stored_revision {
        return false;
    }
    debug!(
        session = %session.id,
        revision = session.revision,
        stored = stored_revision,
        "Ignoring stale save"
    );
    true
}

/// A saved session with its format version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSession {
    /// Save format version for compatibility checking.
    pub version: u32,

    /// When the save was written, in ms since the Unix epoch.
    pub saved_at: u64,

    pub session: CombatSession,
}

impl SavedSession {
    pub fn new(session: CombatSession, saved_at: u64) -> Self {
        Self {
            version: SAVE_VERSION,
            saved_at,
            session,
        }
    }

    /// Save to a JSON file.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Load from a JSON file, rejecting other format versions.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let content = fs::read_to_string(path).await?;
        let saved: Self = serde_json::from_str(&content)?;

        if saved.version != SAVE_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SAVE_VERSION,
                found: saved.version,
            });
        }

        Ok(saved)
    }
}

/// Stores each session as `<dir>/<session id>.json`.
pub struct JsonFileStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    /// Last revision written per session. Held across the write so
    /// concurrent saves of one session are ordered.
    written: Mutex<HashMap<SessionId, u64>>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            clock,
            written: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn save(&self, session: &CombatSession) -> Result<(), PersistError> {
        let mut written = self.written.lock().await;
        let stored = match written.get(&session.id) {
            Some(revision) => Some(*revision),
            // Unreadable files are overwritten.
            None => self.load(session.id).await.ok().flatten().map(|s| s.revision),
        };
        if stored.is_some_and(|revision| is_stale(session, revision)) {
            return Ok(());
        }

        fs::create_dir_all(&self.dir).await?;
        SavedSession::new(session.clone(), self.clock.now_ms())
            .save_json(self.path_for(session.id))
            .await?;
        written.insert(session.id, session.revision);
        Ok(())
    }

    async fn load(&self, id: SessionId) -> Result<Option<CombatSession>, PersistError> {
        let path = self.path_for(id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        Ok(Some(SavedSession::load_json(path).await?.session))
    }

    async fn remove(&self, id: SessionId) -> Result<(), PersistError> {
        let mut written = self.written.lock().await;
        written.remove(&id);
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
