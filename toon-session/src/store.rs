//! Persistence of session records.
//!
//! The store is an external key-value collaborator keyed by session id. It
//! deliberately allows more than one record so that corruption can be
//! detected by the manager instead of being hidden by the store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::session::Session;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Every stored session.
    async fn load_all(&self) -> Result<Vec<Session>, StoreError>;

    /// Insert or replace the record for `session.session_id`.
    async fn save(&self, session: &Session) -> Result<(), StoreError>;

    /// Remove a record. Returns whether it existed.
    async fn remove(&self, session_id: &str) -> Result<bool, StoreError>;
}

/// Volatile store, used by tests and short-lived tools.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<BTreeMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `sessions`.
    pub fn with_sessions(sessions: impl IntoIterator<Item = Session>) -> Self {
        let store = Self::new();
        {
            let mut map = store.sessions.lock();
            for session in sessions {
                map.insert(session.session_id.clone(), session);
            }
        }
        store
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load_all(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.sessions.lock().values().cloned().collect())
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.lock().remove(session_id).is_some())
    }
}

/// JSON document on disk mapping session id to session.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_map(&self) -> Result<BTreeMap<String, Session>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_map(&self, map: &BTreeMap<String, Session>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(map)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        // Write to a sibling file first so a crash never leaves half a document.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Wrote {} session(s) to {}", map.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.read_map().await?.into_values().collect())
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.read_map().await?;
        map.insert(session.session_id.clone(), session.clone());
        self.write_map(&map).await
    }

    async fn remove(&self, session_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.read_map().await?;
        let existed = map.remove(session_id).is_some();
        if existed {
            self.write_map(&map).await?;
        }
        Ok(existed)
    }
}
