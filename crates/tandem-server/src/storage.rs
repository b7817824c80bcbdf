//! Durable storage for instance state.
//!
//! Only the document and its comments survive a restart. Versions, step
//! history and the comment event log start over, so clients that were
//! connected before will see an invalid version and resync.

use crate::error::StorageError;
use crate::protocol::PersistedState;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// A place to keep the registry's documents between runs.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Load the saved state. `None` means nothing has been saved yet.
    async fn load(&self) -> Result<Option<PersistedState>, StorageError>;

    /// Replace the saved state.
    async fn save(&self, state: &PersistedState) -> Result<(), StorageError>;
}

/// Stores all instances as one JSON object in a file.
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl Storage for JsonFileStorage {
    async fn load(&self) -> Result<Option<PersistedState>, StorageError> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(err)),
        };
        let state: PersistedState = serde_json::from_str(&json)?;
        debug!(path = %self.path.display(), instances = state.len(), "loaded saved instances");
        Ok(Some(state))
    }

    async fn save(&self, state: &PersistedState) -> Result<(), StorageError> {
        let json = serde_json::to_string(state)?;
        // Write next to the target and rename, so a crash never leaves a torn file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|err| self.io_error(err))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| self.io_error(err))?;
        debug!(path = %self.path.display(), instances = state.len(), "saved instances");
        Ok(())
    }
}

/// In-memory storage for tests and simulations.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<Option<PersistedState>>,
    saves: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            saves: AtomicUsize::new(0),
        }
    }

    /// The last saved state.
    pub fn stored(&self) -> Option<PersistedState> {
        self.state.lock().clone()
    }

    /// How many times `save` has been called.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self) -> Result<Option<PersistedState>, StorageError> {
        Ok(self.state.lock().clone())
    }

    async fn save(&self, state: &PersistedState) -> Result<(), StorageError> {
        *self.state.lock() = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
