//! Conversation checkpoints.
//!
//! Checkpoints are written only when a turn completes, so a stored state
//! always ends in an answer. On disk each thread has its own directory:
//!
//! ```text
//! <data_dir>/threads/<thread_id>/
//! └── checkpoint.json    # Full ConversationState
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::state::ConversationState;

const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Durable per-thread conversation state.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the state of a thread, `None` for a thread never seen.
    async fn load(&self, thread_id: &str) -> CoreResult<Option<ConversationState>>;

    /// Atomically replace the stored state of `state.thread_id`.
    async fn save(&self, state: &ConversationState) -> CoreResult<()>;

    /// Remove everything stored for a thread. Returns the number of records removed.
    async fn delete(&self, thread_id: &str) -> CoreResult<usize>;
}

/// Encode a thread id into a single safe path component.
///
/// ASCII alphanumerics, `-` and `_` are kept; every other byte is written
/// as `%XX`, so distinct ids never collide and never escape the directory.
pub fn storage_key(thread_id: &str) -> String {
    let mut key = String::with_capacity(thread_id.len());
    for byte in thread_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            key.push(byte as char);
        } else {
            key.push_str(&format!("%{:02X}", byte));
        }
    }
    if key.is_empty() {
        key.push('%');
    }
    key
}

/// In-process store, lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    states: RwLock<HashMap<String, ConversationState>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, thread_id: &str) -> CoreResult<Option<ConversationState>> {
        Ok(self.states.read().get(thread_id).cloned())
    }

    async fn save(&self, state: &ConversationState) -> CoreResult<()> {
        self.states
            .write()
            .insert(state.thread_id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, thread_id: &str) -> CoreResult<usize> {
        Ok(usize::from(self.states.write().remove(thread_id).is_some()))
    }
}

/// JSON files under `<root>/threads/`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().join("threads"),
        }
    }

    /// Create the store directory up front so a broken data dir fails at startup.
    pub fn open(data_dir: impl AsRef<Path>) -> CoreResult<Self> {
        let store = Self::new(data_dir);
        std::fs::create_dir_all(&store.root).map_err(|e| {
            CoreError::CheckpointUnavailable(format!("{}: {}", store.root.display(), e))
        })?;
        Ok(store)
    }

    fn thread_dir(&self, thread_id: &str) -> PathBuf {
        self.root.join(storage_key(thread_id))
    }

    fn unavailable(err: std::io::Error) -> CoreError {
        CoreError::CheckpointUnavailable(err.to_string())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, thread_id: &str) -> CoreResult<Option<ConversationState>> {
        let path = self.thread_dir(thread_id).join(CHECKPOINT_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::unavailable(e)),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn save(&self, state: &ConversationState) -> CoreResult<()> {
        let dir = self.thread_dir(&state.thread_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(Self::unavailable)?;

        let json = serde_json::to_string_pretty(state)?;
        let tmp = dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(Self::unavailable)?;
        tokio::fs::rename(&tmp, dir.join(CHECKPOINT_FILE))
            .await
            .map_err(Self::unavailable)?;

        debug!(
            "Saved checkpoint for thread {} ({} messages)",
            state.thread_id,
            state.messages.len()
        );
        Ok(())
    }

    async fn delete(&self, thread_id: &str) -> CoreResult<usize> {
        let dir = self.thread_dir(thread_id);
        let removed = match tokio::fs::remove_file(dir.join(CHECKPOINT_FILE)).await {
            Ok(()) => 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(Self::unavailable(e)),
        };
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Self::unavailable(e)),
        }
        Ok(removed)
    }
}
