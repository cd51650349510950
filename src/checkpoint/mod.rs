//! Checkpoint storage
//!
//! Every node execution appends an immutable snapshot of [`WorkflowState`]
//! under `(thread_id, sequence_number)`. Sequence numbers start at 1 and are
//! strictly increasing per thread; threads are independent of each other.
//!
//! Two backends share the [`CheckpointStore`] contract:
//! - [`SqliteCheckpointStore`] (feature `database`): durable, safe for several
//!   processes writing the same file.
//! - [`MemoryCheckpointStore`]: volatile fallback with no crash recovery.

pub mod memory;
#[cfg(feature = "database")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::CodeflowConfig;
use crate::workflow::WorkflowState;

#[cfg(test)]
use mockall::automock;

pub use memory::MemoryCheckpointStore;
#[cfg(feature = "database")]
pub use sqlite::SqliteCheckpointStore;

/// Errors that can occur while reading or writing checkpoints
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not allocate a sequence number for thread {thread_id} after {attempts} attempts")]
    SequenceConflict { thread_id: String, attempts: u32 },

    #[error("Checkpoint {thread_id}#{sequence} is corrupt: {reason}")]
    Corrupt {
        thread_id: String,
        sequence: u64,
        reason: String,
    },

    #[error("Thread mismatch: append for {expected} received state of {found}")]
    ThreadMismatch { expected: String, found: String },

    #[error("Checkpoint store unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Immutable snapshot of a workflow at one point in its history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub sequence_number: u64,
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
    /// `host:pid` of the process that wrote the checkpoint
    pub writer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Durable,
    Volatile,
}

impl StoreBackend {
    /// Whether checkpoints survive a process restart
    pub fn survives_restart(&self) -> bool {
        matches!(self, StoreBackend::Durable)
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Durable => f.write_str("durable"),
            StoreBackend::Volatile => f.write_str("volatile"),
        }
    }
}

/// Append-only checkpoint log keyed by thread id
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Durably append a snapshot. The checkpoint is visible to readers only
    /// after this returns `Ok`; on error nothing is observable.
    async fn append(&self, thread_id: &str, state: &WorkflowState) -> Result<u64, CheckpointError>;

    /// Most recent checkpoint, if the thread has any
    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Every retained checkpoint, oldest first
    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Delete all but the newest `keep_last` checkpoints; returns how many were removed
    async fn prune(&self, thread_id: &str, keep_last: usize) -> Result<usize, CheckpointError>;

    fn backend(&self) -> StoreBackend;

    /// Release connections; further calls may fail
    async fn shutdown(&self) {}
}

/// Identity recorded on every checkpoint
pub(crate) fn writer_identity() -> String {
    let host = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    format!("{}:{}", host, std::process::id())
}

pub(crate) fn ensure_thread(thread_id: &str, state: &WorkflowState) -> Result<(), CheckpointError> {
    if state.thread_id != thread_id {
        return Err(CheckpointError::ThreadMismatch {
            expected: thread_id.to_string(),
            found: state.thread_id.clone(),
        });
    }
    Ok(())
}

/// Store chosen at startup plus the reason for any fallback
pub struct OpenedStore {
    pub store: Arc<dyn CheckpointStore>,
    pub backend: StoreBackend,
    pub fallback_reason: Option<String>,
}

impl fmt::Debug for OpenedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedStore")
            .field("backend", &self.backend)
            .field("fallback_reason", &self.fallback_reason)
            .finish()
    }
}

impl OpenedStore {
    fn volatile(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!(
            reason = %reason,
            "Using in-memory checkpoint store: workflows will not survive a restart"
        );
        Self {
            store: Arc::new(MemoryCheckpointStore::new()),
            backend: StoreBackend::Volatile,
            fallback_reason: Some(reason),
        }
    }
}

/// Pick the checkpoint backend once, at process start.
///
/// A configured but unreachable durable store never aborts startup: the
/// process continues on the volatile backend and the degradation is logged
/// at warn level and reported in [`OpenedStore::fallback_reason`].
pub async fn open_store(config: &CodeflowConfig) -> OpenedStore {
    let Some(database) = &config.database else {
        return OpenedStore::volatile("no durable checkpoint store configured");
    };

    #[cfg(feature = "database")]
    {
        match SqliteCheckpointStore::connect(database).await {
            Ok(store) => {
                if let Err(e) = store.recover_pending().await {
                    warn!(error = %e, "Failed to inspect pending checkpoint writes");
                }
                info!(url = %database.url, "Durable checkpoint store ready");
                OpenedStore {
                    store: Arc::new(store),
                    backend: StoreBackend::Durable,
                    fallback_reason: None,
                }
            }
            Err(e) => OpenedStore::volatile(format!(
                "durable checkpoint store at {} is unreachable: {}",
                database.url, e
            )),
        }
    }

    #[cfg(not(feature = "database"))]
    {
        OpenedStore::volatile(format!(
            "durable checkpoint store at {} configured but the database feature is disabled",
            database.url
        ))
    }
}
