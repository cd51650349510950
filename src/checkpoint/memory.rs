use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ensure_thread, writer_identity, Checkpoint, CheckpointError, CheckpointStore, StoreBackend};
use crate::workflow::WorkflowState;

/// Volatile checkpoint store.
///
/// Checkpoints are cloned into a process-local map, so history is lost when
/// the process exits. Used when no durable store is configured or reachable.
#[derive(Debug)]
pub struct MemoryCheckpointStore {
    threads: RwLock<HashMap<String, Vec<Checkpoint>>>,
    writer: String,
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            writer: writer_identity(),
        }
    }

    pub async fn thread_count(&self) -> usize {
        self.threads.read().await.len()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn append(&self, thread_id: &str, state: &WorkflowState) -> Result<u64, CheckpointError> {
        ensure_thread(thread_id, state)?;

        let mut threads = self.threads.write().await;
        let history = threads.entry(thread_id.to_string()).or_default();
        // Pruning may have removed older entries, so count from the newest one
        let sequence_number = history.last().map(|c| c.sequence_number + 1).unwrap_or(1);

        history.push(Checkpoint {
            thread_id: thread_id.to_string(),
            sequence_number,
            state: state.clone(),
            created_at: Utc::now(),
            writer: self.writer.clone(),
        });

        debug!(thread_id = %thread_id, sequence_number, "Checkpoint appended in memory");
        Ok(sequence_number)
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).and_then(|history| history.last().cloned()))
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).cloned().unwrap_or_default())
    }

    async fn prune(&self, thread_id: &str, keep_last: usize) -> Result<usize, CheckpointError> {
        let mut threads = self.threads.write().await;
        let Some(history) = threads.get_mut(thread_id) else {
            return Ok(0);
        };

        let keep_last = keep_last.max(1);
        let removed = history.len().saturating_sub(keep_last);
        history.drain(..removed);
        Ok(removed)
    }

    fn backend(&self) -> StoreBackend {
        StoreBackend::Volatile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowStatus;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sequence_numbers_start_at_one_and_increase() {
        let store = MemoryCheckpointStore::new();
        let mut state = WorkflowState::new("t-1", "request");

        assert_eq!(store.append("t-1", &state).await.unwrap(), 1);
        state.node_execution_count = 1;
        assert_eq!(store.append("t-1", &state).await.unwrap(), 2);

        let latest = store.latest("t-1").await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, 2);
        assert_eq!(latest.state.node_execution_count, 1);
    }

    #[tokio::test]
    async fn test_threads_are_isolated() {
        let store = MemoryCheckpointStore::new();

        store.append("a", &WorkflowState::new("a", "first")).await.unwrap();
        store.append("a", &WorkflowState::new("a", "first")).await.unwrap();
        assert_eq!(store.append("b", &WorkflowState::new("b", "second")).await.unwrap(), 1);

        assert!(store.latest("missing").await.unwrap().is_none());
        assert_eq!(store.history("a").await.unwrap().len(), 2);
        assert_eq!(store.thread_count().await, 2);
    }

    #[tokio::test]
    async fn test_stored_snapshot_is_not_affected_by_later_mutation() {
        let store = MemoryCheckpointStore::new();
        let mut state = WorkflowState::new("t", "r");
        store.append("t", &state).await.unwrap();

        state.status = WorkflowStatus::Failed;
        let latest = store.latest("t").await.unwrap().unwrap();
        assert_eq!(latest.state.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_and_sequence_continues() {
        let store = MemoryCheckpointStore::new();
        let state = WorkflowState::new("t", "r");
        for _ in 0..5 {
            store.append("t", &state).await.unwrap();
        }

        assert_eq!(store.prune("t", 2).await.unwrap(), 3);
        let history = store.history("t").await.unwrap();
        assert_eq!(
            history.iter().map(|c| c.sequence_number).collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert_eq!(store.append("t", &state).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_distinct_sequences() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.append("t", &WorkflowState::new("t", "r")).await.unwrap()
            }));
        }

        let mut sequences = Vec::new();
        for handle in handles {
            sequences.push(handle.await.unwrap());
        }
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=10).collect::<Vec<u64>>());
    }
}
