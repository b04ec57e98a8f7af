//! External collaborators: result persistence and the workflow engine handle.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::RwLock;

use agentrun_core::{Task, TaskId};

use crate::error::{EngineError, StoreError};

/// Best-effort persistence of finished tasks.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist a finished task.
    async fn store(&self, task: &Task) -> Result<(), StoreError>;

    /// Most recently stored results, newest first, at most `limit`.
    async fn get_last(&self, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// Release connections. Called once during shutdown.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Bounded in-memory [`ResultStore`].
#[derive(Debug)]
pub struct MemoryResultStore {
    capacity: usize,
    entries: RwLock<VecDeque<Task>>,
    closed: RwLock<bool>,
}

impl MemoryResultStore {
    /// Keep at most `capacity` results (minimum 1); older ones are dropped.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(VecDeque::new()),
            closed: RwLock::new(false),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Look up the latest stored result for a task.
    pub async fn get(&self, id: &TaskId) -> Option<Task> {
        self.entries
            .read()
            .await
            .iter()
            .rev()
            .find(|t| &t.id == id)
            .cloned()
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }
}

impl Default for MemoryResultStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn store(&self, task: &Task) -> Result<(), StoreError> {
        if *self.closed.read().await {
            return Err(StoreError::Closed);
        }
        let mut entries = self.entries.write().await;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(task.clone());
        Ok(())
    }

    async fn get_last(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }

    async fn close(&self) -> Result<(), StoreError> {
        *self.closed.write().await = true;
        Ok(())
    }
}

/// Handle to a durable workflow engine, held for lifecycle only.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn close(&self) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_is_bounded() {
        let store = MemoryResultStore::new(2);
        let tasks: Vec<_> = (0..3)
            .map(|i| Task::new("parse", json!({})).with_id(format!("t{i}")))
            .collect();
        for task in &tasks {
            store.store(task).await.unwrap();
        }

        assert_eq!(store.len().await, 2);
        assert!(store.get(&TaskId::new("t0")).await.is_none());

        let last = store.get_last(10).await.unwrap();
        let ids: Vec<_> = last.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["t2", "t1"]);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_writes() {
        let store = MemoryResultStore::default();
        store.close().await.unwrap();
        assert!(store.is_closed().await);
        assert!(matches!(
            store.store(&Task::new("parse", json!({}))).await,
            Err(StoreError::Closed)
        ));
    }
}
