//! Contracts for the external worker runtime and worker store

use crate::error::Result;
use crate::types::{
    ActivitySignal, HandoffSignals, HistoryItem, SpawnParams, SpawnedWorker, TokenUsage,
    WorkerRecord,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Process/session runtime that actually spawns, signals and messages workers
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Ids of all workers currently running
    async fn running_workers(&self) -> Result<Vec<String>>;

    /// Spawn a worker
    async fn spawn(&self, params: SpawnParams) -> Result<SpawnedWorker>;

    /// Terminate a worker
    async fn kill(&self, worker_id: &str) -> Result<()>;

    /// Send a message into the worker's session
    async fn send_message(&self, worker_id: &str, text: &str) -> Result<()>;

    /// Cumulative token usage of the worker's current session
    async fn token_usage(&self, worker_id: &str) -> Result<TokenUsage>;

    /// Latest activity per source that reported for this worker
    async fn activity(&self, worker_id: &str) -> Result<Vec<ActivitySignal>>;

    /// Whether the worker's underlying process still exists
    async fn is_alive(&self, worker_id: &str) -> Result<bool>;
}

/// Per-worker records written by the spawning layer
#[async_trait]
pub trait WorkerStore: Send + Sync {
    /// Look up a worker record
    async fn get(&self, worker_id: &str) -> Result<Option<WorkerRecord>>;

    /// Insert or replace a worker record
    async fn save(&self, record: WorkerRecord) -> Result<()>;

    /// Remove a worker record
    async fn remove(&self, worker_id: &str) -> Result<()>;

    /// Conditions that may warrant a handoff
    async fn handoff_signals(&self, _worker_id: &str) -> Result<HandoffSignals> {
        Ok(HandoffSignals::default())
    }

    /// Worker history, oldest first
    async fn history(&self, _worker_id: &str) -> Result<Vec<HistoryItem>> {
        Ok(Vec::new())
    }
}

/// In-memory worker store
#[derive(Default)]
pub struct InMemoryWorkerStore {
    records: Arc<RwLock<HashMap<String, WorkerRecord>>>,
    signals: Arc<RwLock<HashMap<String, HandoffSignals>>>,
    history: Arc<RwLock<HashMap<String, Vec<HistoryItem>>>>,
}

impl InMemoryWorkerStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Set handoff signals for a worker
    pub async fn set_signals(&self, worker_id: &str, signals: HandoffSignals) {
        self.signals
            .write()
            .await
            .insert(worker_id.to_string(), signals);
    }

    /// Append a history item for a worker
    pub async fn push_history(&self, worker_id: &str, item: HistoryItem) {
        self.history
            .write()
            .await
            .entry(worker_id.to_string())
            .or_default()
            .push(item);
    }

    /// All stored records
    pub async fn records(&self) -> Vec<WorkerRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl WorkerStore for InMemoryWorkerStore {
    async fn get(&self, worker_id: &str) -> Result<Option<WorkerRecord>> {
        Ok(self.records.read().await.get(worker_id).cloned())
    }

    async fn save(&self, record: WorkerRecord) -> Result<()> {
        self.records.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn remove(&self, worker_id: &str) -> Result<()> {
        self.records.write().await.remove(worker_id);
        self.signals.write().await.remove(worker_id);
        Ok(())
    }

    async fn handoff_signals(&self, worker_id: &str) -> Result<HandoffSignals> {
        Ok(self
            .signals
            .read()
            .await
            .get(worker_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn history(&self, worker_id: &str) -> Result<Vec<HistoryItem>> {
        Ok(self
            .history
            .read()
            .await
            .get(worker_id)
            .cloned()
            .unwrap_or_default())
    }
}
