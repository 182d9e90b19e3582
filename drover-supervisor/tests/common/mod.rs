//! Scripted worker runtime for supervisor tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use drover_core::config::DroverConfig;
use drover_core::error::{DroverError, Result};
use drover_core::events::{EventReceiver, SupervisorEvent};
use drover_core::runtime::WorkerRuntime;
use drover_core::types::{
    ActivitySignal, SignalSource, SpawnParams, SpawnedWorker, TokenUsage, WorkerRecord,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct MockState {
    running: BTreeSet<String>,
    dead: HashSet<String>,
    activity: HashMap<String, DateTime<Utc>>,
    usage: HashMap<String, TokenUsage>,
    spawns: Vec<SpawnParams>,
    kills: Vec<String>,
    messages: Vec<(String, String)>,
    fail_spawns: bool,
    spawn_delay: Option<Duration>,
    fail_kills: HashSet<String>,
    fail_messages: HashSet<String>,
    next_id: u32,
}

/// In-memory runtime whose behaviour tests script directly
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Start a worker that was active just now
    pub fn add_worker(&self, id: &str) {
        let mut state = self.lock();
        state.running.insert(id.to_string());
        state.activity.insert(id.to_string(), Utc::now());
    }

    /// Remove a worker without going through `kill`
    pub fn crash(&self, id: &str) {
        self.lock().running.remove(id);
    }

    pub fn set_idle(&self, id: &str, secs: i64) {
        self.lock()
            .activity
            .insert(id.to_string(), Utc::now() - ChronoDuration::seconds(secs));
    }

    pub fn touch(&self, id: &str) {
        self.lock().activity.insert(id.to_string(), Utc::now());
    }

    pub fn set_dead(&self, id: &str) {
        self.lock().dead.insert(id.to_string());
    }

    pub fn set_usage(&self, id: &str, input: u64, output: u64) {
        self.lock()
            .usage
            .insert(id.to_string(), TokenUsage { input, output });
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.lock().fail_spawns = fail;
    }

    /// Make every spawn take `delay` before the worker appears
    pub fn slow_spawns(&self, delay: Duration) {
        self.lock().spawn_delay = Some(delay);
    }

    pub fn fail_kill(&self, id: &str) {
        self.lock().fail_kills.insert(id.to_string());
    }

    pub fn fail_message(&self, id: &str) {
        self.lock().fail_messages.insert(id.to_string());
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.lock().running.contains(id)
    }

    pub fn running(&self) -> Vec<String> {
        self.lock().running.iter().cloned().collect()
    }

    pub fn spawns(&self) -> Vec<SpawnParams> {
        self.lock().spawns.clone()
    }

    pub fn kills(&self) -> Vec<String> {
        self.lock().kills.clone()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.lock().messages.clone()
    }
}

#[async_trait]
impl WorkerRuntime for MockRuntime {
    async fn running_workers(&self) -> Result<Vec<String>> {
        Ok(self.running())
    }

    async fn spawn(&self, params: SpawnParams) -> Result<SpawnedWorker> {
        let delay = self.lock().spawn_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.fail_spawns {
            return Err(DroverError::Runtime("spawn refused".to_string()));
        }
        state.next_id += 1;
        let n = state.next_id;
        let id = params
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", n));
        state.running.insert(id.clone());
        state.activity.insert(id.clone(), Utc::now());
        state.usage.remove(&id);
        state.dead.remove(&id);
        state.spawns.push(params);
        Ok(SpawnedWorker {
            id,
            session_id: format!("session-{}", n),
        })
    }

    async fn kill(&self, worker_id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_kills.contains(worker_id) {
            return Err(DroverError::Runtime(format!("cannot kill {}", worker_id)));
        }
        state.running.remove(worker_id);
        state.kills.push(worker_id.to_string());
        Ok(())
    }

    async fn send_message(&self, worker_id: &str, text: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_messages.contains(worker_id) {
            return Err(DroverError::Runtime("session closed".to_string()));
        }
        state
            .messages
            .push((worker_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn token_usage(&self, worker_id: &str) -> Result<TokenUsage> {
        Ok(self.lock().usage.get(worker_id).copied().unwrap_or_default())
    }

    async fn activity(&self, worker_id: &str) -> Result<Vec<ActivitySignal>> {
        Ok(self
            .lock()
            .activity
            .get(worker_id)
            .map(|ts| vec![ActivitySignal::new(*ts, SignalSource::Terminal, 0.9)])
            .unwrap_or_default())
    }

    async fn is_alive(&self, worker_id: &str) -> Result<bool> {
        let state = self.lock();
        Ok(state.running.contains(worker_id) && !state.dead.contains(worker_id))
    }
}

/// Default config with durable state under `dir`
pub fn test_config(dir: &TempDir) -> DroverConfig {
    let mut config = DroverConfig::default();
    config.storage.state_dir = dir.path().to_path_buf();
    config
}

pub fn record(id: &str, model: &str) -> WorkerRecord {
    WorkerRecord {
        id: id.to_string(),
        unit_of_work_id: format!("ISSUE-{}", id),
        model: model.to_string(),
        session_id: Some(format!("{}-session", id)),
        workspace: PathBuf::from(format!("/work/{}", id)),
        started_at: Utc::now(),
        last_activity: None,
    }
}

/// Every event published so far
pub fn drain(rx: &mut EventReceiver) -> Vec<SupervisorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn count(events: &[SupervisorEvent], event_type: &str) -> usize {
    events
        .iter()
        .filter(|e| e.event_type() == event_type)
        .count()
}

/// Let spawned timer tasks run after the clock moved
pub async fn let_tasks_run() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
