//! Shared data model for supervised workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Record of one worker, written by the spawning layer and read for restart/handoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Worker id
    pub id: String,
    /// Unit of work (external ticket) the worker is assigned to
    pub unit_of_work_id: String,
    /// Model identifier the worker runs on
    pub model: String,
    /// Session handle used to resume the worker
    pub session_id: Option<String>,
    /// Workspace the worker operates in
    pub workspace: PathBuf,
    /// When the worker was spawned
    pub started_at: DateTime<Utc>,
    /// Last activity the runtime reported
    pub last_activity: Option<DateTime<Utc>>,
}

/// Where an activity signal came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    /// Output observed on the worker's terminal session
    Terminal,
    /// Modification time of files in the workspace
    FileModification,
    /// Version-control activity (commits, index changes)
    VersionControl,
    /// Explicit heartbeat from the worker
    Heartbeat,
}

impl std::fmt::Display for SignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalSource::Terminal => write!(f, "terminal"),
            SignalSource::FileModification => write!(f, "file_modification"),
            SignalSource::VersionControl => write!(f, "version_control"),
            SignalSource::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

/// Timestamped, sourced, confidence-weighted liveness indicator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySignal {
    /// When the activity happened
    pub timestamp: DateTime<Utc>,
    /// Which probe observed it
    pub source: SignalSource,
    /// Confidence in the signal (0.0 - 1.0)
    pub confidence: f64,
}

impl ActivitySignal {
    /// Create a signal
    pub fn new(timestamp: DateTime<Utc>, source: SignalSource, confidence: f64) -> Self {
        Self {
            timestamp,
            source,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Discrete health state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Recent activity within the ping timeout
    Healthy,
    /// Over the ping timeout, below the stuck threshold
    Warning,
    /// Over the ping timeout for the configured number of checks
    Stuck,
    /// Underlying process no longer exists
    Dead,
}

impl HealthState {
    /// Whether an operator should look at this worker
    pub fn needs_attention(&self) -> bool {
        !matches!(self, HealthState::Healthy)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Warning => write!(f, "warning"),
            HealthState::Stuck => write!(f, "stuck"),
            HealthState::Dead => write!(f, "dead"),
        }
    }
}

/// Most recent health classification of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Worker id
    pub worker_id: String,
    /// Classified state
    pub state: HealthState,
    /// Human-readable explanation
    pub reason: String,
    /// Timestamp of the signal used, if any
    pub last_ping: Option<DateTime<Utc>>,
    /// Consecutive checks over the ping timeout
    pub consecutive_failures: u32,
    /// Times the supervisor has killed this worker
    pub kill_count: u32,
    /// Source of the signal used
    pub source: Option<SignalSource>,
    /// Confidence of the signal used
    pub confidence: f64,
}

/// Token usage reported by the runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input tokens consumed
    pub input: u64,
    /// Output tokens produced
    pub output: u64,
}

impl TokenUsage {
    /// Input plus output
    pub fn total(&self) -> u64 {
        self.input + self.output
    }

    /// Usage accrued since `earlier`, saturating when the runtime counter went backwards
    pub fn since(&self, earlier: &TokenUsage) -> TokenUsage {
        TokenUsage {
            input: self.input.saturating_sub(earlier.input),
            output: self.output.saturating_sub(earlier.output),
        }
    }

    /// Usage to bill on top of `baseline`. A counter below the baseline
    /// means the runtime started a fresh session, so all of it is new.
    pub fn accrued_since(&self, baseline: &TokenUsage) -> TokenUsage {
        if self.input < baseline.input || self.output < baseline.output {
            *self
        } else {
            self.since(baseline)
        }
    }
}

/// Parameters for spawning a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnParams {
    /// Reuse this identity instead of issuing a new id
    pub worker_id: Option<String>,
    /// Unit of work the worker is bound to
    pub unit_of_work_id: String,
    /// Model to run
    pub model: String,
    /// Workspace to operate in
    pub workspace: PathBuf,
    /// Session to resume
    pub resume_session: Option<String>,
    /// Context handed to the fresh session
    pub initial_context: Option<String>,
}

impl SpawnParams {
    /// Parameters that resume `record` under the same identity
    pub fn resume(record: &WorkerRecord) -> Self {
        Self {
            worker_id: Some(record.id.clone()),
            unit_of_work_id: record.unit_of_work_id.clone(),
            model: record.model.clone(),
            workspace: record.workspace.clone(),
            resume_session: record.session_id.clone(),
            initial_context: None,
        }
    }
}

/// Identity of a freshly spawned worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnedWorker {
    /// Worker id
    pub id: String,
    /// Session handle
    pub session_id: String,
}

/// One entry of a worker's history, used to build rotation memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    /// Stable reference (message id, commit, file)
    pub reference: String,
    /// One-line summary
    pub summary: String,
    /// Full content
    pub content: String,
    /// When the item was produced
    pub timestamp: DateTime<Utc>,
}

/// Per-worker conditions reported by the spawning layer that may warrant a handoff
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffSignals {
    /// Consecutive failing test runs
    pub failing_test_runs: u32,
    /// Worker finished planning
    pub planning_complete: bool,
    /// Worker reports its task complete
    pub task_complete: bool,
    /// Operator requested a handoff to this model
    pub manual_target: Option<String>,
}
