//! Durable local state
//!
//! - [`write_json_atomic`] writes a temp file next to the target and renames it
//!   over the target, so a crash mid-write leaves the previous version intact.
//! - [`EventLog`] appends one JSON line per record and never rewrites history.
//! - [`RunningMarker`] stamps the state directory with the owning process so
//!   only one supervisor monitors a fleet at a time.

use crate::error::{DroverError, Result};
use crate::handoff::HandoffEvent;
use crate::rotation::RotationRecord;
use crate::types::HealthState;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Serialize `value` and atomically replace `path` with it
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            DroverError::Storage(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }

    let payload = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, payload).map_err(|e| {
        DroverError::Storage(format!("Failed to write {}: {}", tmp_path.display(), e))
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        DroverError::Storage(format!("Failed to commit {}: {}", path.display(), e))
    })?;
    Ok(())
}

/// Read JSON from `path`, treating a missing file as the default value
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => {
            return Err(DroverError::Storage(format!(
                "Failed to read {}: {}",
                path.display(),
                err
            )));
        }
    };
    Ok(serde_json::from_slice(&data)?)
}

/// Entry kinds recorded in the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    /// A worker's health state changed
    HealthTransition {
        /// Previous state, absent on first classification
        from: Option<HealthState>,
        /// New state
        to: HealthState,
        /// Classifier explanation
        reason: String,
    },
    /// A handoff was attempted
    Handoff(HandoffEvent),
    /// A specialist session was rotated
    SessionRotated(RotationRecord),
}

/// One timestamped, worker-keyed event log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// When the record was written
    pub timestamp: DateTime<Utc>,
    /// Worker the record concerns
    pub worker_id: String,
    /// What happened
    pub entry: LogEntry,
}

impl LogRecord {
    /// Create a record stamped now
    pub fn now(worker_id: impl Into<String>, entry: LogEntry) -> Self {
        Self {
            timestamp: Utc::now(),
            worker_id: worker_id.into(),
            entry,
        }
    }
}

/// Append-only NDJSON log of health transitions, handoffs and rotations
pub struct EventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventLog {
    /// Open a log at `path`; the file is created on first append
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record
    pub async fn append(&self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    /// Read every record, skipping lines that fail to parse
    pub fn read_all(&self) -> Result<Vec<LogRecord>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => debug!(line = index + 1, error = %e, "Skipping unreadable event log line"),
            }
        }
        Ok(records)
    }

    /// Read the records concerning one worker
    pub fn read_for_worker(&self, worker_id: &str) -> Result<Vec<LogRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.worker_id == worker_id)
            .collect())
    }
}

/// Process-stamped marker showing which supervisor owns monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningMarker {
    /// Owning process id
    pub pid: u32,
    /// When monitoring started
    pub started_at: DateTime<Utc>,
}

/// What the running marker says about the state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerStatus {
    /// A live process owns monitoring
    Running(RunningMarker),
    /// The marker points at a process that no longer exists
    Stale(RunningMarker),
    /// No marker
    NotRunning,
}

impl RunningMarker {
    /// Inspect the marker without modifying it
    pub fn inspect(path: &Path) -> Result<MarkerStatus> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(MarkerStatus::NotRunning);
            }
            Err(err) => return Err(err.into()),
        };

        let marker: RunningMarker = match serde_json::from_slice(&data) {
            Ok(marker) => marker,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable running marker");
                return Ok(MarkerStatus::NotRunning);
            }
        };

        if is_pid_alive(marker.pid) {
            Ok(MarkerStatus::Running(marker))
        } else {
            Ok(MarkerStatus::Stale(marker))
        }
    }

    /// Claim monitoring for this process.
    ///
    /// # Errors
    ///
    /// Returns [`DroverError::AlreadyRunning`] if another live process owns the marker.
    pub fn acquire(path: &Path) -> Result<RunningMarker> {
        let own_pid = std::process::id();
        match Self::inspect(path)? {
            MarkerStatus::Running(existing) if existing.pid != own_pid => {
                return Err(DroverError::AlreadyRunning { pid: existing.pid });
            }
            MarkerStatus::Stale(stale) => {
                warn!(pid = stale.pid, "Removing stale running marker");
                std::fs::remove_file(path)?;
            }
            _ => {}
        }

        let marker = RunningMarker {
            pid: own_pid,
            started_at: Utc::now(),
        };
        write_json_atomic(path, &marker)?;
        Ok(marker)
    }

    /// Remove the marker if this process owns it
    pub fn release(path: &Path) -> Result<()> {
        match Self::inspect(path)? {
            MarkerStatus::Running(marker) | MarkerStatus::Stale(marker)
                if marker.pid == std::process::id() =>
            {
                std::fs::remove_file(path)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Whether a process with this pid exists
pub fn is_pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).is_some()
}
