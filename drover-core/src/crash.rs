//! Crash detection and restart bookkeeping

use crate::config::RestartConfig;
use crate::error::Result;
use crate::storage::{read_json_or_default, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ids that were running on the previous tick, are gone now, and were not stopped on purpose.
///
/// Matched orderly stops are removed from `orderly_stops`.
pub fn detect_crashes(
    previous: &HashSet<String>,
    current: &HashSet<String>,
    orderly_stops: &mut HashSet<String>,
) -> Vec<String> {
    let mut crashed: Vec<String> = previous
        .difference(current)
        .filter(|id| !orderly_stops.remove(*id))
        .cloned()
        .collect();
    crashed.sort();
    crashed
}

/// Crash history of one worker identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashTracker {
    /// Worker id
    pub worker_id: String,
    /// Crashes observed since the tracker was created or reset
    pub crash_count: u32,
    /// When the last crash was observed
    pub last_crash: DateTime<Utc>,
    /// When the scheduled restart fires
    pub next_retry: Option<DateTime<Utc>>,
    /// Automatic restarts stopped for this worker
    pub gave_up: bool,
}

/// What to do about a crash
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashDecision {
    /// Restart after `delay`
    Restart {
        /// Backoff delay
        delay: Duration,
        /// Crash number this restart answers
        attempt: u32,
    },
    /// Retry cap exceeded on this crash
    GiveUp {
        /// Total crashes observed
        crash_count: u32,
    },
    /// Already gave up earlier; nothing happens until an operator resets the tracker
    AlreadyGaveUp,
}

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    backoff: Vec<Duration>,
    max_retries: u32,
}

impl RestartPolicy {
    /// Create a policy. An empty sequence restarts immediately.
    pub fn new(backoff: Vec<Duration>, max_retries: u32) -> Self {
        Self {
            backoff,
            max_retries,
        }
    }

    /// Delay before restart number `crash_count` (1-based); the sequence caps at its last value
    pub fn delay_for(&self, crash_count: u32) -> Duration {
        if self.backoff.is_empty() {
            return Duration::ZERO;
        }
        let index = (crash_count.saturating_sub(1) as usize).min(self.backoff.len() - 1);
        self.backoff[index]
    }

    /// Crashes tolerated before giving up
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl From<&RestartConfig> for RestartPolicy {
    fn from(config: &RestartConfig) -> Self {
        Self::new(
            config
                .backoff_secs
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
            config.max_retries,
        )
    }
}

/// All crash trackers, one per worker identity, persisted atomically
#[derive(Debug)]
pub struct CrashRegistry {
    path: Option<PathBuf>,
    policy: RestartPolicy,
    trackers: BTreeMap<String, CrashTracker>,
}

impl CrashRegistry {
    /// Registry that is never persisted
    pub fn in_memory(policy: RestartPolicy) -> Self {
        Self {
            path: None,
            policy,
            trackers: BTreeMap::new(),
        }
    }

    /// Load persisted trackers from `path`
    pub fn load(path: impl AsRef<Path>, policy: RestartPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let trackers = read_json_or_default(&path)?;
        Ok(Self {
            path: Some(path),
            policy,
            trackers,
        })
    }

    /// Record a crash and decide what to do
    pub fn record_crash(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<CrashDecision> {
        let tracker = self
            .trackers
            .entry(worker_id.to_string())
            .or_insert_with(|| CrashTracker {
                worker_id: worker_id.to_string(),
                crash_count: 0,
                last_crash: now,
                next_retry: None,
                gave_up: false,
            });

        if tracker.gave_up {
            return Ok(CrashDecision::AlreadyGaveUp);
        }

        tracker.crash_count += 1;
        tracker.last_crash = now;

        let decision = if tracker.crash_count > self.policy.max_retries() {
            tracker.gave_up = true;
            tracker.next_retry = None;
            CrashDecision::GiveUp {
                crash_count: tracker.crash_count,
            }
        } else {
            let delay = self.policy.delay_for(tracker.crash_count);
            tracker.next_retry = chrono::Duration::from_std(delay)
                .ok()
                .map(|d| now + d);
            CrashDecision::Restart {
                delay,
                attempt: tracker.crash_count,
            }
        };

        self.persist()?;
        Ok(decision)
    }

    /// Clear a worker's tracker so automatic restarts resume
    pub fn reset(&mut self, worker_id: &str) -> Result<bool> {
        let removed = self.trackers.remove(worker_id).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Tracker of one worker
    pub fn get(&self, worker_id: &str) -> Option<&CrashTracker> {
        self.trackers.get(worker_id)
    }

    /// All trackers
    pub fn trackers(&self) -> impl Iterator<Item = &CrashTracker> {
        self.trackers.values()
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.path {
            write_json_atomic(path, &self.trackers)?;
        }
        Ok(())
    }
}
