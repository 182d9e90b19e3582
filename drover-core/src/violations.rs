//! Repeated-nudge tracking
//!
//! Each unresolved policy violation of a worker keeps a nudge counter. Nudges
//! are sent until the counter reaches `max_nudges`; after that the tracker
//! reports the episode as exhausted so the worker is not spammed. A worker
//! that recovers resolves its records, and stale records are pruned after a
//! retention window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Kind of policy violation a nudge answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// No activity past the ping timeout
    Idle,
}

/// Nudges sent to one worker for one violation kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// Worker id
    pub worker_id: String,
    /// Violation kind
    pub kind: ViolationKind,
    /// Nudges sent in this episode
    pub nudge_count: u32,
    /// When the last nudge was sent
    pub last_nudge: DateTime<Utc>,
    /// Worker complied
    pub resolved: bool,
}

/// Whether to send a nudge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NudgeDecision {
    /// Send the nudge; carries the 1-based nudge number
    Send(u32),
    /// Nudge budget spent for this episode
    Exhausted,
}

/// Tracks nudges per (worker, kind)
#[derive(Debug, Default)]
pub struct ViolationTracker {
    max_nudges: u32,
    records: HashMap<(String, ViolationKind), ViolationRecord>,
}

impl ViolationTracker {
    /// Create a tracker allowing `max_nudges` per episode
    pub fn new(max_nudges: u32) -> Self {
        Self {
            max_nudges,
            records: HashMap::new(),
        }
    }

    /// Count a nudge for an unresolved violation, opening one if needed
    pub fn record_nudge(
        &mut self,
        worker_id: &str,
        kind: ViolationKind,
        now: DateTime<Utc>,
    ) -> NudgeDecision {
        let record = self
            .records
            .entry((worker_id.to_string(), kind))
            .or_insert_with(|| ViolationRecord {
                worker_id: worker_id.to_string(),
                kind,
                nudge_count: 0,
                last_nudge: now,
                resolved: false,
            });

        if record.nudge_count >= self.max_nudges {
            return NudgeDecision::Exhausted;
        }

        record.nudge_count += 1;
        record.last_nudge = now;
        NudgeDecision::Send(record.nudge_count)
    }

    /// Resolve and drop every record of a worker; returns how many were open
    pub fn resolve(&mut self, worker_id: &str) -> usize {
        let before = self.records.len();
        self.records.retain(|(id, _), record| {
            if id == worker_id {
                record.resolved = true;
                false
            } else {
                true
            }
        });
        before - self.records.len()
    }

    /// Drop records whose last nudge is older than `retention`
    pub fn prune(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return 0;
        };
        let before = self.records.len();
        self.records.retain(|_, record| record.last_nudge >= cutoff);
        before - self.records.len()
    }

    /// Open record for a worker and kind
    pub fn get(&self, worker_id: &str, kind: ViolationKind) -> Option<&ViolationRecord> {
        self.records.get(&(worker_id.to_string(), kind))
    }

    /// Number of open records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records are open
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
