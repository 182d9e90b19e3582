//! Tiered memory and specialist session state
//!
//! Long-lived specialist workers accumulate context without bound. When a
//! session's cumulative token usage reaches the rotation threshold, its
//! history is compressed into a [`TieredMemory`] artifact (recent items in
//! full, older items summarized, the oldest reduced to references) and a
//! fresh session is seeded with it.

use crate::types::{HistoryItem, TokenUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Whether cumulative usage has reached the rotation threshold
pub fn needs_rotation(usage: &TokenUsage, threshold: u64) -> bool {
    usage.total() >= threshold
}

/// Recency-biased memory artifact
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TieredMemory {
    /// Most recent items, newest last, at full detail
    pub full: Vec<HistoryItem>,
    /// Following items as (reference, summary), newest last
    pub summaries: Vec<(String, String)>,
    /// Everything older, references only
    pub index: Vec<String>,
}

impl TieredMemory {
    /// Split `history` (oldest first) into tiers: the last `full_items` at full
    /// detail, the `summary_items` before them as summaries, the rest as references.
    pub fn build(history: &[HistoryItem], full_items: usize, summary_items: usize) -> Self {
        let total = history.len();
        let full_start = total.saturating_sub(full_items);
        let summary_start = full_start.saturating_sub(summary_items);

        Self {
            full: history[full_start..].to_vec(),
            summaries: history[summary_start..full_start]
                .iter()
                .map(|item| (item.reference.clone(), item.summary.clone()))
                .collect(),
            index: history[..summary_start]
                .iter()
                .map(|item| item.reference.clone())
                .collect(),
        }
    }

    /// Number of history items the artifact covers
    pub fn len(&self) -> usize {
        self.full.len() + self.summaries.len() + self.index.len()
    }

    /// Whether the artifact covers no history
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render as the initial context of a fresh session
    pub fn render(&self) -> String {
        let mut out = String::from("# Context carried over from the previous session\n");

        if !self.index.is_empty() {
            out.push_str("\n## Earlier work (references)\n");
            for reference in &self.index {
                let _ = writeln!(out, "- {}", reference);
            }
        }

        if !self.summaries.is_empty() {
            out.push_str("\n## Recent work (summaries)\n");
            for (reference, summary) in &self.summaries {
                let _ = writeln!(out, "- [{}] {}", reference, summary);
            }
        }

        if !self.full.is_empty() {
            out.push_str("\n## Latest work (full detail)\n");
            for item in &self.full {
                let _ = writeln!(
                    out,
                    "\n### {} ({})\n{}",
                    item.reference,
                    item.timestamp.to_rfc3339(),
                    item.content
                );
            }
        }

        out
    }
}

/// Old-to-new session mapping recorded on rotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationRecord {
    /// Specialist name
    pub specialist: String,
    /// Session torn down
    pub old_session: Option<String>,
    /// Session started
    pub new_session: String,
    /// Cumulative tokens when the rotation happened
    pub tokens_at_rotation: u64,
    /// History items carried in the artifact
    pub items_carried: usize,
    /// When the rotation happened
    pub rotated_at: DateTime<Utc>,
}

/// Session bookkeeping for one long-lived specialist worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialistSessionState {
    /// Specialist name
    pub name: String,
    /// Worker identity the specialist runs as
    pub worker_id: String,
    /// Current session
    pub session_id: Option<String>,
    /// Tokens used across all sessions
    pub cumulative_tokens: u64,
    /// Rotations performed, oldest first
    pub rotations: Vec<RotationRecord>,
}

impl SpecialistSessionState {
    /// Create state for a newly registered specialist
    pub fn new(name: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker_id: worker_id.into(),
            session_id: None,
            cumulative_tokens: 0,
            rotations: Vec::new(),
        }
    }

    /// Apply a completed rotation
    pub fn record_rotation(&mut self, record: RotationRecord) {
        self.cumulative_tokens += record.tokens_at_rotation;
        self.session_id = Some(record.new_session.clone());
        self.rotations.push(record);
    }
}
