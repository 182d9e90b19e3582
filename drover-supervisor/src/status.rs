//! Aggregate fleet status for polling

use chrono::{DateTime, Utc};
use drover_core::types::{HealthSnapshot, HealthState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point-in-time summary of the fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetStatus {
    /// When the summary was taken
    pub timestamp: DateTime<Utc>,
    /// Monitoring loop is live
    pub running: bool,
    /// Mass-death breaker is tripped
    pub spawns_paused: bool,
    /// Workers seen on the last tick
    pub total_workers: usize,
    /// Workers per health state
    pub counts: BTreeMap<HealthState, usize>,
    /// Workers not healthy, sorted
    pub needs_attention: Vec<String>,
    /// Workers whose automatic restarts stopped
    pub gave_up: Vec<String>,
    /// Deaths in the current breaker window
    pub recent_deaths: usize,
    /// Fleet spend today
    pub daily_spend: f64,
}

/// Count snapshots per state; every state is present even at zero
pub fn count_states<'a>(
    snapshots: impl IntoIterator<Item = &'a HealthSnapshot>,
) -> BTreeMap<HealthState, usize> {
    let mut counts: BTreeMap<HealthState, usize> = [
        HealthState::Healthy,
        HealthState::Warning,
        HealthState::Stuck,
        HealthState::Dead,
    ]
    .into_iter()
    .map(|state| (state, 0))
    .collect();

    for snapshot in snapshots {
        *counts.entry(snapshot.state).or_insert(0) += 1;
    }
    counts
}

impl FleetStatus {
    /// Workers in `state`
    pub fn count(&self, state: HealthState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }
}

impl std::fmt::Display for FleetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Supervisor: {}{}",
            if self.running { "running" } else { "stopped" },
            if self.spawns_paused { " (spawns paused)" } else { "" }
        )?;
        writeln!(
            f,
            "Workers: {} total, {} healthy, {} warning, {} stuck, {} dead",
            self.total_workers,
            self.count(HealthState::Healthy),
            self.count(HealthState::Warning),
            self.count(HealthState::Stuck),
            self.count(HealthState::Dead)
        )?;
        if !self.needs_attention.is_empty() {
            writeln!(f, "Needs attention: {}", self.needs_attention.join(", "))?;
        }
        if !self.gave_up.is_empty() {
            writeln!(f, "Gave up: {}", self.gave_up.join(", "))?;
        }
        write!(f, "Spend today: ${:.2}", self.daily_spend)
    }
}
