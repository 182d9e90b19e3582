//! Mass-death circuit breaker
//!
//! Counts worker deaths in a trailing window and pauses all new spawns when
//! too many happen at once. Unlike a request circuit breaker it never moves
//! to half-open on its own: once tripped it stays tripped until an operator
//! resumes spawning.

use crate::config::BreakerConfig;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Spawns allowed
    Closed,
    /// Spawns paused until an operator resumes
    Tripped,
}

/// Append `now` to the death window, drop entries older than `window`, and
/// report whether the pruned window reaches `threshold`.
pub fn record_death(
    deaths: &[DateTime<Utc>],
    now: DateTime<Utc>,
    window: Duration,
    threshold: usize,
) -> (Vec<DateTime<Utc>>, bool) {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    let cutoff = now.checked_sub_signed(window);

    let mut pruned: Vec<DateTime<Utc>> = deaths
        .iter()
        .copied()
        .filter(|t| cutoff.is_none_or(|cutoff| *t >= cutoff))
        .collect();
    pruned.push(now);
    pruned.sort();

    let reached = pruned.len() >= threshold;
    (pruned, reached)
}

/// Fleet-wide death counter that pauses spawning
#[derive(Debug, Clone)]
pub struct MassDeathBreaker {
    window: Duration,
    threshold: usize,
    deaths: Vec<DateTime<Utc>>,
    state: BreakerState,
}

impl MassDeathBreaker {
    /// Create a closed breaker
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            deaths: Vec::new(),
            state: BreakerState::Closed,
        }
    }

    /// Record a death; returns true only on the death that trips the breaker
    pub fn record(&mut self, now: DateTime<Utc>) -> bool {
        let (deaths, reached) = record_death(&self.deaths, now, self.window, self.threshold);
        self.deaths = deaths;

        if reached && self.state == BreakerState::Closed {
            self.state = BreakerState::Tripped;
            return true;
        }
        false
    }

    /// Whether new spawns are paused
    pub fn spawns_paused(&self) -> bool {
        self.state == BreakerState::Tripped
    }

    /// Current state
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Deaths currently in the window
    pub fn recent_deaths(&self) -> usize {
        self.deaths.len()
    }

    /// Operator acknowledgement: close the breaker and empty the window.
    ///
    /// Returns whether the breaker was tripped.
    pub fn resume(&mut self) -> bool {
        let was_tripped = self.state == BreakerState::Tripped;
        self.state = BreakerState::Closed;
        self.deaths.clear();
        was_tripped
    }
}

impl From<&BreakerConfig> for MassDeathBreaker {
    fn from(config: &BreakerConfig) -> Self {
        Self::new(config.window, config.threshold)
    }
}
