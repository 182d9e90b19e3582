//! Health classification for supervised workers
//!
//! Turns the activity signals a runtime reports for a worker into a discrete
//! [`HealthState`]. Two pieces cooperate:
//!
//! - a [`SignalReconciler`] picks one signal out of the per-source signals
//!   (terminal output, file mtimes, version control, heartbeats);
//! - the [`HealthClassifier`] compares that signal's age with the ping timeout
//!   and counts consecutive over-threshold checks per worker.
//!
//! A single fresh signal resets the counter and returns the worker to
//! `healthy`; a dead process overrides everything else.

use crate::types::{ActivitySignal, HealthSnapshot, HealthState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Policy for choosing one activity signal when several sources report
pub trait SignalReconciler: Send + Sync {
    /// Pick the signal used for classification
    fn reconcile(&self, signals: &[ActivitySignal]) -> Option<ActivitySignal>;

    /// Get the policy name
    fn name(&self) -> &'static str;
}

/// The most recent signal wins regardless of source
#[derive(Debug, Clone, Copy, Default)]
pub struct MostRecentWins;

impl SignalReconciler for MostRecentWins {
    fn reconcile(&self, signals: &[ActivitySignal]) -> Option<ActivitySignal> {
        signals.iter().max_by_key(|s| s.timestamp).cloned()
    }

    fn name(&self) -> &'static str {
        "most_recent_wins"
    }
}

/// Ignore signals below a confidence floor, then delegate
pub struct ConfidenceFloor<R: SignalReconciler> {
    floor: f64,
    fallback: R,
}

impl<R: SignalReconciler> ConfidenceFloor<R> {
    /// Create a confidence floor in front of `fallback`
    pub fn new(floor: f64, fallback: R) -> Self {
        Self {
            floor: floor.clamp(0.0, 1.0),
            fallback,
        }
    }
}

impl<R: SignalReconciler> SignalReconciler for ConfidenceFloor<R> {
    fn reconcile(&self, signals: &[ActivitySignal]) -> Option<ActivitySignal> {
        let trusted: Vec<ActivitySignal> = signals
            .iter()
            .filter(|s| s.confidence >= self.floor)
            .cloned()
            .collect();
        self.fallback.reconcile(&trusted)
    }

    fn name(&self) -> &'static str {
        "confidence_floor"
    }
}

#[derive(Debug, Clone, Default)]
struct WorkerHealth {
    consecutive_failures: u32,
    kill_count: u32,
    last_state: Option<HealthState>,
}

/// Result of classifying one worker
#[derive(Debug, Clone)]
pub struct Classification {
    /// The new snapshot
    pub snapshot: HealthSnapshot,
    /// State recorded on the previous check, if any
    pub previous: Option<HealthState>,
}

impl Classification {
    /// Whether the state changed since the previous check
    pub fn transitioned(&self) -> bool {
        self.previous != Some(self.snapshot.state)
    }
}

/// Per-worker health state machine
#[derive(Debug)]
pub struct HealthClassifier {
    ping_timeout: Duration,
    stuck_threshold: u32,
    workers: HashMap<String, WorkerHealth>,
}

impl HealthClassifier {
    /// Create a classifier
    pub fn new(ping_timeout: Duration, stuck_threshold: u32) -> Self {
        Self {
            ping_timeout,
            stuck_threshold: stuck_threshold.max(1),
            workers: HashMap::new(),
        }
    }

    /// Classify a worker from its reconciled signal.
    ///
    /// `signal` is `None` when no source has reported; that counts as an
    /// over-threshold check.
    pub fn classify(
        &mut self,
        worker_id: &str,
        signal: Option<&ActivitySignal>,
        alive: bool,
        now: DateTime<Utc>,
    ) -> Classification {
        let stuck_threshold = self.stuck_threshold;
        let ping_timeout = self.ping_timeout;
        let health = self.workers.entry(worker_id.to_string()).or_default();
        let previous = health.last_state;

        let idle = signal.map(|s| {
            now.signed_duration_since(s.timestamp)
                .to_std()
                .unwrap_or(Duration::ZERO)
        });

        let (state, reason) = if !alive {
            (HealthState::Dead, "process no longer exists".to_string())
        } else {
            match idle {
                Some(idle) if idle < ping_timeout => {
                    health.consecutive_failures = 0;
                    (
                        HealthState::Healthy,
                        format!("active {}s ago", idle.as_secs()),
                    )
                }
                _ => {
                    health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                    let detail = match idle {
                        Some(idle) => format!("no activity for {}s", idle.as_secs()),
                        None => "no activity reported".to_string(),
                    };
                    if health.consecutive_failures >= stuck_threshold {
                        (
                            HealthState::Stuck,
                            format!(
                                "{} ({} consecutive checks)",
                                detail, health.consecutive_failures
                            ),
                        )
                    } else {
                        (
                            HealthState::Warning,
                            format!(
                                "{} ({}/{} checks)",
                                detail, health.consecutive_failures, stuck_threshold
                            ),
                        )
                    }
                }
            }
        };

        health.last_state = Some(state);

        Classification {
            snapshot: HealthSnapshot {
                worker_id: worker_id.to_string(),
                state,
                reason,
                last_ping: signal.map(|s| s.timestamp),
                consecutive_failures: health.consecutive_failures,
                kill_count: health.kill_count,
                source: signal.map(|s| s.source),
                confidence: signal.map(|s| s.confidence).unwrap_or(0.0),
            },
            previous,
        }
    }

    /// Record that the supervisor killed this worker
    pub fn record_kill(&mut self, worker_id: &str) {
        let health = self.workers.entry(worker_id.to_string()).or_default();
        health.kill_count = health.kill_count.saturating_add(1);
    }

    /// Drop state for a worker that left the running set
    pub fn forget(&mut self, worker_id: &str) {
        self.workers.remove(worker_id);
    }

    /// Last classified state of a worker
    pub fn last_state(&self, worker_id: &str) -> Option<HealthState> {
        self.workers.get(worker_id).and_then(|h| h.last_state)
    }
}
