//! Recovery action dispatch
//!
//! Maps classified health onto runtime actions: an advisory poke for workers
//! in `warning` (bounded per episode by the violation tracker) and, when the
//! operator opted in, a kill for workers in `stuck`. Actions never touch the
//! recorded health state. A failed action on one worker becomes an `error`
//! event and does not affect the others.

use crate::supervisor::Shared;
use chrono::{DateTime, Utc};
use drover_core::events::SupervisorEvent;
use drover_core::types::{HealthSnapshot, HealthState};
use drover_core::violations::{NudgeDecision, ViolationKind};
use futures::future::join_all;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Actions taken during one dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Workers that received a poke
    pub poked: Vec<String>,
    /// Workers that were killed
    pub killed: Vec<String>,
    /// Workers in warning whose nudge budget is spent
    pub exhausted: Vec<String>,
}

/// Poke warning workers and kill stuck ones, per policy.
///
/// Workers in `skip_kill` (a handoff is replacing them) are never killed here.
pub(crate) async fn dispatch(
    shared: &Shared,
    snapshots: &[HealthSnapshot],
    skip_kill: &HashSet<String>,
    now: DateTime<Utc>,
) -> RecoveryReport {
    let monitor = &shared.config.monitor;
    let mut report = RecoveryReport::default();
    let mut pokes = Vec::new();
    let mut kills = Vec::new();

    {
        let mut state = shared.state.lock().await;
        state.violations.prune(now, monitor.violation_retention);

        for snapshot in snapshots {
            match snapshot.state {
                HealthState::Healthy => {
                    if state.violations.resolve(&snapshot.worker_id) > 0 {
                        debug!(worker_id = %snapshot.worker_id, "Violations resolved");
                    }
                }
                HealthState::Warning if monitor.poke_on_warning => {
                    match state
                        .violations
                        .record_nudge(&snapshot.worker_id, ViolationKind::Idle, now)
                    {
                        NudgeDecision::Send(nudge) => pokes.push((snapshot.worker_id.clone(), nudge)),
                        NudgeDecision::Exhausted => {
                            debug!(worker_id = %snapshot.worker_id, "Nudge budget spent, not poking");
                            report.exhausted.push(snapshot.worker_id.clone());
                        }
                    }
                }
                HealthState::Stuck
                    if monitor.kill_on_stuck && !skip_kill.contains(&snapshot.worker_id) =>
                {
                    state.orderly_stops.insert(snapshot.worker_id.clone());
                    kills.push(snapshot.clone());
                }
                _ => {}
            }
        }
    }

    let poke_results = join_all(pokes.into_iter().map(|(worker_id, nudge)| async move {
        let result = shared
            .runtime
            .send_message(&worker_id, &monitor.poke_message)
            .await;
        (worker_id, nudge, result)
    }));
    let kill_results = join_all(kills.into_iter().map(|snapshot| async move {
        let result = shared.runtime.kill(&snapshot.worker_id).await;
        (snapshot, result)
    }));
    let (poke_results, kill_results) = futures::future::join(poke_results, kill_results).await;

    for (worker_id, nudge, result) in poke_results {
        match result {
            Ok(()) => {
                debug!(worker_id = %worker_id, nudge, "Poked idle worker");
                shared.publish(SupervisorEvent::PokedAgent {
                    worker_id: worker_id.clone(),
                    nudge,
                    timestamp: Utc::now(),
                });
                report.poked.push(worker_id);
            }
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Failed to poke worker");
                shared.publish(SupervisorEvent::error(
                    Some(&worker_id),
                    format!("poke failed: {}", e),
                ));
            }
        }
    }

    let mut state = shared.state.lock().await;
    for (snapshot, result) in kill_results {
        let worker_id = snapshot.worker_id;
        match result {
            Ok(()) => {
                info!(worker_id = %worker_id, reason = %snapshot.reason, "Killed stuck worker");
                state.classifier.record_kill(&worker_id);
                shared.publish(SupervisorEvent::KilledAgent {
                    worker_id: worker_id.clone(),
                    reason: snapshot.reason,
                    timestamp: Utc::now(),
                });
                report.killed.push(worker_id);
            }
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Failed to kill stuck worker");
                state.orderly_stops.remove(&worker_id);
                shared.publish(SupervisorEvent::error(
                    Some(&worker_id),
                    format!("kill failed: {}", e),
                ));
            }
        }
    }

    report
}
