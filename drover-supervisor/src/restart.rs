//! Deferred restarts of crashed workers
//!
//! Each restart is an independent one-shot timer. When it fires it resumes
//! the worker's last saved session under the same identity. A failed attempt
//! is reported but does not count as another crash; the next tick's
//! running-set diff stays the only crash signal.

use crate::supervisor::Shared;
use chrono::Utc;
use drover_core::events::SupervisorEvent;
use drover_core::types::{SpawnParams, WorkerRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Spawn the timer for one restart
pub(crate) fn schedule_restart(shared: Arc<Shared>, worker_id: String, delay: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                debug!(worker_id = %worker_id, "Restart abandoned, supervisor stopping");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        if let Err(message) = restart_worker(&shared, &worker_id).await {
            warn!(worker_id = %worker_id, error = %message, "Restart failed");
            shared.publish(SupervisorEvent::AgentRestartFailed {
                worker_id,
                error: message,
                timestamp: Utc::now(),
            });
        }
    });
}

async fn restart_worker(shared: &Shared, worker_id: &str) -> Result<(), String> {
    shared
        .ensure_spawns_allowed()
        .await
        .map_err(|e| e.to_string())?;

    let record = shared
        .store
        .get(worker_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no saved record for worker {}", worker_id))?;

    let spawned = shared
        .runtime
        .spawn(SpawnParams::resume(&record))
        .await
        .map_err(|e| e.to_string())?;

    shared.clear_orderly_stop(&spawned.id).await;
    shared
        .discard_if_stopped(&spawned.id)
        .await
        .map_err(|e| e.to_string())?;

    let restarted = WorkerRecord {
        id: spawned.id.clone(),
        session_id: Some(spawned.session_id),
        started_at: Utc::now(),
        ..record
    };
    if let Err(e) = shared.store.save(restarted).await {
        warn!(worker_id = %worker_id, error = %e, "Failed to save restarted worker record");
    }

    info!(worker_id = %worker_id, new_id = %spawned.id, "Worker restarted");
    Ok(())
}
