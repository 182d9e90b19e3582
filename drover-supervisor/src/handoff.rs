//! Handoff execution
//!
//! Replaces a worker with one on a different model, bound to the same unit of
//! work and workspace. The replacement is spawned first; the original is torn
//! down only once the spawn succeeded, so a failed spawn leaves the original
//! running. Every attempt ends in an immutable [`HandoffEvent`] appended to
//! the event log.

use crate::supervisor::Shared;
use chrono::Utc;
use drover_core::handoff::{HandoffEvent, HandoffTrigger};
use drover_core::storage::{LogEntry, LogRecord};
use drover_core::types::{SpawnParams, WorkerRecord};
use tracing::{info, warn};
use uuid::Uuid;

/// Run one handoff to completion and record it
pub(crate) async fn execute_handoff(
    shared: &Shared,
    record: WorkerRecord,
    trigger: &HandoffTrigger,
) -> HandoffEvent {
    let cost_at_handoff = shared.state.lock().await.ledger.worker_total(&record.id);

    let mut event = HandoffEvent {
        id: Uuid::new_v4(),
        worker_id: record.id.clone(),
        new_worker_id: None,
        unit_of_work_id: record.unit_of_work_id.clone(),
        source_model: record.model.clone(),
        target_model: trigger.target_model.clone(),
        trigger: trigger.kind,
        success: false,
        error: None,
        cost_at_handoff,
        timestamp: Utc::now(),
    };

    match replace_worker(shared, &record, trigger).await {
        Ok(new_worker_id) => {
            info!(
                worker_id = %record.id,
                new_worker_id = %new_worker_id,
                from = %record.model,
                to = %trigger.target_model,
                trigger = %trigger.kind,
                "Handoff completed"
            );
            event.new_worker_id = Some(new_worker_id);
            event.success = true;
        }
        Err((new_worker_id, message)) => {
            warn!(worker_id = %record.id, error = %message, "Handoff failed");
            event.new_worker_id = new_worker_id;
            event.error = Some(message);
        }
    }
    event.timestamp = Utc::now();

    shared
        .append_log(LogRecord::now(
            record.id.clone(),
            LogEntry::Handoff(event.clone()),
        ))
        .await;

    event
}

/// Spawn the replacement, then tear down the original.
///
/// On failure returns the replacement id if one was spawned.
async fn replace_worker(
    shared: &Shared,
    record: &WorkerRecord,
    trigger: &HandoffTrigger,
) -> Result<String, (Option<String>, String)> {
    shared
        .ensure_spawns_allowed()
        .await
        .map_err(|e| (None, e.to_string()))?;

    let params = SpawnParams {
        worker_id: None,
        unit_of_work_id: record.unit_of_work_id.clone(),
        model: trigger.target_model.clone(),
        workspace: record.workspace.clone(),
        resume_session: None,
        initial_context: Some(format!(
            "Taking over {} from a {} worker ({}). Continue the work in this workspace.",
            record.unit_of_work_id, record.model, trigger.reason
        )),
    };

    let spawned = shared
        .runtime
        .spawn(params)
        .await
        .map_err(|e| (None, format!("replacement spawn failed: {}", e)))?;
    shared.clear_orderly_stop(&spawned.id).await;
    shared
        .discard_if_stopped(&spawned.id)
        .await
        .map_err(|e| (None, format!("replacement {} discarded: {}", spawned.id, e)))?;

    let replacement = WorkerRecord {
        id: spawned.id.clone(),
        unit_of_work_id: record.unit_of_work_id.clone(),
        model: trigger.target_model.clone(),
        session_id: Some(spawned.session_id),
        workspace: record.workspace.clone(),
        started_at: Utc::now(),
        last_activity: None,
    };
    if let Err(e) = shared.store.save(replacement).await {
        warn!(worker_id = %spawned.id, error = %e, "Failed to save replacement worker record");
    }

    shared.mark_orderly_stop(&record.id).await;
    if let Err(e) = shared.runtime.kill(&record.id).await {
        shared.clear_orderly_stop(&record.id).await;
        return Err((
            Some(spawned.id),
            format!("replacement running but original teardown failed: {}", e),
        ));
    }
    if let Err(e) = shared.store.remove(&record.id).await {
        warn!(worker_id = %record.id, error = %e, "Failed to remove original worker record");
    }

    Ok(spawned.id)
}
