//! Specialist session rotation
//!
//! Long-lived specialist workers are restarted with a fresh session once their
//! token usage reaches the rotation threshold. The fresh session keeps the
//! worker identity and is seeded with a tiered summary of the old session's
//! history.

use crate::supervisor::Shared;
use chrono::Utc;
use drover_core::error::{DroverError, Result};
use drover_core::rotation::{RotationRecord, TieredMemory};
use drover_core::storage::{LogEntry, LogRecord};
use drover_core::types::{SpawnParams, WorkerRecord};
use tracing::{info, warn};

/// Rotate one specialist's session and record the mapping
pub(crate) async fn rotate_specialist(shared: &Shared, worker_id: &str) -> Result<RotationRecord> {
    let specialist = shared
        .state
        .lock()
        .await
        .specialists
        .get(worker_id)
        .map(|s| s.name.clone())
        .ok_or_else(|| DroverError::WorkerNotFound(worker_id.to_string()))?;

    shared.ensure_spawns_allowed().await?;

    let record = shared
        .store
        .get(worker_id)
        .await?
        .ok_or_else(|| DroverError::WorkerNotFound(worker_id.to_string()))?;
    let usage = shared.runtime.token_usage(worker_id).await?;
    let history = shared.store.history(worker_id).await?;

    let rotation = &shared.config.rotation;
    let memory = TieredMemory::build(&history, rotation.full_detail_items, rotation.summary_items);

    shared.mark_orderly_stop(worker_id).await;
    if let Err(e) = shared.runtime.kill(worker_id).await {
        shared.clear_orderly_stop(worker_id).await;
        return Err(e);
    }

    let params = SpawnParams {
        worker_id: Some(worker_id.to_string()),
        unit_of_work_id: record.unit_of_work_id.clone(),
        model: record.model.clone(),
        workspace: record.workspace.clone(),
        resume_session: None,
        initial_context: Some(memory.render()),
    };
    let spawned = match shared.runtime.spawn(params).await {
        Ok(spawned) => spawned,
        Err(e) => {
            // Let the next diff see the exit as a crash so restart policy takes over
            shared.clear_orderly_stop(worker_id).await;
            return Err(e);
        }
    };
    shared.discard_if_stopped(&spawned.id).await?;
    shared.clear_orderly_stop(&spawned.id).await;

    let rotation = RotationRecord {
        specialist,
        old_session: record.session_id.clone(),
        new_session: spawned.session_id.clone(),
        tokens_at_rotation: usage.total(),
        items_carried: memory.len(),
        rotated_at: Utc::now(),
    };

    if let Err(e) = shared
        .store
        .save(WorkerRecord {
            session_id: Some(spawned.session_id),
            started_at: Utc::now(),
            ..record
        })
        .await
    {
        warn!(worker_id = %worker_id, error = %e, "Failed to save rotated worker record");
    }

    {
        let mut state = shared.state.lock().await;
        if let Err(e) = state.ledger.reset_billed_usage(worker_id) {
            warn!(worker_id = %worker_id, error = %e, "Failed to reset billed usage");
        }
        if let Some(session) = state.specialists.get_mut(worker_id) {
            session.record_rotation(rotation.clone());
        }
    }

    shared
        .append_log(LogRecord::now(
            worker_id,
            LogEntry::SessionRotated(rotation.clone()),
        ))
        .await;

    info!(
        worker_id = %worker_id,
        old_session = rotation.old_session.as_deref().unwrap_or("-"),
        new_session = %rotation.new_session,
        tokens = rotation.tokens_at_rotation,
        "Rotated specialist session"
    );
    Ok(rotation)
}
