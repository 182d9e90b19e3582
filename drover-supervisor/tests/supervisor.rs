//! Integration tests for the fleet supervisor
//!
//! These drive `FleetSupervisor::tick` against a scripted runtime and check
//! the events, runtime actions and durable state each tick produces.

mod common;

use chrono::Utc;
use common::{MockRuntime, count, drain, let_tasks_run, record, test_config};
use drover_core::config::DroverConfig;
use drover_core::error::DroverError;
use drover_core::events::SupervisorEvent;
use drover_core::handoff::HandoffTriggerKind;
use drover_core::ledger::{AlertLevel, CostLedger, CostScope};
use drover_core::pricing::ModelRate;
use drover_core::runtime::{InMemoryWorkerStore, WorkerStore};
use drover_core::storage::{EventLog, LogEntry, RunningMarker, write_json_atomic};
use drover_core::types::{HandoffSignals, HealthState, HistoryItem};
use drover_supervisor::{FleetStatus, FleetSupervisor, SupervisorError};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    supervisor: FleetSupervisor,
    runtime: Arc<MockRuntime>,
    store: Arc<InMemoryWorkerStore>,
}

fn harness(config: DroverConfig) -> Harness {
    let runtime = Arc::new(MockRuntime::new());
    let store = Arc::new(InMemoryWorkerStore::new());
    let supervisor = FleetSupervisor::new(config, runtime.clone(), store.clone());
    Harness {
        supervisor,
        runtime,
        store,
    }
}

fn no_handoffs(mut config: DroverConfig) -> DroverConfig {
    config.handoff.enabled = false;
    config
}

#[tokio::test]
async fn test_warning_escalates_to_stuck_and_recovers() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = no_handoffs(test_config(&temp_dir));
    config.monitor.poke_on_warning = false;
    let h = harness(config);
    let mut rx = h.supervisor.subscribe();

    h.runtime.add_worker("w1");
    h.runtime.set_idle("w1", 600);

    let first = h.supervisor.tick().await.expect("tick");
    assert_eq!(first.snapshots[0].state, HealthState::Warning);
    assert_eq!(first.snapshots[0].consecutive_failures, 1);

    h.supervisor.tick().await.expect("tick");
    let third = h.supervisor.tick().await.expect("tick");
    assert_eq!(third.snapshots[0].state, HealthState::Stuck);

    let events = drain(&mut rx);
    assert_eq!(count(&events, "agent_warning"), 2);
    assert_eq!(count(&events, "agent_stuck"), 1);
    assert_eq!(count(&events, "health_check"), 3);

    h.runtime.touch("w1");
    let recovered = h.supervisor.tick().await.expect("tick");
    assert_eq!(recovered.snapshots[0].state, HealthState::Healthy);
    assert_eq!(recovered.snapshots[0].consecutive_failures, 0);

    // A new idle episode starts counting from one again
    h.runtime.set_idle("w1", 600);
    let again = h.supervisor.tick().await.expect("tick");
    assert_eq!(again.snapshots[0].state, HealthState::Warning);
    assert_eq!(again.snapshots[0].consecutive_failures, 1);

    let log = EventLog::new(h.supervisor.config().storage.event_log_path());
    let transitions: Vec<_> = log
        .read_for_worker("w1")
        .expect("read log")
        .into_iter()
        .filter_map(|r| match r.entry {
            LogEntry::HealthTransition { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            HealthState::Warning,
            HealthState::Stuck,
            HealthState::Healthy,
            HealthState::Warning
        ]
    );
}

#[tokio::test]
async fn test_dead_process_classified_dead() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(no_handoffs(test_config(&temp_dir)));

    h.runtime.add_worker("w1");
    h.runtime.set_dead("w1");

    let report = h.supervisor.tick().await.expect("tick");
    assert_eq!(report.snapshots[0].state, HealthState::Dead);

    let status = h.supervisor.status().await;
    assert_eq!(status.count(HealthState::Dead), 1);
    assert_eq!(status.needs_attention, vec!["w1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_crash_restarts_with_backoff_then_gives_up() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = no_handoffs(test_config(&temp_dir));
    config.breaker.threshold = 100;
    let h = harness(config);
    let mut rx = h.supervisor.subscribe();

    h.store.save(record("w1", "sonnet")).await.expect("save");
    h.runtime.add_worker("w1");
    h.supervisor.tick().await.expect("tick");

    for (attempt, delay) in [(1u32, 5u64), (2, 15), (3, 60)] {
        h.runtime.crash("w1");
        let report = h.supervisor.tick().await.expect("tick");
        assert_eq!(report.crashed, vec!["w1".to_string()]);

        let events = drain(&mut rx);
        let restarting = events
            .iter()
            .find_map(|e| match e {
                SupervisorEvent::AgentRestarting {
                    attempt: scheduled,
                    delay_secs,
                    ..
                } => Some((*scheduled, *delay_secs)),
                _ => None,
            })
            .expect("restart scheduled");
        assert_eq!(restarting, (attempt, delay));

        // Not before the delay has passed
        tokio::time::sleep(Duration::from_secs(delay - 1)).await;
        assert!(!h.runtime.is_running("w1"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let_tasks_run().await;
        assert!(h.runtime.is_running("w1"));
        assert_eq!(h.runtime.spawns().len(), attempt as usize);

        h.supervisor.tick().await.expect("tick");
    }

    // Every restart resumed the saved session under the same identity
    for params in h.runtime.spawns() {
        assert_eq!(params.worker_id.as_deref(), Some("w1"));
        assert!(params.resume_session.is_some());
    }

    h.runtime.crash("w1");
    h.supervisor.tick().await.expect("tick");
    let events = drain(&mut rx);
    assert_eq!(count(&events, "agent_gave_up"), 1);
    assert_eq!(count(&events, "agent_restarting"), 0);

    tokio::time::sleep(Duration::from_secs(120)).await;
    let_tasks_run().await;
    assert_eq!(h.runtime.spawns().len(), 3);

    let tracker = h.supervisor.crash_tracker("w1").await.expect("tracker");
    assert_eq!(tracker.crash_count, 4);
    assert!(tracker.gave_up);
    assert_eq!(h.supervisor.status().await.gave_up, vec!["w1".to_string()]);
}

#[tokio::test]
async fn test_reset_crash_tracker_after_give_up() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = no_handoffs(test_config(&temp_dir));
    config.restart.max_retries = 0;
    let h = harness(config);
    let mut rx = h.supervisor.subscribe();

    h.runtime.add_worker("w1");
    h.supervisor.tick().await.expect("tick");
    h.runtime.crash("w1");
    h.supervisor.tick().await.expect("tick");

    assert_eq!(count(&drain(&mut rx), "agent_gave_up"), 1);
    assert!(h.supervisor.reset_crash_tracker("w1").await.expect("reset"));
    assert!(h.supervisor.crash_tracker("w1").await.is_none());
    assert!(!h.supervisor.reset_crash_tracker("w1").await.expect("reset"));
}

#[tokio::test]
async fn test_orderly_stop_is_not_a_crash() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(no_handoffs(test_config(&temp_dir)));
    let mut rx = h.supervisor.subscribe();

    h.runtime.add_worker("w1");
    h.runtime.add_worker("w2");
    h.supervisor.tick().await.expect("tick");

    h.supervisor.mark_stopped("w1").await;
    h.runtime.crash("w1");
    h.runtime.crash("w2");
    let report = h.supervisor.tick().await.expect("tick");

    assert_eq!(report.crashed, vec!["w2".to_string()]);
    assert_eq!(count(&drain(&mut rx), "agent_crashed"), 1);
    assert!(h.supervisor.snapshot("w1").await.is_none());
}

#[tokio::test]
async fn test_mass_death_trips_once_until_resumed() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = no_handoffs(test_config(&temp_dir));
    config.restart.enabled = false;
    let h = harness(config);
    let mut rx = h.supervisor.subscribe();

    for id in ["w1", "w2", "w3", "w4"] {
        h.runtime.add_worker(id);
    }
    h.supervisor.tick().await.expect("tick");

    for id in ["w1", "w2", "w3"] {
        h.runtime.crash(id);
    }
    h.supervisor.tick().await.expect("tick");

    let events = drain(&mut rx);
    assert_eq!(count(&events, "agent_crashed"), 3);
    assert_eq!(count(&events, "mass_death_detected"), 1);
    assert_eq!(count(&events, "spawn_paused"), 1);
    assert!(h.supervisor.status().await.spawns_paused);

    // Further deaths while tripped do not re-announce
    h.runtime.crash("w4");
    h.supervisor.tick().await.expect("tick");
    let events = drain(&mut rx);
    assert_eq!(count(&events, "agent_crashed"), 1);
    assert_eq!(count(&events, "mass_death_detected"), 0);

    assert!(h.supervisor.resume_spawns().await);
    assert!(!h.supervisor.resume_spawns().await);
    let status = h.supervisor.status().await;
    assert!(!status.spawns_paused);
    assert_eq!(status.recent_deaths, 0);
    assert_eq!(count(&drain(&mut rx), "spawn_resumed"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_refused_while_spawns_paused() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = no_handoffs(test_config(&temp_dir));
    config.breaker.threshold = 1;
    let h = harness(config);
    let mut rx = h.supervisor.subscribe();

    h.store.save(record("w1", "sonnet")).await.expect("save");
    h.runtime.add_worker("w1");
    h.supervisor.tick().await.expect("tick");
    h.runtime.crash("w1");
    h.supervisor.tick().await.expect("tick");

    tokio::time::sleep(Duration::from_secs(6)).await;
    let_tasks_run().await;

    let events = drain(&mut rx);
    assert_eq!(count(&events, "mass_death_detected"), 1);
    assert_eq!(count(&events, "agent_restart_failed"), 1);
    assert!(h.runtime.spawns().is_empty());
}

#[tokio::test]
async fn test_stuck_escalation_outranks_test_failure() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config(&temp_dir);
    config.monitor.consecutive_failures = 1;
    let h = harness(config);
    let mut rx = h.supervisor.subscribe();

    h.store.save(record("w1", "sonnet")).await.expect("save");
    h.store
        .set_signals(
            "w1",
            HandoffSignals {
                failing_test_runs: 5,
                ..Default::default()
            },
        )
        .await;
    h.runtime.add_worker("w1");
    h.runtime.set_idle("w1", 900);

    let first = h.supervisor.tick().await.expect("tick");
    assert_eq!(first.handoffs_launched, vec!["w1".to_string()]);
    // Launched handoffs are never relaunched while in flight or after completion
    let second = h.supervisor.tick().await.expect("tick");
    assert!(second.handoffs_launched.is_empty());
    h.supervisor.settle().await;

    let spawns = h.runtime.spawns();
    assert_eq!(spawns.len(), 1);
    assert_eq!(spawns[0].model, "opus");
    assert_eq!(spawns[0].unit_of_work_id, "ISSUE-w1");
    assert!(spawns[0].initial_context.is_some());

    let events = drain(&mut rx);
    let triggered: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SupervisorEvent::HandoffTriggered { trigger, .. } => Some(trigger.kind),
            _ => None,
        })
        .collect();
    assert_eq!(triggered, vec![HandoffTriggerKind::StuckEscalation]);

    let completed = events
        .iter()
        .find_map(|e| match e {
            SupervisorEvent::HandoffCompleted { handoff, .. } => Some(handoff.clone()),
            _ => None,
        })
        .expect("handoff completed");
    assert!(completed.success);
    assert_eq!(completed.source_model, "sonnet");
    assert_eq!(completed.target_model, "opus");
    let new_id = completed.new_worker_id.clone().expect("replacement id");

    // The original was stopped on purpose and its record replaced
    assert!(!h.runtime.is_running("w1"));
    assert!(h.runtime.is_running(&new_id));
    assert!(h.store.get("w1").await.expect("get").is_none());
    let replacement = h.store.get(&new_id).await.expect("get").expect("record");
    assert_eq!(replacement.model, "opus");

    let report = h.supervisor.tick().await.expect("tick");
    assert!(report.crashed.is_empty());
    assert_eq!(count(&drain(&mut rx), "agent_crashed"), 0);
}

#[tokio::test]
async fn test_failed_handoff_keeps_original_running() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config(&temp_dir);
    config.monitor.consecutive_failures = 1;
    let h = harness(config);
    let mut rx = h.supervisor.subscribe();

    h.store.save(record("w1", "sonnet")).await.expect("save");
    h.runtime.add_worker("w1");
    h.runtime.set_idle("w1", 900);
    h.runtime.fail_spawns(true);

    h.supervisor.tick().await.expect("tick");
    h.supervisor.settle().await;

    let failed = drain(&mut rx)
        .into_iter()
        .find_map(|e| match e {
            SupervisorEvent::HandoffCompleted { handoff, .. } => Some(handoff),
            _ => None,
        })
        .expect("handoff completed");
    assert!(!failed.success);
    assert!(failed.new_worker_id.is_none());
    assert!(failed.error.is_some());

    assert!(h.runtime.is_running("w1"));
    assert!(h.runtime.kills().is_empty());
    assert!(h.store.get("w1").await.expect("get").is_some());

    let report = h.supervisor.tick().await.expect("tick");
    assert!(report.crashed.is_empty());

    let log = EventLog::new(h.supervisor.config().storage.event_log_path());
    let handoffs: Vec<_> = log
        .read_for_worker("w1")
        .expect("read log")
        .into_iter()
        .filter_map(|r| match r.entry {
            LogEntry::Handoff(event) => Some(event),
            _ => None,
        })
        .collect();
    assert!(!handoffs.is_empty());
    assert!(!handoffs[0].success);
}

#[tokio::test]
async fn test_manual_handoff_request() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(no_handoffs(test_config(&temp_dir)));
    let mut rx = h.supervisor.subscribe();

    h.store.save(record("w1", "sonnet")).await.expect("save");
    h.runtime.add_worker("w1");

    let event = h
        .supervisor
        .request_handoff("w1", "haiku")
        .await
        .expect("handoff");
    assert!(event.success);
    assert_eq!(event.trigger, HandoffTriggerKind::Manual);
    assert_eq!(h.runtime.spawns()[0].model, "haiku");

    let events = drain(&mut rx);
    assert_eq!(count(&events, "handoff_triggered"), 1);
    assert_eq!(count(&events, "handoff_completed"), 1);

    assert!(h.supervisor.request_handoff("missing", "haiku").await.is_err());
}

#[tokio::test]
async fn test_cost_alerts_fire_on_level_change() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = no_handoffs(test_config(&temp_dir));
    config.cost.daily_limit = Some(100.0);
    config.cost.alert_threshold = 0.8;
    // One dollar per token
    config.cost.pricing.insert(
        "metered".to_string(),
        ModelRate::new(1_000_000.0, 1_000_000.0),
    );
    let h = harness(config);
    let mut rx = h.supervisor.subscribe();

    h.store.save(record("w1", "metered")).await.expect("save");
    h.runtime.add_worker("w1");
    h.runtime.set_usage("w1", 90, 0);

    let first = h.supervisor.tick().await.expect("tick");
    assert_eq!(first.alerts.len(), 1);
    assert_eq!(first.alerts[0].scope, CostScope::Daily);
    assert_eq!(first.alerts[0].level, AlertLevel::Warning);

    // Same level on the next tick is not re-raised
    let second = h.supervisor.tick().await.expect("tick");
    assert!(second.alerts.is_empty());

    h.runtime.set_usage("w1", 101, 0);
    let third = h.supervisor.tick().await.expect("tick");
    assert_eq!(third.alerts.len(), 1);
    assert_eq!(third.alerts[0].level, AlertLevel::LimitReached);

    let spent = h.supervisor.worker_spend("w1").await;
    assert!((spent - 101.0).abs() < 1e-6);

    let alerts: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            SupervisorEvent::CostAlert { worker_id, alert, .. } => Some((worker_id, alert.level)),
            _ => None,
        })
        .collect();
    assert_eq!(
        alerts,
        vec![
            ("w1".to_string(), AlertLevel::Warning),
            ("w1".to_string(), AlertLevel::LimitReached)
        ]
    );
}

#[tokio::test]
async fn test_spend_not_rebilled_after_supervisor_restart() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = no_handoffs(test_config(&temp_dir));
    // One dollar per token
    config.cost.pricing.insert(
        "metered".to_string(),
        ModelRate::new(1_000_000.0, 1_000_000.0),
    );
    let runtime = Arc::new(MockRuntime::new());
    let store = Arc::new(InMemoryWorkerStore::new());

    store.save(record("w1", "metered")).await.expect("save");
    runtime.add_worker("w1");
    runtime.set_usage("w1", 10, 0);

    let first = FleetSupervisor::new(config.clone(), runtime.clone(), store.clone());
    first.init().await.expect("init");
    first.tick().await.expect("tick");
    assert!((first.worker_spend("w1").await - 10.0).abs() < 1e-9);
    first.shutdown().await.expect("shutdown");

    // The worker kept running while no supervisor was watching
    let second = FleetSupervisor::new(config.clone(), runtime.clone(), store.clone());
    second.init().await.expect("init");
    second.tick().await.expect("tick");
    assert!((second.worker_spend("w1").await - 10.0).abs() < 1e-9);

    runtime.set_usage("w1", 15, 0);
    second.tick().await.expect("tick");
    assert!((second.worker_spend("w1").await - 15.0).abs() < 1e-9);
    second.shutdown().await.expect("shutdown");

    let ledger = CostLedger::load(config.storage.ledger_path()).expect("ledger");
    assert!((ledger.unit_total("ISSUE-w1") - 15.0).abs() < 1e-9);
    assert!((ledger.daily_total() - 15.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_resumed_session_with_fresh_counter_bills_only_new_usage() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = no_handoffs(test_config(&temp_dir));
    config.cost.pricing.insert(
        "metered".to_string(),
        ModelRate::new(1_000_000.0, 1_000_000.0),
    );
    let h = harness(config);

    h.store.save(record("w1", "metered")).await.expect("save");
    h.runtime.add_worker("w1");
    h.runtime.set_usage("w1", 40, 0);
    h.supervisor.tick().await.expect("tick");

    // Counter dropped below what was billed: the runtime started over
    h.runtime.set_usage("w1", 5, 0);
    h.supervisor.tick().await.expect("tick");
    assert!((h.supervisor.worker_spend("w1").await - 45.0).abs() < 1e-9);

    h.runtime.set_usage("w1", 7, 0);
    h.supervisor.tick().await.expect("tick");
    assert!((h.supervisor.worker_spend("w1").await - 47.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_pokes_capped_per_episode() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = no_handoffs(test_config(&temp_dir));
    config.monitor.consecutive_failures = 100;
    config.monitor.max_nudges = 2;
    let h = harness(config);

    h.runtime.add_worker("w1");
    h.runtime.set_idle("w1", 600);

    let mut poked = 0;
    let mut exhausted = 0;
    for _ in 0..4 {
        let report = h.supervisor.tick().await.expect("tick");
        poked += report.recovery.poked.len();
        exhausted += report.recovery.exhausted.len();
    }
    assert_eq!(poked, 2);
    assert_eq!(exhausted, 2);

    // Recovery closes the episode
    h.runtime.touch("w1");
    h.supervisor.tick().await.expect("tick");
    h.runtime.set_idle("w1", 600);
    let report = h.supervisor.tick().await.expect("tick");
    assert_eq!(report.recovery.poked, vec!["w1".to_string()]);

    let messages = h.runtime.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].1, h.supervisor.config().monitor.poke_message);
}

#[tokio::test]
async fn test_poke_failure_does_not_block_others() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(no_handoffs(test_config(&temp_dir)));
    let mut rx = h.supervisor.subscribe();

    for id in ["w1", "w2"] {
        h.runtime.add_worker(id);
        h.runtime.set_idle(id, 600);
    }
    h.runtime.fail_message("w1");

    let report = h.supervisor.tick().await.expect("tick");
    assert_eq!(report.recovery.poked, vec!["w2".to_string()]);

    let errors: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| e.event_type() == "error")
        .filter_map(|e| e.worker_id().map(str::to_string))
        .collect();
    assert_eq!(errors, vec!["w1".to_string()]);
}

#[tokio::test]
async fn test_kill_on_stuck_is_not_restarted() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = no_handoffs(test_config(&temp_dir));
    config.monitor.consecutive_failures = 1;
    config.monitor.kill_on_stuck = true;
    let h = harness(config);
    let mut rx = h.supervisor.subscribe();

    h.runtime.add_worker("w1");
    h.runtime.set_idle("w1", 900);

    let report = h.supervisor.tick().await.expect("tick");
    assert_eq!(report.recovery.killed, vec!["w1".to_string()]);
    assert_eq!(h.runtime.kills(), vec!["w1".to_string()]);

    let report = h.supervisor.tick().await.expect("tick");
    assert!(report.crashed.is_empty());

    let events = drain(&mut rx);
    assert_eq!(count(&events, "killed_agent"), 1);
    assert_eq!(count(&events, "agent_crashed"), 0);
    assert_eq!(count(&events, "agent_restarting"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_emergency_stop_kills_fleet_and_cancels_restarts() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = no_handoffs(test_config(&temp_dir));
    config.breaker.threshold = 100;
    let h = harness(config);
    let mut rx = h.supervisor.subscribe();

    h.store.save(record("w0", "sonnet")).await.expect("save");
    for id in ["w0", "w1", "w2", "w3"] {
        h.runtime.add_worker(id);
    }
    h.runtime.fail_kill("w3");
    h.supervisor.tick().await.expect("tick");

    // w0 has a restart pending when the stop arrives
    h.runtime.crash("w0");
    h.supervisor.tick().await.expect("tick");

    let report = h.supervisor.emergency_stop().await.expect("stop");
    assert_eq!(report.killed, vec!["w1".to_string(), "w2".to_string()]);
    assert_eq!(report.failed, vec!["w3".to_string()]);

    tokio::time::timeout(Duration::from_secs(1), h.supervisor.run())
        .await
        .expect("loop exits after emergency stop");

    tokio::time::sleep(Duration::from_secs(30)).await;
    let_tasks_run().await;
    assert!(h.runtime.spawns().is_empty());

    let stop = drain(&mut rx)
        .into_iter()
        .find_map(|e| match e {
            SupervisorEvent::EmergencyStop { killed, failed, .. } => Some((killed, failed)),
            _ => None,
        })
        .expect("emergency stop event");
    assert_eq!(stop.0.len(), 2);
    assert_eq!(stop.1, vec!["w3".to_string()]);
}

fn slow_stuck_worker(h: &Harness) {
    h.runtime.add_worker("w1");
    h.runtime.set_idle("w1", 900);
    h.runtime.slow_spawns(Duration::from_millis(200));
}

fn escalating(temp_dir: &TempDir) -> DroverConfig {
    let mut config = test_config(temp_dir);
    config.monitor.consecutive_failures = 1;
    config
}

#[tokio::test(start_paused = true)]
async fn test_emergency_stop_discards_replacement_spawned_mid_handoff() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(escalating(&temp_dir));
    let mut rx = h.supervisor.subscribe();

    h.store.save(record("w1", "sonnet")).await.expect("save");
    slow_stuck_worker(&h);

    let report = h.supervisor.tick().await.expect("tick");
    assert_eq!(report.handoffs_launched, vec!["w1".to_string()]);

    // The handoff is now waiting on the replacement spawn
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.runtime.spawns().is_empty());

    let stop = h.supervisor.emergency_stop().await.expect("stop");
    assert_eq!(stop.killed, vec!["w1".to_string()]);

    assert_eq!(h.runtime.spawns().len(), 1);
    assert!(h.runtime.running().is_empty());
    assert!(h.runtime.kills().contains(&"worker-1".to_string()));

    let handoff = drain(&mut rx)
        .into_iter()
        .find_map(|e| match e {
            SupervisorEvent::HandoffCompleted { handoff, .. } => Some(handoff),
            _ => None,
        })
        .expect("handoff completed");
    assert!(!handoff.success);
    assert!(handoff.new_worker_id.is_none());

    // Nothing spawns once stopped
    let late = h
        .supervisor
        .request_handoff("w1", "opus")
        .await
        .expect("handoff recorded");
    assert!(!late.success);
    assert_eq!(late.error.as_deref(), Some("Supervisor stopped"));
    assert_eq!(h.runtime.spawns().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_emergency_stop_discards_rotation_in_flight() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(no_handoffs(test_config(&temp_dir)));

    h.store.save(record("spec-1", "sonnet")).await.expect("save");
    h.runtime.add_worker("spec-1");
    h.runtime.set_usage("spec-1", 100_000, 50_000);
    h.runtime.slow_spawns(Duration::from_millis(200));
    h.supervisor
        .register_specialist("reviewer", "spec-1")
        .await
        .expect("register");

    let report = h.supervisor.tick().await.expect("tick");
    assert_eq!(report.rotations_launched, vec!["spec-1".to_string()]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.runtime.is_running("spec-1"));

    let stop = h.supervisor.emergency_stop().await.expect("stop");
    assert!(stop.killed.is_empty());

    assert_eq!(h.runtime.spawns().len(), 1);
    assert!(h.runtime.running().is_empty());
    let specialist = h.supervisor.specialist("spec-1").await.expect("specialist");
    assert!(specialist.rotations.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_handoffs_for_one_worker_are_refused() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(escalating(&temp_dir));
    let mut rx = h.supervisor.subscribe();

    h.store.save(record("w1", "sonnet")).await.expect("save");
    slow_stuck_worker(&h);

    let first = h.supervisor.tick().await.expect("tick");
    assert_eq!(first.handoffs_launched, vec!["w1".to_string()]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Still stuck and still triggering, but the first handoff owns the worker
    let second = h.supervisor.tick().await.expect("tick");
    assert_eq!(second.snapshots[0].state, HealthState::Stuck);
    assert!(second.handoffs_launched.is_empty());

    let err = h
        .supervisor
        .request_handoff("w1", "haiku")
        .await
        .expect_err("handoff already running");
    assert!(matches!(
        err,
        SupervisorError::Core(DroverError::HandoffInProgress(ref id)) if id == "w1"
    ));

    h.supervisor.settle().await;
    let spawns = h.runtime.spawns();
    assert_eq!(spawns.len(), 1);
    assert_eq!(spawns[0].model, "opus");
    assert!(!h.runtime.is_running("w1"));
    assert!(h.runtime.is_running("worker-1"));

    let events = drain(&mut rx);
    assert_eq!(count(&events, "handoff_triggered"), 1);
    assert_eq!(count(&events, "handoff_completed"), 1);
}

fn history_item(n: usize) -> HistoryItem {
    HistoryItem {
        reference: format!("msg-{}", n),
        summary: format!("step {}", n),
        content: format!("full content of step {}", n),
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn test_specialist_rotates_past_token_threshold() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = no_handoffs(test_config(&temp_dir));
    config.rotation.full_detail_items = 1;
    config.rotation.summary_items = 1;
    let h = harness(config);
    let mut rx = h.supervisor.subscribe();

    h.store.save(record("spec-1", "sonnet")).await.expect("save");
    for n in 0..3 {
        h.store.push_history("spec-1", history_item(n)).await;
    }
    h.runtime.add_worker("spec-1");
    h.runtime.set_usage("spec-1", 100_000, 50_000);

    h.supervisor
        .register_specialist("reviewer", "spec-1")
        .await
        .expect("register");
    assert!(
        h.supervisor
            .register_specialist("other", "spec-1")
            .await
            .is_err()
    );

    let report = h.supervisor.tick().await.expect("tick");
    assert_eq!(report.rotations_launched, vec!["spec-1".to_string()]);
    h.supervisor.settle().await;

    let rotation = drain(&mut rx)
        .into_iter()
        .find_map(|e| match e {
            SupervisorEvent::SessionRotated { rotation, .. } => Some(rotation),
            _ => None,
        })
        .expect("session rotated");
    assert_eq!(rotation.specialist, "reviewer");
    assert_eq!(rotation.old_session.as_deref(), Some("spec-1-session"));
    assert_eq!(rotation.tokens_at_rotation, 150_000);
    assert_eq!(rotation.items_carried, 3);

    let spawns = h.runtime.spawns();
    assert_eq!(spawns.len(), 1);
    assert_eq!(spawns[0].worker_id.as_deref(), Some("spec-1"));
    assert!(spawns[0].resume_session.is_none());
    let context = spawns[0].initial_context.clone().expect("context");
    assert!(context.contains("msg-0"));
    assert!(context.contains("step 1"));
    assert!(context.contains("full content of step 2"));

    let specialist = h.supervisor.specialist("spec-1").await.expect("specialist");
    assert_eq!(specialist.session_id.as_deref(), Some(rotation.new_session.as_str()));
    assert_eq!(specialist.rotations.len(), 1);

    // Same identity, fresh usage: no crash and no second rotation
    let report = h.supervisor.tick().await.expect("tick");
    assert!(report.crashed.is_empty());
    assert!(report.rotations_launched.is_empty());
}

#[tokio::test]
async fn test_rotate_now_requires_registration() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(no_handoffs(test_config(&temp_dir)));

    h.store.save(record("w1", "sonnet")).await.expect("save");
    h.runtime.add_worker("w1");

    assert!(h.supervisor.rotate_now("w1").await.is_err());
    assert!(h.runtime.kills().is_empty());

    h.supervisor
        .register_specialist("planner", "w1")
        .await
        .expect("register");
    let rotation = h.supervisor.rotate_now("w1").await.expect("rotate");
    assert_eq!(rotation.specialist, "planner");
    assert!(h.runtime.is_running("w1"));
}

#[tokio::test]
async fn test_init_and_shutdown_manage_marker() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(no_handoffs(test_config(&temp_dir)));
    let mut rx = h.supervisor.subscribe();
    let storage = h.supervisor.config().storage.clone();

    h.supervisor.init().await.expect("init");
    assert!(storage.marker_path().exists());
    assert!(h.supervisor.status().await.running);

    h.runtime.add_worker("w1");
    h.supervisor.tick().await.expect("tick");
    let data = std::fs::read(storage.status_path()).expect("status written");
    let written: FleetStatus = serde_json::from_slice(&data).expect("status json");
    assert_eq!(written.total_workers, 1);

    h.supervisor.shutdown().await.expect("shutdown");
    assert!(!storage.marker_path().exists());
    assert!(!h.supervisor.status().await.running);

    let events = drain(&mut rx);
    assert_eq!(count(&events, "started"), 1);
    assert_eq!(count(&events, "stopped"), 1);
}

#[tokio::test]
async fn test_init_refuses_when_another_supervisor_is_live() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(test_config(&temp_dir));

    // pid 1 always exists
    let foreign = RunningMarker {
        pid: 1,
        started_at: Utc::now(),
    };
    write_json_atomic(&h.supervisor.config().storage.marker_path(), &foreign)
        .expect("write marker");

    let err = h.supervisor.init().await.expect_err("second supervisor");
    assert!(err.to_string().contains("already running"));
}
