//! The fleet supervisor
//!
//! One owned [`FleetSupervisor`] per process holds all supervision state. Each
//! tick runs, in order:
//!
//! 1. publish outcomes of background work that finished since the last tick;
//! 2. diff the running set against the previous tick and handle crashes;
//! 3. probe every running worker and classify its health;
//! 4. price token usage and raise cost alerts;
//! 5. launch handoffs and specialist rotations as background tasks;
//! 6. poke or kill per recovery policy.
//!
//! Ticks never interleave. Background tasks report through a channel that
//! the next tick (or [`FleetSupervisor::settle`]) drains, so their events
//! appear in a deterministic place in the stream.

use crate::error::{Result, SupervisorError};
use crate::handoff::execute_handoff;
use crate::recovery::{RecoveryReport, dispatch};
use crate::restart::schedule_restart;
use crate::rotation::rotate_specialist;
use crate::status::{FleetStatus, count_states};
use chrono::{DateTime, Utc};
use drover_core::breaker::MassDeathBreaker;
use drover_core::config::DroverConfig;
use drover_core::crash::{
    CrashDecision, CrashRegistry, CrashTracker, RestartPolicy, detect_crashes,
};
use drover_core::error::DroverError;
use drover_core::events::{EventBus, EventReceiver, SupervisorEvent};
use drover_core::handoff::{
    DetectionContext, HandoffEvent, HandoffTrigger, HandoffTriggerKind, TriggerDetector,
    default_detectors, evaluate_triggers,
};
use drover_core::health::{HealthClassifier, MostRecentWins, SignalReconciler};
use drover_core::ledger::{AlertLevel, CostAlert, CostLedger, CostLimits, CostScope};
use drover_core::pricing::ModelPricing;
use drover_core::rotation::{RotationRecord, SpecialistSessionState, needs_rotation};
use drover_core::runtime::{WorkerRuntime, WorkerStore};
use drover_core::storage::{EventLog, LogEntry, LogRecord, RunningMarker, write_json_atomic};
use drover_core::types::{
    ActivitySignal, HandoffSignals, HealthSnapshot, HealthState, TokenUsage, WorkerRecord,
};
use drover_core::violations::ViolationTracker;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Mutable supervision state, guarded by one lock
pub(crate) struct FleetState {
    pub(crate) classifier: HealthClassifier,
    pub(crate) crashes: CrashRegistry,
    pub(crate) breaker: MassDeathBreaker,
    pub(crate) ledger: CostLedger,
    pub(crate) violations: ViolationTracker,
    pub(crate) previous_running: HashSet<String>,
    pub(crate) orderly_stops: HashSet<String>,
    pub(crate) snapshots: BTreeMap<String, HealthSnapshot>,
    pub(crate) alert_levels: HashMap<CostScope, AlertLevel>,
    pub(crate) specialists: HashMap<String, SpecialistSessionState>,
    pub(crate) initialized: bool,
}

/// Outcome of a background task, published by the next drain
#[derive(Debug)]
pub(crate) enum BackgroundOutcome {
    Handoff(HandoffEvent),
    Rotation {
        worker_id: String,
        result: std::result::Result<RotationRecord, String>,
    },
}

/// State shared with restart timers and background tasks
pub(crate) struct Shared {
    pub(crate) config: DroverConfig,
    pub(crate) runtime: Arc<dyn WorkerRuntime>,
    pub(crate) store: Arc<dyn WorkerStore>,
    pub(crate) bus: EventBus,
    pub(crate) event_log: EventLog,
    pub(crate) state: Mutex<FleetState>,
    pub(crate) in_progress: Mutex<HashSet<String>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) emergency: CancellationToken,
    outcomes: mpsc::UnboundedSender<BackgroundOutcome>,
}

impl Shared {
    pub(crate) fn publish(&self, event: SupervisorEvent) {
        self.bus.publish(event);
    }

    pub(crate) async fn ensure_spawns_allowed(&self) -> drover_core::error::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DroverError::Stopped);
        }
        if self.state.lock().await.breaker.spawns_paused() {
            return Err(DroverError::SpawnsPaused);
        }
        Ok(())
    }

    /// Kill a worker whose spawn finished after an emergency stop
    pub(crate) async fn discard_if_stopped(
        &self,
        worker_id: &str,
    ) -> drover_core::error::Result<()> {
        if !self.emergency.is_cancelled() {
            return Ok(());
        }
        warn!(worker_id = %worker_id, "Emergency stop during spawn, killing new worker");
        self.mark_orderly_stop(worker_id).await;
        if let Err(e) = self.runtime.kill(worker_id).await {
            warn!(worker_id = %worker_id, error = %e, "Failed to kill worker spawned after stop");
            self.publish(SupervisorEvent::error(
                Some(worker_id),
                format!("worker spawned after stop could not be killed: {}", e),
            ));
        }
        Err(DroverError::Stopped)
    }

    pub(crate) async fn mark_orderly_stop(&self, worker_id: &str) {
        self.state
            .lock()
            .await
            .orderly_stops
            .insert(worker_id.to_string());
    }

    pub(crate) async fn clear_orderly_stop(&self, worker_id: &str) {
        self.state.lock().await.orderly_stops.remove(worker_id);
    }

    /// Append to the event log; a write failure becomes an `error` event
    pub(crate) async fn append_log(&self, record: LogRecord) {
        if let Err(e) = self.event_log.append(&record).await {
            warn!(worker_id = %record.worker_id, error = %e, "Failed to append event log");
            self.publish(SupervisorEvent::error(
                Some(&record.worker_id),
                format!("event log write failed: {}", e),
            ));
        }
    }

    fn report(&self, outcome: BackgroundOutcome) {
        if self.outcomes.send(outcome).is_err() {
            debug!("Supervisor dropped before background outcome was reported");
        }
    }
}

/// What one tick observed and did
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Workers running this tick, sorted
    pub running: Vec<String>,
    /// Workers that crashed since the previous tick
    pub crashed: Vec<String>,
    /// Snapshots of the workers that could be probed
    pub snapshots: Vec<HealthSnapshot>,
    /// Cost alerts whose level changed
    pub alerts: Vec<CostAlert>,
    /// Workers a handoff was launched for
    pub handoffs_launched: Vec<String>,
    /// Specialists a rotation was launched for
    pub rotations_launched: Vec<String>,
    /// Pokes and kills
    pub recovery: RecoveryReport,
}

/// Result of an emergency stop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmergencyStopReport {
    /// Workers killed
    pub killed: Vec<String>,
    /// Workers whose kill failed
    pub failed: Vec<String>,
}

struct WorkerProbe {
    id: String,
    alive: bool,
    signals: Vec<ActivitySignal>,
    usage: Option<TokenUsage>,
    record: Option<WorkerRecord>,
    handoff_signals: HandoffSignals,
}

/// Supervises a fleet of workers through a [`WorkerRuntime`]
pub struct FleetSupervisor {
    shared: Arc<Shared>,
    reconciler: Arc<dyn SignalReconciler>,
    detectors: Vec<Box<dyn TriggerDetector>>,
    pricing: ModelPricing,
    limits: CostLimits,
    tick_lock: Mutex<()>,
    tasks: Mutex<JoinSet<()>>,
    outcomes: Mutex<mpsc::UnboundedReceiver<BackgroundOutcome>>,
}

impl FleetSupervisor {
    /// Create a supervisor. Durable state is loaded by [`init`](Self::init).
    pub fn new(
        config: DroverConfig,
        runtime: Arc<dyn WorkerRuntime>,
        store: Arc<dyn WorkerStore>,
    ) -> Self {
        let monitor = &config.monitor;
        let state = FleetState {
            classifier: HealthClassifier::new(monitor.ping_timeout, monitor.consecutive_failures),
            crashes: CrashRegistry::in_memory(RestartPolicy::from(&config.restart)),
            breaker: MassDeathBreaker::from(&config.breaker),
            ledger: CostLedger::in_memory(),
            violations: ViolationTracker::new(monitor.max_nudges),
            previous_running: HashSet::new(),
            orderly_stops: HashSet::new(),
            snapshots: BTreeMap::new(),
            alert_levels: HashMap::new(),
            specialists: HashMap::new(),
            initialized: false,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let detectors = default_detectors(&config.handoff);
        let pricing = ModelPricing::with_overrides(&config.cost.pricing);
        let limits = CostLimits::from(&config.cost);
        let event_log = EventLog::new(config.storage.event_log_path());

        Self {
            shared: Arc::new(Shared {
                config,
                runtime,
                store,
                bus: EventBus::default(),
                event_log,
                state: Mutex::new(state),
                in_progress: Mutex::new(HashSet::new()),
                cancel: CancellationToken::new(),
                emergency: CancellationToken::new(),
                outcomes: tx,
            }),
            reconciler: Arc::new(MostRecentWins),
            detectors,
            pricing,
            limits,
            tick_lock: Mutex::new(()),
            tasks: Mutex::new(JoinSet::new()),
            outcomes: Mutex::new(rx),
        }
    }

    /// Use a different signal reconciliation policy
    pub fn with_reconciler(mut self, reconciler: Arc<dyn SignalReconciler>) -> Self {
        self.reconciler = reconciler;
        self
    }

    /// Replace the built-in handoff detectors
    pub fn with_detectors(mut self, detectors: Vec<Box<dyn TriggerDetector>>) -> Self {
        self.detectors = detectors;
        self
    }

    /// Effective configuration
    pub fn config(&self) -> &DroverConfig {
        &self.shared.config
    }

    /// Subscribe to supervisor events
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.bus.subscribe()
    }

    /// Claim the running marker, load durable state and announce start.
    ///
    /// # Errors
    ///
    /// Fails if another live supervisor owns the state directory or durable
    /// state cannot be read.
    pub async fn init(&self) -> Result<()> {
        let storage = &self.shared.config.storage;
        let marker = RunningMarker::acquire(&storage.marker_path())?;
        let ledger = CostLedger::load(storage.ledger_path())?;
        let crashes = CrashRegistry::load(
            storage.crashes_path(),
            RestartPolicy::from(&self.shared.config.restart),
        )?;

        {
            let mut state = self.shared.state.lock().await;
            state.ledger = ledger;
            state.crashes = crashes;
            state.initialized = true;
        }

        info!(
            pid = marker.pid,
            state_dir = %storage.state_dir.display(),
            "Fleet supervisor started"
        );
        self.shared.publish(SupervisorEvent::Started {
            pid: marker.pid,
            timestamp: marker.started_at,
        });
        Ok(())
    }

    /// Tick on the configured interval until cancelled
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.shared.config.monitor.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Supervisor tick failed");
                    }
                }
            }
        }
        info!("Supervisor loop stopped");
    }

    /// Stop the loop, finish background work, release the marker and announce stop
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.cancel.cancel();
        self.settle().await;

        let was_initialized = {
            let mut state = self.shared.state.lock().await;
            std::mem::replace(&mut state.initialized, false)
        };
        if was_initialized {
            RunningMarker::release(&self.shared.config.storage.marker_path())?;
        }

        info!("Fleet supervisor stopped");
        self.shared.publish(SupervisorEvent::Stopped {
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Run one supervision pass
    pub async fn tick(&self) -> Result<TickReport> {
        let _tick = self.tick_lock.lock().await;
        self.drain_outcomes().await;

        let now = Utc::now();
        let mut report = TickReport::default();

        let running = match self.shared.runtime.running_workers().await {
            Ok(running) => running,
            Err(e) => {
                self.shared.publish(SupervisorEvent::error(
                    None,
                    format!("failed to list running workers: {}", e),
                ));
                return Err(e.into());
            }
        };
        let current: HashSet<String> = running.into_iter().collect();
        report.running = current.iter().cloned().collect();
        report.running.sort();

        report.crashed = self.handle_crashes(&current, now).await;

        let probes = self.probe_workers(&report.running).await;
        let transitions = self.classify(&probes, now, &mut report).await;
        for (worker_id, entry) in transitions {
            self.shared.append_log(LogRecord::now(worker_id, entry)).await;
        }

        report.alerts = self.account_costs(&probes).await;

        report.handoffs_launched = self.launch_handoffs(&probes, &report.snapshots).await;
        report.rotations_launched = self.launch_rotations(&probes).await;

        let skip_kill: HashSet<String> = report.handoffs_launched.iter().cloned().collect();
        report.recovery = dispatch(&self.shared, &report.snapshots, &skip_kill, now).await;

        self.write_status().await;
        Ok(report)
    }

    /// Wait for every background task and publish its outcome
    pub async fn settle(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Background task failed");
            }
        }
        self.drain_outcomes().await;
    }

    /// Record that a worker is being stopped on purpose
    pub async fn mark_stopped(&self, worker_id: &str) {
        self.shared.mark_orderly_stop(worker_id).await;
    }

    /// Operator acknowledgement of a mass death: close the breaker
    pub async fn resume_spawns(&self) -> bool {
        let was_tripped = self.shared.state.lock().await.breaker.resume();
        if was_tripped {
            info!("Spawning resumed by operator");
            self.shared.publish(SupervisorEvent::SpawnResumed {
                timestamp: Utc::now(),
            });
        }
        was_tripped
    }

    /// Clear a worker's crash tracker, including a give-up
    pub async fn reset_crash_tracker(&self, worker_id: &str) -> Result<bool> {
        let removed = self.shared.state.lock().await.crashes.reset(worker_id)?;
        if removed {
            info!(worker_id = %worker_id, "Crash tracker reset");
        }
        Ok(removed)
    }

    /// Track a long-lived specialist for session rotation
    pub async fn register_specialist(&self, name: &str, worker_id: &str) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if let Some(existing) = state.specialists.get(worker_id) {
            return Err(SupervisorError::Supervisor(format!(
                "worker {} is already registered as specialist {}",
                worker_id, existing.name
            )));
        }
        state.specialists.insert(
            worker_id.to_string(),
            SpecialistSessionState::new(name, worker_id),
        );
        Ok(())
    }

    /// Session state of a registered specialist
    pub async fn specialist(&self, worker_id: &str) -> Option<SpecialistSessionState> {
        self.shared.state.lock().await.specialists.get(worker_id).cloned()
    }

    /// Rotate a specialist now, regardless of its token usage
    pub async fn rotate_now(&self, worker_id: &str) -> Result<RotationRecord> {
        if !self.shared.in_progress.lock().await.insert(worker_id.to_string()) {
            return Err(DroverError::HandoffInProgress(worker_id.to_string()).into());
        }
        let result = rotate_specialist(&self.shared, worker_id).await;
        self.shared.in_progress.lock().await.remove(worker_id);

        let rotation = result?;
        self.shared.publish(SupervisorEvent::SessionRotated {
            worker_id: worker_id.to_string(),
            rotation: rotation.clone(),
            timestamp: Utc::now(),
        });
        Ok(rotation)
    }

    /// Hand a worker off to `target_model` now
    pub async fn request_handoff(&self, worker_id: &str, target_model: &str) -> Result<HandoffEvent> {
        let record = self
            .shared
            .store
            .get(worker_id)
            .await?
            .ok_or_else(|| DroverError::WorkerNotFound(worker_id.to_string()))?;

        if !self.shared.in_progress.lock().await.insert(worker_id.to_string()) {
            return Err(DroverError::HandoffInProgress(worker_id.to_string()).into());
        }

        let trigger = HandoffTrigger {
            kind: HandoffTriggerKind::Manual,
            target_model: target_model.to_string(),
            reason: "operator requested handoff".to_string(),
        };
        self.shared.publish(SupervisorEvent::HandoffTriggered {
            worker_id: worker_id.to_string(),
            trigger: trigger.clone(),
            timestamp: Utc::now(),
        });

        let event = execute_handoff(&self.shared, record, &trigger).await;
        self.shared.in_progress.lock().await.remove(worker_id);

        self.shared.publish(SupervisorEvent::HandoffCompleted {
            handoff: event.clone(),
            timestamp: Utc::now(),
        });
        Ok(event)
    }

    /// Kill every running worker and halt the loop.
    ///
    /// Safe to call while a tick is in progress. Spawns are refused from the
    /// moment this is called, and a handoff or rotation whose spawn completes
    /// afterwards kills its new worker. Returns once those tasks have finished.
    pub async fn emergency_stop(&self) -> Result<EmergencyStopReport> {
        warn!("Emergency stop requested");
        self.shared.emergency.cancel();
        self.shared.cancel.cancel();
        let result = self.kill_all().await;
        self.settle().await;
        result
    }

    async fn kill_all(&self) -> Result<EmergencyStopReport> {
        let running = self.shared.runtime.running_workers().await?;
        {
            let mut state = self.shared.state.lock().await;
            state.orderly_stops.extend(running.iter().cloned());
        }

        let runtime = &self.shared.runtime;
        let results = join_all(running.into_iter().map(|worker_id| async move {
            let result = runtime.kill(&worker_id).await;
            (worker_id, result)
        }))
        .await;

        let mut report = EmergencyStopReport::default();
        for (worker_id, result) in results {
            match result {
                Ok(()) => report.killed.push(worker_id),
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Emergency kill failed");
                    report.failed.push(worker_id);
                }
            }
        }
        report.killed.sort();
        report.failed.sort();

        self.shared.publish(SupervisorEvent::EmergencyStop {
            killed: report.killed.clone(),
            failed: report.failed.clone(),
            timestamp: Utc::now(),
        });
        Ok(report)
    }

    /// Current fleet summary
    pub async fn status(&self) -> FleetStatus {
        let state = self.shared.state.lock().await;
        let needs_attention = state
            .snapshots
            .values()
            .filter(|s| s.state.needs_attention())
            .map(|s| s.worker_id.clone())
            .collect();
        let gave_up = state
            .crashes
            .trackers()
            .filter(|t| t.gave_up)
            .map(|t| t.worker_id.clone())
            .collect();

        FleetStatus {
            timestamp: Utc::now(),
            running: state.initialized && !self.shared.cancel.is_cancelled(),
            spawns_paused: state.breaker.spawns_paused(),
            total_workers: state.snapshots.len(),
            counts: count_states(state.snapshots.values()),
            needs_attention,
            gave_up,
            recent_deaths: state.breaker.recent_deaths(),
            daily_spend: state.ledger.daily_total(),
        }
    }

    /// Latest snapshot of one worker
    pub async fn snapshot(&self, worker_id: &str) -> Option<HealthSnapshot> {
        self.shared.state.lock().await.snapshots.get(worker_id).cloned()
    }

    /// Crash count of one worker and whether restarts gave up
    pub async fn crash_tracker(&self, worker_id: &str) -> Option<CrashTracker> {
        self.shared.state.lock().await.crashes.get(worker_id).cloned()
    }

    /// Total spend of one worker
    pub async fn worker_spend(&self, worker_id: &str) -> f64 {
        self.shared.state.lock().await.ledger.worker_total(worker_id)
    }

    async fn drain_outcomes(&self) {
        {
            let mut tasks = self.tasks.lock().await;
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Background task failed");
                }
            }
        }

        let mut outcomes = self.outcomes.lock().await;
        while let Ok(outcome) = outcomes.try_recv() {
            match outcome {
                BackgroundOutcome::Handoff(event) => {
                    self.shared.in_progress.lock().await.remove(&event.worker_id);
                    self.shared.publish(SupervisorEvent::HandoffCompleted {
                        handoff: event,
                        timestamp: Utc::now(),
                    });
                }
                BackgroundOutcome::Rotation { worker_id, result } => {
                    self.shared.in_progress.lock().await.remove(&worker_id);
                    match result {
                        Ok(rotation) => self.shared.publish(SupervisorEvent::SessionRotated {
                            worker_id,
                            rotation,
                            timestamp: Utc::now(),
                        }),
                        Err(message) => self.shared.publish(SupervisorEvent::error(
                            Some(&worker_id),
                            format!("session rotation failed: {}", message),
                        )),
                    }
                }
            }
        }
    }

    async fn handle_crashes(&self, current: &HashSet<String>, now: DateTime<Utc>) -> Vec<String> {
        let restart_enabled = self.shared.config.restart.enabled;
        let mut restarts = Vec::new();
        let crashed;

        {
            let mut guard = self.shared.state.lock().await;
            let state = &mut *guard;
            crashed = detect_crashes(&state.previous_running, current, &mut state.orderly_stops);

            let departed: Vec<String> = state
                .previous_running
                .difference(current)
                .cloned()
                .collect();
            for worker_id in &departed {
                state.classifier.forget(worker_id);
                state.snapshots.remove(worker_id);
            }
            state.previous_running = current.clone();

            for worker_id in &crashed {
                let decision = match state.crashes.record_crash(worker_id, now) {
                    Ok(decision) => decision,
                    Err(e) => {
                        warn!(worker_id = %worker_id, error = %e, "Failed to persist crash tracker");
                        self.shared.publish(SupervisorEvent::error(
                            Some(worker_id),
                            format!("crash tracker write failed: {}", e),
                        ));
                        continue;
                    }
                };
                let crash_count = state.crashes.get(worker_id).map_or(0, |t| t.crash_count);
                warn!(worker_id = %worker_id, crash_count, "Worker crashed");
                self.shared.publish(SupervisorEvent::AgentCrashed {
                    worker_id: worker_id.clone(),
                    crash_count,
                    timestamp: now,
                });

                if state.breaker.record(now) {
                    let deaths = state.breaker.recent_deaths();
                    warn!(deaths, "Mass worker death detected, pausing spawns");
                    self.shared.publish(SupervisorEvent::MassDeathDetected {
                        deaths,
                        window_secs: self.shared.config.breaker.window.as_secs(),
                        timestamp: now,
                    });
                    self.shared.publish(SupervisorEvent::SpawnPaused {
                        reason: format!(
                            "{} deaths within {}s",
                            deaths,
                            self.shared.config.breaker.window.as_secs()
                        ),
                        timestamp: now,
                    });
                }

                match decision {
                    CrashDecision::Restart { delay, attempt } if restart_enabled => {
                        info!(
                            worker_id = %worker_id,
                            attempt,
                            delay_secs = delay.as_secs(),
                            "Scheduling restart"
                        );
                        self.shared.publish(SupervisorEvent::AgentRestarting {
                            worker_id: worker_id.clone(),
                            attempt,
                            delay_secs: delay.as_secs(),
                            timestamp: now,
                        });
                        restarts.push((worker_id.clone(), delay));
                    }
                    CrashDecision::Restart { .. } => {
                        debug!(worker_id = %worker_id, "Automatic restart disabled");
                    }
                    CrashDecision::GiveUp { crash_count } => {
                        error!(worker_id = %worker_id, crash_count, "Giving up on worker");
                        self.shared.publish(SupervisorEvent::AgentGaveUp {
                            worker_id: worker_id.clone(),
                            crash_count,
                            timestamp: now,
                        });
                    }
                    CrashDecision::AlreadyGaveUp => {
                        debug!(worker_id = %worker_id, "Worker already given up on");
                    }
                }
            }
        }

        for (worker_id, delay) in restarts {
            schedule_restart(self.shared.clone(), worker_id, delay);
        }
        crashed
    }

    async fn probe_workers(&self, running: &[String]) -> Vec<WorkerProbe> {
        let shared = &self.shared;
        let probes = join_all(running.iter().map(|worker_id| async move {
            let (alive, signals, usage, record, handoff_signals) = tokio::join!(
                shared.runtime.is_alive(worker_id),
                shared.runtime.activity(worker_id),
                shared.runtime.token_usage(worker_id),
                shared.store.get(worker_id),
                shared.store.handoff_signals(worker_id),
            );

            let (alive, signals) = match (alive, signals) {
                (Ok(alive), Ok(signals)) => (alive, signals),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(worker_id = %worker_id, error = %e, "Health probe failed");
                    shared.publish(SupervisorEvent::error(
                        Some(worker_id),
                        format!("health probe failed: {}", e),
                    ));
                    return None;
                }
            };
            let usage = usage
                .inspect_err(|e| {
                    shared.publish(SupervisorEvent::error(
                        Some(worker_id),
                        format!("token usage unavailable: {}", e),
                    ));
                })
                .ok();
            let record = record
                .inspect_err(|e| {
                    shared.publish(SupervisorEvent::error(
                        Some(worker_id),
                        format!("worker record unavailable: {}", e),
                    ));
                })
                .ok()
                .flatten();
            let handoff_signals = handoff_signals.unwrap_or_else(|e| {
                debug!(worker_id = %worker_id, error = %e, "Handoff signals unavailable");
                HandoffSignals::default()
            });

            Some(WorkerProbe {
                id: worker_id.clone(),
                alive,
                signals,
                usage,
                record,
                handoff_signals,
            })
        }))
        .await;

        probes.into_iter().flatten().collect()
    }

    async fn classify(
        &self,
        probes: &[WorkerProbe],
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Vec<(String, LogEntry)> {
        let mut transitions = Vec::new();
        let mut state = self.shared.state.lock().await;

        for probe in probes {
            let signal = self.reconciler.reconcile(&probe.signals);
            let classification = state
                .classifier
                .classify(&probe.id, signal.as_ref(), probe.alive, now);
            let snapshot = classification.snapshot.clone();

            if classification.transitioned() {
                debug!(
                    worker_id = %probe.id,
                    from = ?classification.previous,
                    to = %snapshot.state,
                    reason = %snapshot.reason,
                    "Health transition"
                );
                transitions.push((
                    probe.id.clone(),
                    LogEntry::HealthTransition {
                        from: classification.previous,
                        to: snapshot.state,
                        reason: snapshot.reason.clone(),
                    },
                ));
            }

            match snapshot.state {
                HealthState::Warning => self.shared.publish(SupervisorEvent::AgentWarning {
                    worker_id: probe.id.clone(),
                    reason: snapshot.reason.clone(),
                    consecutive_failures: snapshot.consecutive_failures,
                    timestamp: now,
                }),
                HealthState::Stuck => self.shared.publish(SupervisorEvent::AgentStuck {
                    worker_id: probe.id.clone(),
                    reason: snapshot.reason.clone(),
                    consecutive_failures: snapshot.consecutive_failures,
                    timestamp: now,
                }),
                HealthState::Healthy | HealthState::Dead => {}
            }

            state.snapshots.insert(probe.id.clone(), snapshot.clone());
            report.snapshots.push(snapshot);
        }

        self.shared.publish(SupervisorEvent::HealthCheck {
            counts: count_states(&report.snapshots),
            timestamp: now,
        });
        transitions
    }

    async fn account_costs(&self, probes: &[WorkerProbe]) -> Vec<CostAlert> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;

        for probe in probes {
            let Some(usage) = probe.usage else { continue };
            let baseline = state.ledger.billed_usage(&probe.id).unwrap_or_default();
            if usage == baseline {
                continue;
            }
            let delta = usage.accrued_since(&baseline);

            let model = probe.record.as_ref().map_or("unknown", |r| r.model.as_str());
            let unit = probe.record.as_ref().map(|r| r.unit_of_work_id.as_str());
            let amount = self.pricing.cost(model, &delta);
            if let Err(e) = state.ledger.record_usage(&probe.id, usage, amount, unit) {
                warn!(worker_id = %probe.id, error = %e, "Failed to persist cost ledger");
                self.shared.publish(SupervisorEvent::error(
                    Some(&probe.id),
                    format!("cost ledger write failed: {}", e),
                ));
            }
        }

        let mut evaluated: HashSet<CostScope> = HashSet::new();
        let mut raised: Vec<(String, CostAlert)> = Vec::new();
        for probe in probes {
            let unit = probe.record.as_ref().map(|r| r.unit_of_work_id.as_str());
            evaluated.insert(CostScope::Worker(probe.id.clone()));
            if let Some(unit) = unit {
                evaluated.insert(CostScope::UnitOfWork(unit.to_string()));
            }
            evaluated.insert(CostScope::Daily);

            for alert in state.ledger.check_cost_limits(&probe.id, unit, &self.limits) {
                if !raised.iter().any(|(_, a)| a.scope == alert.scope) {
                    raised.push((probe.id.clone(), alert));
                }
            }
        }

        let mut changed = Vec::new();
        for scope in &evaluated {
            if !raised.iter().any(|(_, a)| &a.scope == scope) {
                state.alert_levels.remove(scope);
            }
        }
        for (worker_id, alert) in raised {
            if state.alert_levels.get(&alert.scope) == Some(&alert.level) {
                continue;
            }
            state.alert_levels.insert(alert.scope.clone(), alert.level);
            warn!(
                worker_id = %worker_id,
                scope = %alert.scope,
                level = ?alert.level,
                spent = alert.spent,
                limit = alert.limit,
                "Cost alert"
            );
            self.shared.publish(SupervisorEvent::CostAlert {
                worker_id,
                alert: alert.clone(),
                timestamp: Utc::now(),
            });
            changed.push(alert);
        }
        changed
    }

    async fn launch_handoffs(
        &self,
        probes: &[WorkerProbe],
        snapshots: &[HealthSnapshot],
    ) -> Vec<String> {
        if !self.shared.config.handoff.enabled {
            return Vec::new();
        }
        if self.shared.state.lock().await.breaker.spawns_paused() {
            debug!("Spawns paused, not evaluating handoffs");
            return Vec::new();
        }

        let mut launched = Vec::new();
        for probe in probes {
            let Some(record) = &probe.record else { continue };
            let Some(snapshot) = snapshots.iter().find(|s| s.worker_id == probe.id) else {
                continue;
            };
            if snapshot.state == HealthState::Dead {
                continue;
            }

            let ctx = DetectionContext {
                record,
                snapshot,
                signals: &probe.handoff_signals,
            };
            let Some(trigger) = evaluate_triggers(&self.detectors, &ctx) else {
                continue;
            };

            if !self.shared.in_progress.lock().await.insert(probe.id.clone()) {
                debug!(worker_id = %probe.id, "Handoff already in progress");
                continue;
            }

            info!(
                worker_id = %probe.id,
                trigger = %trigger.kind,
                target = %trigger.target_model,
                "Handoff triggered"
            );
            self.shared.publish(SupervisorEvent::HandoffTriggered {
                worker_id: probe.id.clone(),
                trigger: trigger.clone(),
                timestamp: Utc::now(),
            });

            let shared = self.shared.clone();
            let record = record.clone();
            self.tasks.lock().await.spawn(async move {
                let event = execute_handoff(&shared, record, &trigger).await;
                shared.report(BackgroundOutcome::Handoff(event));
            });
            launched.push(probe.id.clone());
        }
        launched
    }

    async fn launch_rotations(&self, probes: &[WorkerProbe]) -> Vec<String> {
        let threshold = self.shared.config.rotation.token_threshold;
        let due: Vec<String> = {
            let state = self.shared.state.lock().await;
            if state.breaker.spawns_paused() {
                return Vec::new();
            }
            probes
                .iter()
                .filter(|p| p.alive && state.specialists.contains_key(&p.id))
                .filter(|p| p.usage.is_some_and(|usage| needs_rotation(&usage, threshold)))
                .map(|p| p.id.clone())
                .collect()
        };

        let mut launched = Vec::new();
        for worker_id in due {
            if !self.shared.in_progress.lock().await.insert(worker_id.clone()) {
                continue;
            }
            let shared = self.shared.clone();
            let id = worker_id.clone();
            self.tasks.lock().await.spawn(async move {
                let result = rotate_specialist(&shared, &id)
                    .await
                    .map_err(|e| e.to_string());
                shared.report(BackgroundOutcome::Rotation {
                    worker_id: id,
                    result,
                });
            });
            launched.push(worker_id);
        }
        launched
    }

    async fn write_status(&self) {
        let status = self.status().await;
        let path = self.shared.config.storage.status_path();
        if let Err(e) = write_json_atomic(&path, &status) {
            debug!(path = %path.display(), error = %e, "Failed to write fleet status");
        }
    }
}
