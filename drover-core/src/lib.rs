//! # Drover - Supervision Policy for Coding-Agent Fleets
//!
//! Drover keeps a fleet of long-running autonomous workers alive and within
//! budget. This crate holds the policy pieces, free of any process runtime:
//! - Health classification from noisy, multi-source activity signals
//! - Crash detection with capped exponential-backoff restart decisions
//! - A mass-death circuit breaker that pauses spawning until an operator resumes
//! - A durable cost ledger with per-worker, per-unit-of-work and daily alerts
//! - Handoff trigger detection for switching a worker to a better-suited model
//! - Tiered memory for rotating long-lived specialist sessions
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use drover_core::prelude::*;
//! use std::time::Duration;
//!
//! let mut classifier = HealthClassifier::new(Duration::from_secs(300), 3);
//! let signal = ActivitySignal::new(chrono::Utc::now(), SignalSource::Heartbeat, 1.0);
//! let result = classifier.classify("worker-1", Some(&signal), true, chrono::Utc::now());
//! assert_eq!(result.snapshot.state, HealthState::Healthy);
//! ```
//!
//! ## Architecture
//!
//! The owned supervisor lives in `drover-supervisor`; it drives these types
//! once per tick against a [`runtime::WorkerRuntime`] and publishes
//! [`events::SupervisorEvent`]s on an [`events::EventBus`].

pub mod breaker;
pub mod config;
pub mod crash;
pub mod error;
pub mod events;
pub mod handoff;
pub mod health;
pub mod ledger;
pub mod pricing;
pub mod rotation;
pub mod runtime;
pub mod storage;
pub mod transcript;
pub mod types;
pub mod violations;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::breaker::{BreakerState, MassDeathBreaker, record_death};
    pub use crate::config::{
        BreakerConfig, ConfigBuilder, CostConfig, DroverConfig, HandoffConfig, MonitorConfig,
        RestartConfig, RotationConfig, StorageConfig,
    };
    pub use crate::crash::{
        CrashDecision, CrashRegistry, CrashTracker, RestartPolicy, detect_crashes,
    };
    pub use crate::error::{DroverError, Result};
    pub use crate::events::{EventBus, EventReceiver, SupervisorEvent};
    pub use crate::handoff::{
        DetectionContext, HandoffEvent, HandoffTrigger, HandoffTriggerKind, TriggerDetector,
        default_detectors, evaluate_triggers, select_trigger,
    };
    pub use crate::health::{
        Classification, ConfidenceFloor, HealthClassifier, MostRecentWins, SignalReconciler,
    };
    pub use crate::ledger::{AlertLevel, CostAlert, CostLedger, CostLimits, CostScope};
    pub use crate::pricing::{ModelPricing, ModelRate};
    pub use crate::rotation::{
        RotationRecord, SpecialistSessionState, TieredMemory, needs_rotation,
    };
    pub use crate::runtime::{InMemoryWorkerStore, WorkerRuntime, WorkerStore};
    pub use crate::storage::{EventLog, LogEntry, LogRecord, MarkerStatus, RunningMarker};
    pub use crate::types::{
        ActivitySignal, HandoffSignals, HealthSnapshot, HealthState, HistoryItem, SignalSource,
        SpawnParams, SpawnedWorker, TokenUsage, WorkerRecord,
    };
    pub use crate::violations::{NudgeDecision, ViolationKind, ViolationRecord, ViolationTracker};
}
