//! Supervisor event stream
//!
//! Everything the supervisor decides is published as a typed
//! [`SupervisorEvent`] on an [`EventBus`]. Subscribers (the CLI, a status
//! dashboard, tests) each get an ordered receiver. Publishing never blocks and
//! never fails for lack of subscribers.
//!
//! # Example
//!
//! ```rust,ignore
//! use drover_core::events::{EventBus, SupervisorEvent};
//!
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! tokio::spawn(async move {
//!     while let Ok(event) = rx.recv().await {
//!         if let SupervisorEvent::AgentGaveUp { worker_id, .. } = &event {
//!             println!("{} needs an operator", worker_id);
//!         }
//!     }
//! });
//! ```

use crate::handoff::{HandoffEvent, HandoffTrigger};
use crate::ledger::CostAlert;
use crate::rotation::RotationRecord;
use crate::types::HealthState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::debug;

/// Events published by the fleet supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    /// Monitoring started
    Started {
        /// Owning process id
        pid: u32,
        /// When monitoring started
        timestamp: DateTime<Utc>,
    },

    /// Monitoring stopped
    Stopped {
        /// When monitoring stopped
        timestamp: DateTime<Utc>,
    },

    /// A tick classified the fleet
    HealthCheck {
        /// Workers per health state
        counts: BTreeMap<HealthState, usize>,
        /// When the check ran
        timestamp: DateTime<Utc>,
    },

    /// A worker is over the ping timeout
    AgentWarning {
        /// Worker concerned
        worker_id: String,
        /// Classifier explanation
        reason: String,
        /// Consecutive over-threshold checks
        consecutive_failures: u32,
        /// When the worker was classified
        timestamp: DateTime<Utc>,
    },

    /// A worker reached the stuck threshold
    AgentStuck {
        /// Worker concerned
        worker_id: String,
        /// Classifier explanation
        reason: String,
        /// Consecutive over-threshold checks
        consecutive_failures: u32,
        /// When the worker was classified
        timestamp: DateTime<Utc>,
    },

    /// An advisory message was sent to a worker
    PokedAgent {
        /// Worker concerned
        worker_id: String,
        /// Nudge number in the current episode
        nudge: u32,
        /// When the message was sent
        timestamp: DateTime<Utc>,
    },

    /// The supervisor terminated a worker
    KilledAgent {
        /// Worker concerned
        worker_id: String,
        /// Why it was killed
        reason: String,
        /// When it was killed
        timestamp: DateTime<Utc>,
    },

    /// A worker vanished without an orderly stop
    AgentCrashed {
        /// Worker concerned
        worker_id: String,
        /// Crashes counted by its tracker
        crash_count: u32,
        /// When the crash was observed
        timestamp: DateTime<Utc>,
    },

    /// A restart was scheduled
    AgentRestarting {
        /// Worker concerned
        worker_id: String,
        /// Restart attempt number
        attempt: u32,
        /// Backoff before the restart
        delay_secs: u64,
        /// When the restart was scheduled
        timestamp: DateTime<Utc>,
    },

    /// A scheduled restart did not produce a worker
    AgentRestartFailed {
        /// Worker concerned
        worker_id: String,
        /// Failure detail
        error: String,
        /// When the attempt failed
        timestamp: DateTime<Utc>,
    },

    /// Retry cap exceeded; automatic restarts stopped for this worker
    AgentGaveUp {
        /// Worker concerned
        worker_id: String,
        /// Crashes counted by its tracker
        crash_count: u32,
        /// When the supervisor gave up
        timestamp: DateTime<Utc>,
    },

    /// Too many deaths in the breaker window
    MassDeathDetected {
        /// Deaths in the window
        deaths: usize,
        /// Window length in seconds
        window_secs: u64,
        /// When the breaker tripped
        timestamp: DateTime<Utc>,
    },

    /// New spawns are paused
    SpawnPaused {
        /// Why spawning paused
        reason: String,
        /// When spawning paused
        timestamp: DateTime<Utc>,
    },

    /// An operator resumed spawning
    SpawnResumed {
        /// When spawning resumed
        timestamp: DateTime<Utc>,
    },

    /// A spend total crossed a threshold
    CostAlert {
        /// Worker whose spend triggered the check
        worker_id: String,
        /// The alert
        alert: CostAlert,
        /// When the alert was raised
        timestamp: DateTime<Utc>,
    },

    /// A handoff was selected for a worker
    HandoffTriggered {
        /// Worker concerned
        worker_id: String,
        /// Selected trigger
        trigger: HandoffTrigger,
        /// When the trigger was selected
        timestamp: DateTime<Utc>,
    },

    /// A handoff attempt finished, successfully or not
    HandoffCompleted {
        /// Audit record
        handoff: HandoffEvent,
        /// When the attempt finished
        timestamp: DateTime<Utc>,
    },

    /// A specialist session was rotated
    SessionRotated {
        /// Worker concerned
        worker_id: String,
        /// Old-to-new session mapping
        rotation: RotationRecord,
        /// When the rotation finished
        timestamp: DateTime<Utc>,
    },

    /// Every worker was killed and monitoring halted
    EmergencyStop {
        /// Workers killed
        killed: Vec<String>,
        /// Workers whose kill failed
        failed: Vec<String>,
        /// When the stop was issued
        timestamp: DateTime<Utc>,
    },

    /// An action failed
    Error {
        /// Worker concerned, if any
        worker_id: Option<String>,
        /// Failure detail
        message: String,
        /// When the failure happened
        timestamp: DateTime<Utc>,
    },
}

impl SupervisorEvent {
    /// Error event stamped now
    pub fn error(worker_id: Option<&str>, message: impl Into<String>) -> Self {
        SupervisorEvent::Error {
            worker_id: worker_id.map(str::to_string),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            SupervisorEvent::Started { .. } => "started",
            SupervisorEvent::Stopped { .. } => "stopped",
            SupervisorEvent::HealthCheck { .. } => "health_check",
            SupervisorEvent::AgentWarning { .. } => "agent_warning",
            SupervisorEvent::AgentStuck { .. } => "agent_stuck",
            SupervisorEvent::PokedAgent { .. } => "poked_agent",
            SupervisorEvent::KilledAgent { .. } => "killed_agent",
            SupervisorEvent::AgentCrashed { .. } => "agent_crashed",
            SupervisorEvent::AgentRestarting { .. } => "agent_restarting",
            SupervisorEvent::AgentRestartFailed { .. } => "agent_restart_failed",
            SupervisorEvent::AgentGaveUp { .. } => "agent_gave_up",
            SupervisorEvent::MassDeathDetected { .. } => "mass_death_detected",
            SupervisorEvent::SpawnPaused { .. } => "spawn_paused",
            SupervisorEvent::SpawnResumed { .. } => "spawn_resumed",
            SupervisorEvent::CostAlert { .. } => "cost_alert",
            SupervisorEvent::HandoffTriggered { .. } => "handoff_triggered",
            SupervisorEvent::HandoffCompleted { .. } => "handoff_completed",
            SupervisorEvent::SessionRotated { .. } => "session_rotated",
            SupervisorEvent::EmergencyStop { .. } => "emergency_stop",
            SupervisorEvent::Error { .. } => "error",
        }
    }

    /// Get the timestamp of the event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SupervisorEvent::Started { timestamp, .. }
            | SupervisorEvent::Stopped { timestamp }
            | SupervisorEvent::HealthCheck { timestamp, .. }
            | SupervisorEvent::AgentWarning { timestamp, .. }
            | SupervisorEvent::AgentStuck { timestamp, .. }
            | SupervisorEvent::PokedAgent { timestamp, .. }
            | SupervisorEvent::KilledAgent { timestamp, .. }
            | SupervisorEvent::AgentCrashed { timestamp, .. }
            | SupervisorEvent::AgentRestarting { timestamp, .. }
            | SupervisorEvent::AgentRestartFailed { timestamp, .. }
            | SupervisorEvent::AgentGaveUp { timestamp, .. }
            | SupervisorEvent::MassDeathDetected { timestamp, .. }
            | SupervisorEvent::SpawnPaused { timestamp, .. }
            | SupervisorEvent::SpawnResumed { timestamp }
            | SupervisorEvent::CostAlert { timestamp, .. }
            | SupervisorEvent::HandoffTriggered { timestamp, .. }
            | SupervisorEvent::HandoffCompleted { timestamp, .. }
            | SupervisorEvent::SessionRotated { timestamp, .. }
            | SupervisorEvent::EmergencyStop { timestamp, .. }
            | SupervisorEvent::Error { timestamp, .. } => *timestamp,
        }
    }

    /// Get the worker_id if the event concerns one worker
    pub fn worker_id(&self) -> Option<&str> {
        match self {
            SupervisorEvent::AgentWarning { worker_id, .. }
            | SupervisorEvent::AgentStuck { worker_id, .. }
            | SupervisorEvent::PokedAgent { worker_id, .. }
            | SupervisorEvent::KilledAgent { worker_id, .. }
            | SupervisorEvent::AgentCrashed { worker_id, .. }
            | SupervisorEvent::AgentRestarting { worker_id, .. }
            | SupervisorEvent::AgentRestartFailed { worker_id, .. }
            | SupervisorEvent::AgentGaveUp { worker_id, .. }
            | SupervisorEvent::CostAlert { worker_id, .. }
            | SupervisorEvent::HandoffTriggered { worker_id, .. }
            | SupervisorEvent::SessionRotated { worker_id, .. } => Some(worker_id),
            SupervisorEvent::HandoffCompleted { handoff, .. } => Some(&handoff.worker_id),
            SupervisorEvent::Error { worker_id, .. } => worker_id.as_deref(),
            SupervisorEvent::Started { .. }
            | SupervisorEvent::Stopped { .. }
            | SupervisorEvent::HealthCheck { .. }
            | SupervisorEvent::MassDeathDetected { .. }
            | SupervisorEvent::SpawnPaused { .. }
            | SupervisorEvent::SpawnResumed { .. }
            | SupervisorEvent::EmergencyStop { .. } => None,
        }
    }
}

/// Receiver half of an event subscription
pub type EventReceiver = broadcast::Receiver<SupervisorEvent>;

/// Broadcast channel for supervisor events.
///
/// Cloning the bus shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SupervisorEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per slow subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Publish an event; returns how many subscribers received it
    pub fn publish(&self, event: SupervisorEvent) -> usize {
        debug!(
            event_type = event.event_type(),
            worker_id = event.worker_id().unwrap_or("-"),
            "Supervisor event"
        );
        self.sender.send(event).unwrap_or(0)
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
