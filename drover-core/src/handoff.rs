//! Handoff trigger detection
//!
//! Independent detectors look at one worker per tick and each propose at most
//! one [`HandoffTrigger`]. When several fire together, [`select_trigger`]
//! keeps the one with the highest priority.

use crate::config::HandoffConfig;
use crate::types::{HandoffSignals, HealthSnapshot, HealthState, WorkerRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a handoff is warranted, in descending priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffTriggerKind {
    /// Worker is stuck on its current model
    StuckEscalation,
    /// Planning finished; switch to the implementation model
    PlanningComplete,
    /// Tests keep failing
    TestFailure,
    /// Operator request or task completion
    Manual,
}

impl HandoffTriggerKind {
    /// Lower value wins
    pub fn priority(&self) -> u8 {
        match self {
            HandoffTriggerKind::StuckEscalation => 0,
            HandoffTriggerKind::PlanningComplete => 1,
            HandoffTriggerKind::TestFailure => 2,
            HandoffTriggerKind::Manual => 3,
        }
    }
}

impl std::fmt::Display for HandoffTriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandoffTriggerKind::StuckEscalation => write!(f, "stuck_escalation"),
            HandoffTriggerKind::PlanningComplete => write!(f, "planning_complete"),
            HandoffTriggerKind::TestFailure => write!(f, "test_failure"),
            HandoffTriggerKind::Manual => write!(f, "manual"),
        }
    }
}

/// A proposed model switch for one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffTrigger {
    /// Trigger type
    pub kind: HandoffTriggerKind,
    /// Suggested target model
    pub target_model: String,
    /// Human-readable reason
    pub reason: String,
}

/// Everything a detector may look at
#[derive(Debug, Clone)]
pub struct DetectionContext<'a> {
    /// Worker record
    pub record: &'a WorkerRecord,
    /// Current health snapshot
    pub snapshot: &'a HealthSnapshot,
    /// Conditions reported by the spawning layer
    pub signals: &'a HandoffSignals,
}

/// One independent handoff condition
pub trait TriggerDetector: Send + Sync {
    /// Propose a trigger, or none
    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<HandoffTrigger>;

    /// Get the detector name
    fn name(&self) -> &'static str;
}

/// Escalate a stuck worker to a stronger model
pub struct StuckEscalation {
    escalation_model: String,
}

impl StuckEscalation {
    /// Create the detector
    pub fn new(escalation_model: impl Into<String>) -> Self {
        Self {
            escalation_model: escalation_model.into(),
        }
    }
}

impl TriggerDetector for StuckEscalation {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<HandoffTrigger> {
        if ctx.snapshot.state != HealthState::Stuck || ctx.record.model == self.escalation_model {
            return None;
        }
        Some(HandoffTrigger {
            kind: HandoffTriggerKind::StuckEscalation,
            target_model: self.escalation_model.clone(),
            reason: format!("stuck on {}: {}", ctx.record.model, ctx.snapshot.reason),
        })
    }

    fn name(&self) -> &'static str {
        "stuck_escalation"
    }
}

/// Move from the planning model to the implementation model
pub struct PlanningComplete {
    planning_model: String,
    implementation_model: String,
}

impl PlanningComplete {
    /// Create the detector
    pub fn new(planning_model: impl Into<String>, implementation_model: impl Into<String>) -> Self {
        Self {
            planning_model: planning_model.into(),
            implementation_model: implementation_model.into(),
        }
    }
}

impl TriggerDetector for PlanningComplete {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<HandoffTrigger> {
        if !ctx.signals.planning_complete
            || ctx.record.model != self.planning_model
            || self.planning_model == self.implementation_model
        {
            return None;
        }
        Some(HandoffTrigger {
            kind: HandoffTriggerKind::PlanningComplete,
            target_model: self.implementation_model.clone(),
            reason: "planning complete".to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "planning_complete"
    }
}

/// Escalate after repeated failing test runs
pub struct TestFailure {
    threshold: u32,
    escalation_model: String,
}

impl TestFailure {
    /// Create the detector
    pub fn new(threshold: u32, escalation_model: impl Into<String>) -> Self {
        Self {
            threshold: threshold.max(1),
            escalation_model: escalation_model.into(),
        }
    }
}

impl TriggerDetector for TestFailure {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<HandoffTrigger> {
        if ctx.signals.failing_test_runs < self.threshold
            || ctx.record.model == self.escalation_model
        {
            return None;
        }
        Some(HandoffTrigger {
            kind: HandoffTriggerKind::TestFailure,
            target_model: self.escalation_model.clone(),
            reason: format!("{} consecutive failing test runs", ctx.signals.failing_test_runs),
        })
    }

    fn name(&self) -> &'static str {
        "test_failure"
    }
}

/// Operator-requested handoff, or review once the task is complete
pub struct ManualOrComplete {
    review_model: String,
}

impl ManualOrComplete {
    /// Create the detector
    pub fn new(review_model: impl Into<String>) -> Self {
        Self {
            review_model: review_model.into(),
        }
    }
}

impl TriggerDetector for ManualOrComplete {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<HandoffTrigger> {
        if let Some(target) = &ctx.signals.manual_target {
            if *target != ctx.record.model {
                return Some(HandoffTrigger {
                    kind: HandoffTriggerKind::Manual,
                    target_model: target.clone(),
                    reason: "operator requested handoff".to_string(),
                });
            }
        }
        if ctx.signals.task_complete && ctx.record.model != self.review_model {
            return Some(HandoffTrigger {
                kind: HandoffTriggerKind::Manual,
                target_model: self.review_model.clone(),
                reason: "task complete, handing off for review".to_string(),
            });
        }
        None
    }

    fn name(&self) -> &'static str {
        "manual_or_complete"
    }
}

/// The built-in detectors configured from `config`
pub fn default_detectors(config: &HandoffConfig) -> Vec<Box<dyn TriggerDetector>> {
    vec![
        Box::new(StuckEscalation::new(&config.escalation_model)),
        Box::new(PlanningComplete::new(
            &config.planning_model,
            &config.implementation_model,
        )),
        Box::new(TestFailure::new(
            config.test_failure_threshold,
            &config.escalation_model,
        )),
        Box::new(ManualOrComplete::new(&config.review_model)),
    ]
}

/// Run every detector and keep the highest-priority trigger
pub fn evaluate_triggers(
    detectors: &[Box<dyn TriggerDetector>],
    ctx: &DetectionContext<'_>,
) -> Option<HandoffTrigger> {
    select_trigger(detectors.iter().filter_map(|d| d.detect(ctx)).collect())
}

/// Pick exactly one trigger by priority
pub fn select_trigger(triggers: Vec<HandoffTrigger>) -> Option<HandoffTrigger> {
    triggers.into_iter().min_by_key(|t| t.kind.priority())
}

/// Immutable audit record of a handoff attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffEvent {
    /// Unique id of this record
    pub id: Uuid,
    /// Original worker
    pub worker_id: String,
    /// Replacement worker, when the spawn succeeded
    pub new_worker_id: Option<String>,
    /// Unit of work carried over
    pub unit_of_work_id: String,
    /// Model before the handoff
    pub source_model: String,
    /// Model after the handoff
    pub target_model: String,
    /// Trigger type
    pub trigger: HandoffTriggerKind,
    /// Whether the replacement is running and the original torn down
    pub success: bool,
    /// Failure detail
    pub error: Option<String>,
    /// Spend accrued by the original worker up to the handoff
    pub cost_at_handoff: f64,
    /// When the handoff finished
    pub timestamp: DateTime<Utc>,
}
