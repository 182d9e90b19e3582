//! Durable cost ledger with threshold alerting
//!
//! Keeps running spend per worker, per unit of work, and for the current
//! calendar day. Every `record_cost` persists the whole ledger with an atomic
//! temp-file-then-rename write. The daily total resets lazily: the first
//! write after the local date rolls over zeroes it, and reads in the meantime
//! treat it as zero without touching state.
//!
//! The ledger also keeps the token usage already billed for each worker's
//! session, so a reloaded ledger prices only what accrued since.

use crate::config::CostConfig;
use crate::error::Result;
use crate::storage::{read_json_or_default, write_json_atomic};
use crate::types::TokenUsage;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LedgerState {
    workers: BTreeMap<String, f64>,
    units_of_work: BTreeMap<String, f64>,
    daily_total: f64,
    last_reset: Option<NaiveDate>,
    #[serde(default)]
    billed_usage: BTreeMap<String, TokenUsage>,
}

/// Limits checked by [`CostLedger::check_cost_limits`]
#[derive(Debug, Clone, PartialEq)]
pub struct CostLimits {
    /// Spend limit per worker
    pub per_worker: Option<f64>,
    /// Spend limit per unit of work
    pub per_unit: Option<f64>,
    /// Daily spend limit
    pub daily: Option<f64>,
    /// Fraction of a limit at which to warn
    pub alert_threshold: f64,
}

impl From<&CostConfig> for CostLimits {
    fn from(config: &CostConfig) -> Self {
        Self {
            per_worker: config.per_worker_limit,
            per_unit: config.per_unit_limit,
            daily: config.daily_limit,
            alert_threshold: config.alert_threshold,
        }
    }
}

/// Which total an alert concerns
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum CostScope {
    /// One worker
    Worker(String),
    /// One unit of work
    UnitOfWork(String),
    /// The fleet for today
    Daily,
}

impl std::fmt::Display for CostScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CostScope::Worker(id) => write!(f, "worker {}", id),
            CostScope::UnitOfWork(id) => write!(f, "unit of work {}", id),
            CostScope::Daily => write!(f, "daily"),
        }
    }
}

/// Severity of a cost alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Spend crossed the alert threshold
    Warning,
    /// Spend reached the limit
    LimitReached,
}

/// A spend total at or above its alert threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostAlert {
    /// Total concerned
    pub scope: CostScope,
    /// Severity
    pub level: AlertLevel,
    /// Amount spent
    pub spent: f64,
    /// Configured limit
    pub limit: f64,
    /// spent / limit
    pub percent_used: f64,
}

/// Running spend totals, persisted on every write
#[derive(Debug)]
pub struct CostLedger {
    path: Option<PathBuf>,
    state: LedgerState,
}

impl CostLedger {
    /// Ledger that is never persisted
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: LedgerState::default(),
        }
    }

    /// Load the ledger from `path`, starting empty if it does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = read_json_or_default(&path)?;
        Ok(Self {
            path: Some(path),
            state,
        })
    }

    /// Add `amount` to the worker, unit-of-work and daily totals and persist
    pub fn record_cost(
        &mut self,
        worker_id: &str,
        amount: f64,
        unit_of_work_id: Option<&str>,
    ) -> Result<()> {
        self.record_cost_on(today(), worker_id, amount, unit_of_work_id)
    }

    /// [`record_cost`](Self::record_cost) with an explicit calendar date
    pub fn record_cost_on(
        &mut self,
        date: NaiveDate,
        worker_id: &str,
        amount: f64,
        unit_of_work_id: Option<&str>,
    ) -> Result<()> {
        self.accrue(date, worker_id, amount, unit_of_work_id);
        self.persist()
    }

    /// Token usage already billed for the worker's current session
    pub fn billed_usage(&self, worker_id: &str) -> Option<TokenUsage> {
        self.state.billed_usage.get(worker_id).copied()
    }

    /// Bill `amount` for the usage accrued up to `usage` and remember `usage`
    /// as the worker's new baseline. Both land in the same write.
    pub fn record_usage(
        &mut self,
        worker_id: &str,
        usage: TokenUsage,
        amount: f64,
        unit_of_work_id: Option<&str>,
    ) -> Result<()> {
        self.record_usage_on(today(), worker_id, usage, amount, unit_of_work_id)
    }

    /// [`record_usage`](Self::record_usage) with an explicit calendar date
    pub fn record_usage_on(
        &mut self,
        date: NaiveDate,
        worker_id: &str,
        usage: TokenUsage,
        amount: f64,
        unit_of_work_id: Option<&str>,
    ) -> Result<()> {
        self.accrue(date, worker_id, amount, unit_of_work_id);
        self.state.billed_usage.insert(worker_id.to_string(), usage);
        self.persist()
    }

    /// Forget the worker's usage baseline; its next session bills from zero
    pub fn reset_billed_usage(&mut self, worker_id: &str) -> Result<()> {
        if self.state.billed_usage.remove(worker_id).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    fn accrue(
        &mut self,
        date: NaiveDate,
        worker_id: &str,
        amount: f64,
        unit_of_work_id: Option<&str>,
    ) {
        if self.state.last_reset != Some(date) {
            if self.state.last_reset.is_some() {
                info!(
                    previous_total = self.state.daily_total,
                    date = %date,
                    "Resetting daily cost total"
                );
            }
            self.state.daily_total = 0.0;
            self.state.last_reset = Some(date);
        }

        *self
            .state
            .workers
            .entry(worker_id.to_string())
            .or_insert(0.0) += amount;
        if let Some(unit) = unit_of_work_id {
            *self
                .state
                .units_of_work
                .entry(unit.to_string())
                .or_insert(0.0) += amount;
        }
        self.state.daily_total += amount;
    }

    /// Compare totals with `limits` without changing anything
    pub fn check_cost_limits(
        &self,
        worker_id: &str,
        unit_of_work_id: Option<&str>,
        limits: &CostLimits,
    ) -> Vec<CostAlert> {
        self.check_cost_limits_on(today(), worker_id, unit_of_work_id, limits)
    }

    /// [`check_cost_limits`](Self::check_cost_limits) with an explicit calendar date
    pub fn check_cost_limits_on(
        &self,
        date: NaiveDate,
        worker_id: &str,
        unit_of_work_id: Option<&str>,
        limits: &CostLimits,
    ) -> Vec<CostAlert> {
        let mut alerts = Vec::new();

        if let Some(limit) = limits.per_worker {
            let spent = self.worker_total(worker_id);
            alerts.extend(evaluate(
                CostScope::Worker(worker_id.to_string()),
                spent,
                limit,
                limits.alert_threshold,
            ));
        }
        if let (Some(limit), Some(unit)) = (limits.per_unit, unit_of_work_id) {
            let spent = self.unit_total(unit);
            alerts.extend(evaluate(
                CostScope::UnitOfWork(unit.to_string()),
                spent,
                limit,
                limits.alert_threshold,
            ));
        }
        if let Some(limit) = limits.daily {
            alerts.extend(evaluate(
                CostScope::Daily,
                self.daily_total_on(date),
                limit,
                limits.alert_threshold,
            ));
        }

        alerts
    }

    /// Total spend of one worker
    pub fn worker_total(&self, worker_id: &str) -> f64 {
        self.state.workers.get(worker_id).copied().unwrap_or(0.0)
    }

    /// Total spend of one unit of work
    pub fn unit_total(&self, unit_of_work_id: &str) -> f64 {
        self.state
            .units_of_work
            .get(unit_of_work_id)
            .copied()
            .unwrap_or(0.0)
    }

    /// Today's fleet spend
    pub fn daily_total(&self) -> f64 {
        self.daily_total_on(today())
    }

    fn daily_total_on(&self, date: NaiveDate) -> f64 {
        if self.state.last_reset == Some(date) {
            self.state.daily_total
        } else {
            0.0
        }
    }

    /// Date the daily total was last reset
    pub fn last_reset(&self) -> Option<NaiveDate> {
        self.state.last_reset
    }

    /// Per-worker totals
    pub fn workers(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.state.workers.iter()
    }

    /// Per-unit-of-work totals
    pub fn units_of_work(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.state.units_of_work.iter()
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.path {
            write_json_atomic(path, &self.state)?;
        }
        Ok(())
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn evaluate(scope: CostScope, spent: f64, limit: f64, threshold: f64) -> Option<CostAlert> {
    if limit <= 0.0 {
        return None;
    }
    let percent_used = spent / limit;
    let level = if percent_used >= 1.0 {
        AlertLevel::LimitReached
    } else if percent_used >= threshold {
        AlertLevel::Warning
    } else {
        return None;
    };
    Some(CostAlert {
        scope,
        level,
        spent,
        limit,
        percent_used,
    })
}
