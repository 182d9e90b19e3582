//! Configuration types for the Drover fleet supervisor

use crate::pricing::ModelRate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the fleet supervisor
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DroverConfig {
    /// Health monitoring and recovery policy
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Crash restart policy
    #[serde(default)]
    pub restart: RestartConfig,

    /// Mass-death circuit breaker
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Spending limits and alerting
    #[serde(default)]
    pub cost: CostConfig,

    /// Model handoff policy
    #[serde(default)]
    pub handoff: HandoffConfig,

    /// Specialist session rotation
    #[serde(default)]
    pub rotation: RotationConfig,

    /// Durable state location
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Health monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval between supervisor ticks
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Time without activity before a worker is no longer healthy
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,

    /// Consecutive over-threshold checks before a worker is stuck
    pub consecutive_failures: u32,

    /// Send an advisory message to workers in the warning state
    pub poke_on_warning: bool,

    /// Terminate workers classified as stuck
    pub kill_on_stuck: bool,

    /// Message sent when poking an idle worker
    pub poke_message: String,

    /// Maximum nudges per violation episode
    pub max_nudges: u32,

    /// How long resolved-or-idle violation records are retained
    #[serde(with = "humantime_serde")]
    pub violation_retention: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(300),
            consecutive_failures: 3,
            poke_on_warning: true,
            kill_on_stuck: false,
            poke_message: "Status check: no activity observed recently. Please continue with your task or report what is blocking you.".to_string(),
            max_nudges: 3,
            violation_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Crash restart configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Restart crashed workers automatically
    pub enabled: bool,

    /// Backoff delays in seconds; the last value repeats for later retries
    pub backoff_secs: Vec<u64>,

    /// Crashes tolerated before giving up on a worker
    pub max_retries: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backoff_secs: vec![5, 15, 60],
            max_retries: 3,
        }
    }
}

/// Mass-death circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Trailing window for counting deaths
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Deaths within the window that trip the breaker
    pub threshold: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            threshold: 3,
        }
    }
}

/// Cost limits and alerting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Spend limit per worker in USD
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_worker_limit: Option<f64>,

    /// Spend limit per unit of work in USD
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_unit_limit: Option<f64>,

    /// Fleet-wide daily spend limit in USD
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<f64>,

    /// Fraction of a limit at which a warning is raised
    pub alert_threshold: f64,

    /// Per-model pricing overrides
    pub pricing: HashMap<String, ModelRate>,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            per_worker_limit: None,
            per_unit_limit: None,
            daily_limit: None,
            alert_threshold: 0.8,
            pricing: HashMap::new(),
        }
    }
}

/// Handoff policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Evaluate handoff triggers every tick
    pub enabled: bool,

    /// Model stuck or repeatedly failing workers are escalated to
    pub escalation_model: String,

    /// Model that implements once planning is done
    pub implementation_model: String,

    /// Model used for planning
    pub planning_model: String,

    /// Model that reviews completed work
    pub review_model: String,

    /// Failing test runs before escalating
    pub test_failure_threshold: u32,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            escalation_model: "opus".to_string(),
            implementation_model: "sonnet".to_string(),
            planning_model: "opus".to_string(),
            review_model: "haiku".to_string(),
            test_failure_threshold: 3,
        }
    }
}

/// Specialist session rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Cumulative input+output tokens that trigger a rotation
    pub token_threshold: u64,

    /// Most recent history items kept at full detail
    pub full_detail_items: usize,

    /// Following history items kept as summaries
    pub summary_items: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            token_threshold: 100_000,
            full_detail_items: 5,
            summary_items: 15,
        }
    }
}

/// Durable state location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the ledger, crash trackers, event log and running marker
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: dirs::data_local_dir()
                .map(|dir| dir.join("drover"))
                .unwrap_or_else(|| PathBuf::from("./.drover")),
        }
    }
}

impl StorageConfig {
    /// Path of the persisted cost ledger
    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("costs.json")
    }

    /// Path of the persisted crash trackers
    pub fn crashes_path(&self) -> PathBuf {
        self.state_dir.join("crashes.json")
    }

    /// Path of the append-only event log
    pub fn event_log_path(&self) -> PathBuf {
        self.state_dir.join("events.ndjson")
    }

    /// Path of the running marker
    pub fn marker_path(&self) -> PathBuf {
        self.state_dir.join("supervisor.pid.json")
    }

    /// Path of the fleet status written after every tick
    pub fn status_path(&self) -> PathBuf {
        self.state_dir.join("status.json")
    }
}

/// Builder for DroverConfig
pub struct ConfigBuilder {
    config: DroverConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            config: DroverConfig::default(),
        }
    }

    /// Set monitor configuration
    pub fn monitor(mut self, config: MonitorConfig) -> Self {
        self.config.monitor = config;
        self
    }

    /// Set restart configuration
    pub fn restart(mut self, config: RestartConfig) -> Self {
        self.config.restart = config;
        self
    }

    /// Set breaker configuration
    pub fn breaker(mut self, config: BreakerConfig) -> Self {
        self.config.breaker = config;
        self
    }

    /// Set cost configuration
    pub fn cost(mut self, config: CostConfig) -> Self {
        self.config.cost = config;
        self
    }

    /// Set handoff configuration
    pub fn handoff(mut self, config: HandoffConfig) -> Self {
        self.config.handoff = config;
        self
    }

    /// Set rotation configuration
    pub fn rotation(mut self, config: RotationConfig) -> Self {
        self.config.rotation = config;
        self
    }

    /// Place all durable state under `dir`
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage.state_dir = dir.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> DroverConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DroverConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (drover.toml)
    /// 3. Environment variable overrides (`DROVER_MONITOR__KILL_ON_STUCK=true`)
    /// 4. File named by DROVER_CONFIG_PATH
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid or the result fails validation.
    pub fn load() -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(DroverConfig::default()))
            .merge(Toml::file("drover.toml"))
            .merge(Env::prefixed("DROVER_").split("__"));

        if let Ok(path) = std::env::var("DROVER_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: DroverConfig = figment.extract().map_err(|e| {
            crate::error::DroverError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: DroverConfig = Figment::from(Serialized::defaults(DroverConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                crate::error::DroverError::Configuration(format!(
                    "Failed to load configuration file: {}",
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::DroverError::Configuration;

        if self.monitor.tick_interval.is_zero() {
            return Err(Configuration("monitor.tick_interval must be non-zero".into()));
        }
        if self.monitor.consecutive_failures == 0 {
            return Err(Configuration(
                "monitor.consecutive_failures must be at least 1".into(),
            ));
        }
        if self.restart.backoff_secs.is_empty() {
            return Err(Configuration("restart.backoff_secs must not be empty".into()));
        }
        if self.breaker.threshold == 0 {
            return Err(Configuration("breaker.threshold must be at least 1".into()));
        }
        let threshold = self.cost.alert_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Configuration(format!(
                "cost.alert_threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        Ok(())
    }
}
