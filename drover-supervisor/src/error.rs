//! Error types for supervisor operations

use drover_core::error::DroverError;
use thiserror::Error;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error types for supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Core(#[from] DroverError),

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    /// Whether the error is the breaker rejecting a spawn
    pub fn is_spawns_paused(&self) -> bool {
        matches!(self, SupervisorError::Core(DroverError::SpawnsPaused))
    }
}
