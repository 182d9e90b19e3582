//! Error types for Drover operations

/// Result type for Drover operations
pub type Result<T> = std::result::Result<T, DroverError>;

/// Error types for the fleet supervisor core
#[derive(Debug, thiserror::Error)]
pub enum DroverError {
    /// The worker runtime rejected or failed an operation
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Worker not known to the runtime or the worker store
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    /// New spawns are paused by the mass-death circuit breaker
    #[error("Spawns are paused after mass worker death")]
    SpawnsPaused,

    /// The supervisor was stopped while the operation was under way
    #[error("Supervisor stopped")]
    Stopped,

    /// Another supervisor instance owns monitoring
    #[error("Supervisor already running (pid {pid})")]
    AlreadyRunning {
        /// Process id recorded in the running marker
        pid: u32,
    },

    /// A handoff for this worker is already being executed
    #[error("Handoff already in progress for worker {0}")]
    HandoffInProgress(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Durable state could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for DroverError {
    fn from(s: String) -> Self {
        DroverError::Other(s)
    }
}

impl From<&str> for DroverError {
    fn from(s: &str) -> Self {
        DroverError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for DroverError {
    fn from(err: anyhow::Error) -> Self {
        DroverError::Other(err.to_string())
    }
}
