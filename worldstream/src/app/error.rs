//! Engine startup errors.

use thiserror::Error;

use crate::asset::WorkerSpawnError;

/// Errors that stop the engine from starting.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The download worker could not be spawned.
    #[error("Failed to spawn download worker: {0}")]
    WorkerSpawn(#[from] WorkerSpawnError),

    /// No Tokio runtime to run on.
    #[error("No Tokio runtime available: {0}")]
    NoRuntime(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::Config("radius must be positive".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("radius must be positive"));
    }
}
