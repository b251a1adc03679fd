//! CLI error type.

use std::fmt;

use worldstream::app::EngineError;
use worldstream::config::ConfigFileError;
use worldstream::logging::LoggingError;

/// Errors surfaced to the user by the `worldstream` binary.
#[derive(Debug)]
pub enum CliError {
    /// Bad user input or configuration.
    Config(String),
    ConfigFile(ConfigFileError),
    Logging(LoggingError),
    /// The Tokio runtime could not be built.
    Runtime(std::io::Error),
    Engine(EngineError),
    Snapshots(String),
}

impl CliError {
    /// Print the error and exit with status 1.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);
        std::process::exit(1);
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "{}", msg),
            CliError::ConfigFile(e) => write!(f, "Configuration file error: {}", e),
            CliError::Logging(e) => write!(f, "Failed to initialize logging: {}", e),
            CliError::Runtime(e) => write!(f, "Failed to start async runtime: {}", e),
            CliError::Engine(e) => write!(f, "Streaming engine error: {}", e),
            CliError::Snapshots(msg) => write!(f, "Snapshot error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::ConfigFile(e) => Some(e),
            CliError::Logging(e) => Some(e),
            CliError::Runtime(e) => Some(e),
            CliError::Engine(e) => Some(e),
            CliError::Config(_) | CliError::Snapshots(_) => None,
        }
    }
}

impl From<ConfigFileError> for CliError {
    fn from(e: ConfigFileError) -> Self {
        CliError::ConfigFile(e)
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        CliError::Logging(e)
    }
}

impl From<EngineError> for CliError {
    fn from(e: EngineError) -> Self {
        CliError::Engine(e)
    }
}
