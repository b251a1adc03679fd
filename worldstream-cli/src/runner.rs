//! Shared setup for commands that run the engine.

use std::future::Future;

use tokio::runtime::Runtime;
use tracing::info;
use worldstream::config::{config_file_path, ConfigFile};
use worldstream::logging::{init_logging, LoggingConfig, LoggingGuard};

use crate::error::CliError;

/// Loaded configuration, installed logging and a multi-threaded runtime.
pub struct CliRunner {
    config: ConfigFile,
    runtime: Runtime,
    _logging: LoggingGuard,
}

impl CliRunner {
    /// Load the config file and set up logging.
    ///
    /// `verbose` raises the log level to `debug` regardless of the file.
    pub fn new(verbose: bool) -> Result<Self, CliError> {
        let config = ConfigFile::load()?;

        let logging = init_logging(&LoggingConfig {
            level: if verbose {
                "debug".to_string()
            } else {
                config.logging.level.clone()
            },
            file: config.logging.file.clone(),
            ansi: true,
        })?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("worldstream")
            .build()
            .map_err(CliError::Runtime)?;

        Ok(Self {
            config,
            runtime,
            _logging: logging,
        })
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// Log the version and where configuration came from.
    pub fn log_startup(&self, command: &str) {
        info!(
            version = worldstream::VERSION,
            command,
            config = %config_file_path().display(),
            "WorldStream starting"
        );
        if let Some(file) = &self.config.logging.file {
            info!(path = %file.display(), "Logging to file");
        }
    }

    /// Drive `future` to completion on the runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
