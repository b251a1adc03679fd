//! User configuration: the INI file and typed key access for the CLI.

mod file;
mod keys;

pub use file::{
    config_dir, config_file_path, expand_tilde, CacheSettings, ConfigFile, ConfigFileError,
    DownloadSettings, LoggingSettings, ProcessingSettings, StreamingSettings, CONFIG_DIR_NAME,
    CONFIG_FILE_NAME, DEFAULT_LOG_LEVEL,
};
pub use keys::{ConfigKey, InvalidConfigValue, UnknownConfigKey};
