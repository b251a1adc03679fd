//! INI configuration file.
//!
//! Located at `~/.worldstream/config.ini`:
//!
//! ```ini
//! [streaming]
//! radius = 250
//! update_threshold = 10
//! hysteresis = 1.02
//! cell_size = 100
//! lod_distance = 150
//! input_quiet_period_ms = 1000
//! max_concurrent_loads = 16
//!
//! [download]
//! timeout = 30
//! parallel = 8
//! max_bytes = 67108864
//! max_triangles = 1000000
//! max_texture_size = 4096
//!
//! [processing]
//! threads = 0
//! slow_interval_ms = 16
//! base_size = 1.0
//!
//! [cache]
//! cleanup_interval = 10
//! snapshot_dir = ~/.worldstream/snapshots
//!
//! [logging]
//! level = info
//! file = ~/.worldstream/worldstream.log
//! ```
//!
//! Missing keys keep their defaults; unknown keys are ignored.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use thiserror::Error;

use crate::app::{EngineConfig, DEFAULT_CLEANUP_INTERVAL_SECS};
use crate::asset::{
    FetchLimits, DEFAULT_BASE_SIZE, DEFAULT_DOWNLOAD_TIMEOUT_SECS, DEFAULT_MAX_BYTES,
    DEFAULT_MAX_CONCURRENT_DOWNLOADS, DEFAULT_MAX_TEXTURE_SIZE, DEFAULT_MAX_TRIANGLES,
    DEFAULT_SLOW_INTERVAL_MS,
};
use crate::world::{
    DEFAULT_CELL_SIZE, DEFAULT_EVICTION_HYSTERESIS, DEFAULT_INPUT_QUIET_PERIOD_MS,
    DEFAULT_LOD_DISTANCE, DEFAULT_MAX_CONCURRENT_LOADS, DEFAULT_STREAMING_RADIUS,
    DEFAULT_UPDATE_THRESHOLD,
};

/// Name of the configuration directory under the home directory.
pub const CONFIG_DIR_NAME: &str = ".worldstream";

/// Name of the configuration file.
pub const CONFIG_FILE_NAME: &str = "config.ini";

/// Default log level when neither the file nor `RUST_LOG` sets one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Errors reading or writing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(String),

    #[error("invalid value '{value}' for {section}.{key}: {reason}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// `[streaming]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingSettings {
    pub radius: f32,
    pub update_threshold: f32,
    pub hysteresis: f32,
    pub cell_size: f32,
    pub lod_distance: f32,
    pub input_quiet_period_ms: u64,
    pub max_concurrent_loads: usize,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            radius: DEFAULT_STREAMING_RADIUS,
            update_threshold: DEFAULT_UPDATE_THRESHOLD,
            hysteresis: DEFAULT_EVICTION_HYSTERESIS,
            cell_size: DEFAULT_CELL_SIZE,
            lod_distance: DEFAULT_LOD_DISTANCE,
            input_quiet_period_ms: DEFAULT_INPUT_QUIET_PERIOD_MS,
            max_concurrent_loads: DEFAULT_MAX_CONCURRENT_LOADS,
        }
    }
}

/// `[download]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadSettings {
    /// Per-download timeout in seconds.
    pub timeout: u64,
    /// Concurrent transfers.
    pub parallel: usize,
    pub max_bytes: u64,
    pub max_triangles: u64,
    pub max_texture_size: u32,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            parallel: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_bytes: DEFAULT_MAX_BYTES,
            max_triangles: DEFAULT_MAX_TRIANGLES,
            max_texture_size: DEFAULT_MAX_TEXTURE_SIZE,
        }
    }
}

/// `[processing]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingSettings {
    /// Fast-profile concurrency; `0` uses the available parallelism.
    pub threads: usize,
    pub slow_interval_ms: u64,
    pub base_size: f32,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            threads: 0,
            slow_interval_ms: DEFAULT_SLOW_INTERVAL_MS,
            base_size: DEFAULT_BASE_SIZE,
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    /// Cleanup interval in seconds; `0` disables the cleanup daemon.
    pub cleanup_interval: u64,
    /// Region snapshot directory; `None` disables snapshots.
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL_SECS,
            snapshot_dir: crate::snapshot::default_snapshot_dir(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
    /// Log file; `None` logs to stderr only.
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: config_dir().map(|dir| dir.join("worldstream.log")),
        }
    }
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    pub streaming: StreamingSettings,
    pub download: DownloadSettings,
    pub processing: ProcessingSettings,
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
}

/// `~/.worldstream`, if the home directory is known.
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR_NAME))
}

/// Path of the configuration file.
pub fn config_file_path() -> PathBuf {
    config_dir()
        .unwrap_or_else(|| PathBuf::from(CONFIG_DIR_NAME))
        .join(CONFIG_FILE_NAME)
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ if path == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(path)),
        _ => PathBuf::from(path),
    }
}

impl ConfigFile {
    /// Load from the default location. A missing file yields defaults.
    pub fn load() -> Result<Self, ConfigFileError> {
        let path = config_file_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigFileError::Parse(e.to_string()))?;
        Self::from_ini(&ini)
    }

    /// Parse INI text.
    pub fn parse(text: &str) -> Result<Self, ConfigFileError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigFileError::Parse(e.to_string()))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigFileError> {
        let mut config = Self::default();

        if let Some(s) = ini.section(Some("streaming")) {
            let c = &mut config.streaming;
            read(s, "streaming", "radius", &mut c.radius)?;
            read(s, "streaming", "update_threshold", &mut c.update_threshold)?;
            read(s, "streaming", "hysteresis", &mut c.hysteresis)?;
            read(s, "streaming", "cell_size", &mut c.cell_size)?;
            read(s, "streaming", "lod_distance", &mut c.lod_distance)?;
            read(s, "streaming", "input_quiet_period_ms", &mut c.input_quiet_period_ms)?;
            read(s, "streaming", "max_concurrent_loads", &mut c.max_concurrent_loads)?;
        }

        if let Some(s) = ini.section(Some("download")) {
            let c = &mut config.download;
            read(s, "download", "timeout", &mut c.timeout)?;
            read(s, "download", "parallel", &mut c.parallel)?;
            read(s, "download", "max_bytes", &mut c.max_bytes)?;
            read(s, "download", "max_triangles", &mut c.max_triangles)?;
            read(s, "download", "max_texture_size", &mut c.max_texture_size)?;
        }

        if let Some(s) = ini.section(Some("processing")) {
            let c = &mut config.processing;
            read(s, "processing", "threads", &mut c.threads)?;
            read(s, "processing", "slow_interval_ms", &mut c.slow_interval_ms)?;
            read(s, "processing", "base_size", &mut c.base_size)?;
        }

        if let Some(s) = ini.section(Some("cache")) {
            read(s, "cache", "cleanup_interval", &mut config.cache.cleanup_interval)?;
            if let Some(v) = s.get("snapshot_dir") {
                config.cache.snapshot_dir = optional_path(v);
            }
        }

        if let Some(s) = ini.section(Some("logging")) {
            if let Some(v) = s.get("level") {
                config.logging.level = v.trim().to_string();
            }
            if let Some(v) = s.get("file") {
                config.logging.file = optional_path(v);
            }
        }

        Ok(config)
    }

    /// Save to the default location, creating the directory if needed.
    pub fn save(&self) -> Result<(), ConfigFileError> {
        self.save_to(&config_file_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigFileError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.to_ini().write_to_file(path)?;
        Ok(())
    }

    fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        let s = &self.streaming;
        ini.with_section(Some("streaming"))
            .set("radius", s.radius.to_string())
            .set("update_threshold", s.update_threshold.to_string())
            .set("hysteresis", s.hysteresis.to_string())
            .set("cell_size", s.cell_size.to_string())
            .set("lod_distance", s.lod_distance.to_string())
            .set("input_quiet_period_ms", s.input_quiet_period_ms.to_string())
            .set("max_concurrent_loads", s.max_concurrent_loads.to_string());

        let d = &self.download;
        ini.with_section(Some("download"))
            .set("timeout", d.timeout.to_string())
            .set("parallel", d.parallel.to_string())
            .set("max_bytes", d.max_bytes.to_string())
            .set("max_triangles", d.max_triangles.to_string())
            .set("max_texture_size", d.max_texture_size.to_string());

        let p = &self.processing;
        ini.with_section(Some("processing"))
            .set("threads", p.threads.to_string())
            .set("slow_interval_ms", p.slow_interval_ms.to_string())
            .set("base_size", p.base_size.to_string());

        ini.with_section(Some("cache"))
            .set("cleanup_interval", self.cache.cleanup_interval.to_string())
            .set("snapshot_dir", path_value(&self.cache.snapshot_dir));

        ini.with_section(Some("logging"))
            .set("level", self.logging.level.clone())
            .set("file", path_value(&self.logging.file));

        ini
    }

    /// Build the engine configuration these settings describe.
    pub fn to_engine_config(&self) -> EngineConfig {
        let s = &self.streaming;
        let d = &self.download;
        let p = &self.processing;

        let mut config = EngineConfig::default()
            .with_radius(s.radius)
            .with_update_threshold(s.update_threshold)
            .with_hysteresis(s.hysteresis)
            .with_cell_size(s.cell_size)
            .with_lod_distance(s.lod_distance)
            .with_input_quiet_period(Duration::from_millis(s.input_quiet_period_ms))
            .with_max_concurrent_loads(s.max_concurrent_loads)
            .with_download_timeout(Duration::from_secs(d.timeout))
            .with_max_concurrent_downloads(d.parallel)
            .with_fetch_limits(FetchLimits {
                max_bytes: d.max_bytes,
                max_triangles: d.max_triangles,
                max_texture_size: d.max_texture_size,
            })
            .with_cleanup_interval_secs(self.cache.cleanup_interval);

        if p.threads > 0 {
            config = config.with_processing_concurrency(p.threads);
        }
        config.cache.processing.slow_interval = Duration::from_millis(p.slow_interval_ms);
        config.cache.processing.base_size = p.base_size;
        config
    }
}

fn read<T>(
    props: &Properties,
    section: &'static str,
    key: &'static str,
    target: &mut T,
) -> Result<(), ConfigFileError>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = props.get(key) else {
        return Ok(());
    };
    *target = raw
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigFileError::InvalidValue {
            section,
            key,
            value: raw.to_string(),
            reason: e.to_string(),
        })?;
    Ok(())
}

/// Empty or `none` disables an optional path.
fn optional_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(expand_tilde(value))
    }
}

fn path_value(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "none".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = ConfigFile::parse(
            "[streaming]\nradius = 400\n\n[download]\nparallel = 2\n\n[logging]\nfile = none\n",
        )
        .unwrap();
        assert_eq!(config.streaming.radius, 400.0);
        assert_eq!(config.streaming.hysteresis, DEFAULT_EVICTION_HYSTERESIS);
        assert_eq!(config.download.parallel, 2);
        assert_eq!(config.download.timeout, DEFAULT_DOWNLOAD_TIMEOUT_SECS);
        assert_eq!(config.logging.file, None);
    }

    #[test]
    fn test_invalid_value_names_key() {
        let err = ConfigFile::parse("[download]\ntimeout = soon\n").unwrap_err();
        match err {
            ConfigFileError::InvalidValue { section, key, value, .. } => {
                assert_eq!((section, key, value.as_str()), ("download", "timeout", "soon"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.ini");

        let mut config = ConfigFile::default();
        config.streaming.cell_size = 64.0;
        config.cache.snapshot_dir = None;
        config.logging.level = "debug".to_string();
        config.save_to(&path).unwrap();

        let loaded = ConfigFile::load_from(&path).unwrap();
        assert_eq!(loaded.streaming.cell_size, 64.0);
        assert_eq!(loaded.cache.snapshot_dir, None);
        assert_eq!(loaded.logging.level, "debug");
    }

    #[test]
    fn test_to_engine_config() {
        let mut config = ConfigFile::default();
        config.streaming.radius = 300.0;
        config.download.timeout = 5;
        config.download.max_triangles = 10;
        config.processing.threads = 3;
        config.cache.cleanup_interval = 0;

        let engine = config.to_engine_config();
        assert_eq!(engine.streaming.radius, 300.0);
        assert_eq!(engine.cache.worker.timeout, Duration::from_secs(5));
        assert_eq!(engine.cache.worker.limits.max_triangles, 10);
        assert_eq!(engine.cache.processing.fast_concurrency, 3);
        assert_eq!(engine.cleanup_interval_secs, 0);
        assert!(engine.validate().is_ok());
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/var/log"), PathBuf::from("/var/log"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/x"), home.join("x"));
        }
    }
}
