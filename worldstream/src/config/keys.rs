//! Typed `section.key` access to [`ConfigFile`] for the CLI.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use super::file::{expand_tilde, ConfigFile};

/// A `section.key` name that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown configuration key: {0}")]
pub struct UnknownConfigKey(pub String);

/// A value rejected by [`ConfigKey::set`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value '{value}' for {key}: {reason}")]
pub struct InvalidConfigValue {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

macro_rules! config_keys {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Every settable configuration key.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ConfigKey {
            $($variant),*
        }

        impl ConfigKey {
            const ALL: &'static [ConfigKey] = &[$(ConfigKey::$variant),*];

            /// Full `section.key` name.
            pub fn name(&self) -> &'static str {
                match self {
                    $(ConfigKey::$variant => $name),*
                }
            }
        }
    };
}

config_keys! {
    StreamingRadius => "streaming.radius",
    StreamingUpdateThreshold => "streaming.update_threshold",
    StreamingHysteresis => "streaming.hysteresis",
    StreamingCellSize => "streaming.cell_size",
    StreamingLodDistance => "streaming.lod_distance",
    StreamingInputQuietPeriodMs => "streaming.input_quiet_period_ms",
    StreamingMaxConcurrentLoads => "streaming.max_concurrent_loads",
    DownloadTimeout => "download.timeout",
    DownloadParallel => "download.parallel",
    DownloadMaxBytes => "download.max_bytes",
    DownloadMaxTriangles => "download.max_triangles",
    DownloadMaxTextureSize => "download.max_texture_size",
    ProcessingThreads => "processing.threads",
    ProcessingSlowIntervalMs => "processing.slow_interval_ms",
    ProcessingBaseSize => "processing.base_size",
    CacheCleanupInterval => "cache.cleanup_interval",
    CacheSnapshotDir => "cache.snapshot_dir",
    LoggingLevel => "logging.level",
    LoggingFile => "logging.file",
}

impl ConfigKey {
    /// All keys in file order.
    pub fn all() -> &'static [ConfigKey] {
        Self::ALL
    }

    pub fn section(&self) -> &'static str {
        self.name().split_once('.').map(|(s, _)| s).unwrap_or("")
    }

    pub fn key_name(&self) -> &'static str {
        self.name().split_once('.').map(|(_, k)| k).unwrap_or("")
    }

    /// Current value as text; empty when unset.
    pub fn get(&self, config: &ConfigFile) -> String {
        let s = &config.streaming;
        let d = &config.download;
        let p = &config.processing;
        match self {
            ConfigKey::StreamingRadius => s.radius.to_string(),
            ConfigKey::StreamingUpdateThreshold => s.update_threshold.to_string(),
            ConfigKey::StreamingHysteresis => s.hysteresis.to_string(),
            ConfigKey::StreamingCellSize => s.cell_size.to_string(),
            ConfigKey::StreamingLodDistance => s.lod_distance.to_string(),
            ConfigKey::StreamingInputQuietPeriodMs => s.input_quiet_period_ms.to_string(),
            ConfigKey::StreamingMaxConcurrentLoads => s.max_concurrent_loads.to_string(),
            ConfigKey::DownloadTimeout => d.timeout.to_string(),
            ConfigKey::DownloadParallel => d.parallel.to_string(),
            ConfigKey::DownloadMaxBytes => d.max_bytes.to_string(),
            ConfigKey::DownloadMaxTriangles => d.max_triangles.to_string(),
            ConfigKey::DownloadMaxTextureSize => d.max_texture_size.to_string(),
            ConfigKey::ProcessingThreads => p.threads.to_string(),
            ConfigKey::ProcessingSlowIntervalMs => p.slow_interval_ms.to_string(),
            ConfigKey::ProcessingBaseSize => p.base_size.to_string(),
            ConfigKey::CacheCleanupInterval => config.cache.cleanup_interval.to_string(),
            ConfigKey::CacheSnapshotDir => display_path(&config.cache.snapshot_dir),
            ConfigKey::LoggingLevel => config.logging.level.clone(),
            ConfigKey::LoggingFile => display_path(&config.logging.file),
        }
    }

    /// Validate and store `value`.
    pub fn set(&self, config: &mut ConfigFile, value: &str) -> Result<(), InvalidConfigValue> {
        let value = value.trim();
        let s = &mut config.streaming;
        let d = &mut config.download;
        let p = &mut config.processing;
        match self {
            ConfigKey::StreamingRadius => s.radius = self.positive(value)?,
            ConfigKey::StreamingUpdateThreshold => s.update_threshold = self.non_negative(value)?,
            ConfigKey::StreamingHysteresis => {
                let h: f32 = self.parse(value)?;
                if !(h.is_finite() && h >= 1.0) {
                    return Err(self.invalid(value, "must be at least 1.0"));
                }
                s.hysteresis = h;
            }
            ConfigKey::StreamingCellSize => s.cell_size = self.positive(value)?,
            ConfigKey::StreamingLodDistance => s.lod_distance = self.positive(value)?,
            ConfigKey::StreamingInputQuietPeriodMs => s.input_quiet_period_ms = self.parse(value)?,
            ConfigKey::StreamingMaxConcurrentLoads => s.max_concurrent_loads = self.at_least_one(value)?,
            ConfigKey::DownloadTimeout => d.timeout = self.at_least_one(value)? as u64,
            ConfigKey::DownloadParallel => d.parallel = self.at_least_one(value)?,
            ConfigKey::DownloadMaxBytes => d.max_bytes = self.at_least_one(value)? as u64,
            ConfigKey::DownloadMaxTriangles => d.max_triangles = self.at_least_one(value)? as u64,
            ConfigKey::DownloadMaxTextureSize => {
                d.max_texture_size = self.parse(value)?;
                if d.max_texture_size == 0 {
                    return Err(self.invalid(value, "must be at least 1"));
                }
            }
            ConfigKey::ProcessingThreads => p.threads = self.parse(value)?,
            ConfigKey::ProcessingSlowIntervalMs => p.slow_interval_ms = self.parse(value)?,
            ConfigKey::ProcessingBaseSize => p.base_size = self.positive(value)?,
            ConfigKey::CacheCleanupInterval => config.cache.cleanup_interval = self.parse(value)?,
            ConfigKey::CacheSnapshotDir => config.cache.snapshot_dir = optional_path(value),
            ConfigKey::LoggingLevel => {
                let level = value.to_ascii_lowercase();
                if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
                    return Err(self.invalid(value, "expected trace, debug, info, warn or error"));
                }
                config.logging.level = level;
            }
            ConfigKey::LoggingFile => config.logging.file = optional_path(value),
        }
        Ok(())
    }

    fn invalid(&self, value: &str, reason: impl Into<String>) -> InvalidConfigValue {
        InvalidConfigValue {
            key: self.name(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn parse<T>(&self, value: &str) -> Result<T, InvalidConfigValue>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        value.parse().map_err(|e: T::Err| self.invalid(value, e.to_string()))
    }

    fn positive(&self, value: &str) -> Result<f32, InvalidConfigValue> {
        let v: f32 = self.parse(value)?;
        if v.is_finite() && v > 0.0 {
            Ok(v)
        } else {
            Err(self.invalid(value, "must be a positive number"))
        }
    }

    fn non_negative(&self, value: &str) -> Result<f32, InvalidConfigValue> {
        let v: f32 = self.parse(value)?;
        if v.is_finite() && v >= 0.0 {
            Ok(v)
        } else {
            Err(self.invalid(value, "must not be negative"))
        }
    }

    fn at_least_one(&self, value: &str) -> Result<usize, InvalidConfigValue> {
        let v: usize = self.parse(value)?;
        if v >= 1 {
            Ok(v)
        } else {
            Err(self.invalid(value, "must be at least 1"))
        }
    }
}

impl FromStr for ConfigKey {
    type Err = UnknownConfigKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|key| key.name() == wanted)
            .ok_or_else(|| UnknownConfigKey(s.to_string()))
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

fn optional_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(expand_tilde(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_names() {
        let key: ConfigKey = "streaming.radius".parse().unwrap();
        assert_eq!(key, ConfigKey::StreamingRadius);
        assert_eq!(key.section(), "streaming");
        assert_eq!(key.key_name(), "radius");
        assert!("streaming.nope".parse::<ConfigKey>().is_err());
    }

    #[test]
    fn test_every_key_round_trips_its_name() {
        for key in ConfigKey::all() {
            assert_eq!(key.name().parse::<ConfigKey>().unwrap(), *key);
        }
    }

    #[test]
    fn test_set_validates() {
        let mut config = ConfigFile::default();
        ConfigKey::StreamingRadius.set(&mut config, "320").unwrap();
        assert_eq!(config.streaming.radius, 320.0);
        assert_eq!(ConfigKey::StreamingRadius.get(&config), "320");

        assert!(ConfigKey::StreamingRadius.set(&mut config, "-1").is_err());
        assert!(ConfigKey::StreamingHysteresis.set(&mut config, "0.5").is_err());
        assert!(ConfigKey::DownloadParallel.set(&mut config, "0").is_err());
        assert!(ConfigKey::LoggingLevel.set(&mut config, "loud").is_err());
        assert_eq!(config.streaming.radius, 320.0);
    }

    #[test]
    fn test_optional_paths() {
        let mut config = ConfigFile::default();
        ConfigKey::CacheSnapshotDir.set(&mut config, "none").unwrap();
        assert_eq!(config.cache.snapshot_dir, None);
        assert_eq!(ConfigKey::CacheSnapshotDir.get(&config), "");

        ConfigKey::LoggingFile.set(&mut config, "/tmp/ws.log").unwrap();
        assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/ws.log")));
    }
}
