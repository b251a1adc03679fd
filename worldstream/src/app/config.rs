//! Engine configuration.
//!
//! `EngineConfig` gathers the settings of every component the [`Engine`]
//! starts. Defaults match the `DEFAULT_*` constants of each component; the
//! CLI builds one from the INI file with
//! [`ConfigFile::to_engine_config`](crate::config::ConfigFile::to_engine_config).
//!
//! [`Engine`]: super::Engine

use std::time::Duration;

use crate::asset::{CacheConfig, FetchLimits};
use crate::world::{RegionSettings, RetryPolicy, StreamingConfig, DEFAULT_MAX_CONCURRENT_LOADS};

/// Default interval between cache cleanup passes (in seconds).
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 10;

/// Configuration for [`Engine::start`](super::Engine::start).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Region residency around the viewer.
    pub streaming: StreamingConfig,

    /// Per-region LOD and refresh retry behavior.
    pub region: RegionSettings,

    /// Download worker and processing queue.
    pub cache: CacheConfig,

    /// Item loads admitted at once.
    pub max_concurrent_loads: usize,

    /// Cleanup daemon interval in seconds. `0` disables the daemon.
    pub cleanup_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            streaming: StreamingConfig::default(),
            region: RegionSettings::default(),
            cache: CacheConfig::default(),
            max_concurrent_loads: DEFAULT_MAX_CONCURRENT_LOADS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
        }
    }
}

impl EngineConfig {
    pub fn with_radius(mut self, radius: f32) -> Self {
        self.streaming.radius = radius;
        self
    }

    pub fn with_update_threshold(mut self, threshold: f32) -> Self {
        self.streaming.update_threshold = threshold;
        self
    }

    pub fn with_hysteresis(mut self, hysteresis: f32) -> Self {
        self.streaming.hysteresis = hysteresis;
        self
    }

    pub fn with_cell_size(mut self, cell_size: f32) -> Self {
        self.streaming.cell_size = cell_size;
        self
    }

    pub fn with_input_quiet_period(mut self, period: Duration) -> Self {
        self.streaming.input_quiet_period = period;
        self
    }

    pub fn with_lod_distance(mut self, distance: f32) -> Self {
        self.region.lod_distance = distance;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.region.retry = policy;
        self
    }

    pub fn with_fetch_limits(mut self, limits: FetchLimits) -> Self {
        self.cache.worker.limits = limits;
        self
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.cache.worker.timeout = timeout;
        self
    }

    pub fn with_max_concurrent_downloads(mut self, max: usize) -> Self {
        self.cache.worker.max_concurrent = max;
        self
    }

    pub fn with_processing_concurrency(mut self, concurrency: usize) -> Self {
        self.cache.processing.fast_concurrency = concurrency;
        self
    }

    pub fn with_max_concurrent_loads(mut self, max: usize) -> Self {
        self.max_concurrent_loads = max;
        self
    }

    pub fn with_cleanup_interval_secs(mut self, secs: u64) -> Self {
        self.cleanup_interval_secs = secs;
        self
    }

    /// Check values no component can work with.
    pub fn validate(&self) -> Result<(), String> {
        let s = &self.streaming;
        if !(s.radius.is_finite() && s.radius > 0.0) {
            return Err(format!("streaming radius must be positive, got {}", s.radius));
        }
        if !(s.update_threshold.is_finite() && s.update_threshold >= 0.0) {
            return Err(format!(
                "update threshold must be non-negative, got {}",
                s.update_threshold
            ));
        }
        if !(s.hysteresis.is_finite() && s.hysteresis >= 1.0) {
            return Err(format!("hysteresis must be at least 1.0, got {}", s.hysteresis));
        }
        if !(s.cell_size.is_finite() && s.cell_size > 0.0) {
            return Err(format!("cell size must be positive, got {}", s.cell_size));
        }
        if self.cache.worker.max_concurrent == 0 {
            return Err("max concurrent downloads must be at least 1".to_string());
        }
        if self.max_concurrent_loads == 0 {
            return Err("max concurrent loads must be at least 1".to_string());
        }
        Ok(())
    }
}
