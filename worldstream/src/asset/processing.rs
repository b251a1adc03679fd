//! Throttled processing of raw artifacts into scene-ready assets.
//!
//! Processing is CPU-bound (parse, strip, rescale, freeze) and competes with
//! the render loop. Admission goes through one of two semaphore pools:
//!
//! ```text
//! Fast profile: fast_concurrency permits, no spacing   (viewer idle)
//! Slow profile: 1 permit, starts spaced by slow_interval (viewer moving)
//! ```
//!
//! The active profile lives in a [`ThroughputSwitch`] that the streaming
//! controller flips; the queue only reads it at admission time, so a switch
//! never affects work that was already admitted.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::AssetError;
use super::fetch::RawArtifact;
use crate::scene::{SceneLoader, SharedScene};
use crate::telemetry::EngineStats;

/// Default spacing between slow-profile starts (one frame at 60 Hz).
pub const DEFAULT_SLOW_INTERVAL_MS: u64 = 16;

/// Default edge length the largest extent of every asset is scaled to.
pub const DEFAULT_BASE_SIZE: f32 = 1.0;

/// Which throughput budget new work is admitted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThroughputProfile {
    /// High concurrency, no spacing.
    Fast,
    /// One item at a time, one start per interval.
    Slow,
}

impl ThroughputProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThroughputProfile::Fast => "fast",
            ThroughputProfile::Slow => "slow",
        }
    }
}

/// Shared, lock-free holder of the active [`ThroughputProfile`].
///
/// Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct ThroughputSwitch(Arc<AtomicU8>);

const PROFILE_FAST: u8 = 0;
const PROFILE_SLOW: u8 = 1;

impl Default for ThroughputSwitch {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(PROFILE_FAST)))
    }
}

impl ThroughputSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> ThroughputProfile {
        match self.0.load(Ordering::Acquire) {
            PROFILE_SLOW => ThroughputProfile::Slow,
            _ => ThroughputProfile::Fast,
        }
    }

    /// Set the profile, returning the previous one.
    pub fn set(&self, profile: ThroughputProfile) -> ThroughputProfile {
        let raw = match profile {
            ThroughputProfile::Fast => PROFILE_FAST,
            ThroughputProfile::Slow => PROFILE_SLOW,
        };
        match self.0.swap(raw, Ordering::AcqRel) {
            PROFILE_SLOW => ThroughputProfile::Slow,
            _ => ThroughputProfile::Fast,
        }
    }
}

/// Configuration for the processing queue.
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Concurrent tasks under the fast profile.
    pub fast_concurrency: usize,
    /// Minimum spacing between task starts under the slow profile.
    pub slow_interval: Duration,
    /// Target size of the largest extent after rescaling.
    pub base_size: f32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        Self {
            fast_concurrency: cpus,
            slow_interval: Duration::from_millis(DEFAULT_SLOW_INTERVAL_MS),
            base_size: DEFAULT_BASE_SIZE,
        }
    }
}

/// Rate- and concurrency-limited processing queue.
pub struct ProcessingQueue {
    loader: Arc<dyn SceneLoader>,
    throughput: ThroughputSwitch,
    fast: Arc<Semaphore>,
    slow: Arc<Semaphore>,
    /// Earliest start time of the next slow-profile task.
    next_slow_start: Mutex<Instant>,
    config: ProcessingConfig,
    stats: Arc<EngineStats>,
    shutdown: CancellationToken,
}

impl ProcessingQueue {
    pub fn new(
        loader: Arc<dyn SceneLoader>,
        throughput: ThroughputSwitch,
        config: ProcessingConfig,
        stats: Arc<EngineStats>,
    ) -> Self {
        let fast_concurrency = config.fast_concurrency.max(1);
        info!(
            fast_concurrency,
            slow_interval_ms = config.slow_interval.as_millis() as u64,
            base_size = config.base_size,
            "Processing queue created"
        );
        Self {
            loader,
            throughput,
            fast: Arc::new(Semaphore::new(fast_concurrency)),
            slow: Arc::new(Semaphore::new(1)),
            next_slow_start: Mutex::new(Instant::now()),
            config,
            stats,
            shutdown: CancellationToken::new(),
        }
    }

    /// Process one raw artifact into a scene-ready asset.
    ///
    /// Waits for admission under the profile active right now, then runs the
    /// processing steps on a blocking thread. Failures are not retried.
    pub async fn enqueue(&self, raw: RawArtifact) -> Result<SharedScene, AssetError> {
        let profile = self.throughput.current();
        let _permit = self.admit(profile).await?;

        let loader = Arc::clone(&self.loader);
        let base_size = self.config.base_size;
        let key = raw.key.clone();
        let result = tokio::task::spawn_blocking(move || process(loader.as_ref(), raw, base_size))
            .await
            .unwrap_or_else(|e| {
                Err(AssetError::Malformed {
                    key: key.clone(),
                    reason: format!("processing task failed: {}", e),
                })
            });

        match &result {
            Ok(_) => {
                self.stats.record_processed();
                debug!(key = %key, profile = profile.as_str(), "Asset processed");
            }
            Err(e) => {
                self.stats.record_processing_failed();
                warn!(key = %key, error = %e, "Asset processing failed");
            }
        }
        result
    }

    async fn admit(&self, profile: ThroughputProfile) -> Result<OwnedSemaphorePermit, AssetError> {
        let pool = match profile {
            ThroughputProfile::Fast => &self.fast,
            ThroughputProfile::Slow => &self.slow,
        };
        let permit = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(AssetError::Cancelled),
            permit = Arc::clone(pool).acquire_owned() => permit.map_err(|_| AssetError::Cancelled)?,
        };

        if profile == ThroughputProfile::Slow {
            let start_at = {
                let mut next = self.next_slow_start.lock();
                let now = Instant::now();
                let start_at = (*next).max(now);
                *next = start_at + self.config.slow_interval;
                start_at
            };
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(AssetError::Cancelled),
                _ = tokio::time::sleep_until(start_at) => {}
            }
        }
        Ok(permit)
    }

    /// Stop admitting work. Waiting and future enqueues resolve to `Cancelled`.
    pub fn drain(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Processing queue draining");
            self.shutdown.cancel();
            self.fast.close();
            self.slow.close();
        }
    }

    pub fn throughput(&self) -> &ThroughputSwitch {
        &self.throughput
    }
}

/// The processing steps, in order.
fn process(
    loader: &dyn SceneLoader,
    raw: RawArtifact,
    base_size: f32,
) -> Result<SharedScene, AssetError> {
    if !loader.supports(&raw.mime) {
        return Err(AssetError::UnsupportedFormat {
            key: raw.key,
            mime: raw.mime,
        });
    }

    let mut draft = loader.parse(&raw)?;
    let stripped = draft.strip_non_geometry();
    draft.stop_animations();

    let extent = draft
        .extent()
        .ok_or_else(|| AssetError::EmptyGeometry {
            key: raw.key.clone(),
        })?;
    let largest = extent.size().max_element();
    if !largest.is_finite() || largest <= 0.0 {
        return Err(AssetError::EmptyGeometry { key: raw.key });
    }
    draft.scale_uniform(base_size / largest);

    debug!(key = %raw.key, stripped, largest, "Draft normalized");
    Ok(draft.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetKey;
    use crate::scene::headless::{HeadlessLoader, ModelDocument, ModelNode, HEADLESS_MODEL_MIME};
    use glam::Vec3;

    fn queue_with(switch: ThroughputSwitch, config: ProcessingConfig) -> (ProcessingQueue, HeadlessLoader) {
        let loader = HeadlessLoader::new();
        let queue = ProcessingQueue::new(
            Arc::new(loader.clone()),
            switch,
            config,
            Arc::new(EngineStats::new()),
        );
        (queue, loader)
    }

    fn cube(id: u64, size: f32) -> RawArtifact {
        RawArtifact::new(
            AssetKey::new("col", id),
            HEADLESS_MODEL_MIME,
            ModelDocument::cuboid(Vec3::splat(size)).to_bytes(),
        )
    }

    #[test]
    fn test_switch_set_returns_previous() {
        let switch = ThroughputSwitch::new();
        assert_eq!(switch.current(), ThroughputProfile::Fast);
        assert_eq!(switch.set(ThroughputProfile::Slow), ThroughputProfile::Fast);
        let shared = switch.clone();
        assert_eq!(shared.current(), ThroughputProfile::Slow);
    }

    #[tokio::test]
    async fn test_rescales_to_base_size() {
        let config = ProcessingConfig {
            base_size: 2.0,
            ..ProcessingConfig::default()
        };
        let (queue, _) = queue_with(ThroughputSwitch::new(), config);

        let asset = queue.enqueue(cube(1, 10.0)).await.unwrap();
        let size = asset.bounds().size();
        assert!((size.max_element() - 2.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_rejects_unsupported_mime() {
        let (queue, loader) = queue_with(ThroughputSwitch::new(), ProcessingConfig::default());
        let raw = RawArtifact::new(AssetKey::new("col", 1), "image/png", vec![0u8; 4]);

        let err = queue.enqueue(raw).await.unwrap_err();
        assert!(matches!(err, AssetError::UnsupportedFormat { .. }));
        assert_eq!(loader.counters().parsed(), 0);
    }

    #[tokio::test]
    async fn test_rejects_geometry_free_model() {
        let (queue, _) = queue_with(ThroughputSwitch::new(), ProcessingConfig::default());
        let document = ModelDocument::default()
            .with_node(ModelNode::Light)
            .with_node(ModelNode::Camera);
        let raw = RawArtifact::new(AssetKey::new("col", 3), HEADLESS_MODEL_MIME, document.to_bytes());

        let err = queue.enqueue(raw).await.unwrap_err();
        assert!(matches!(err, AssetError::EmptyGeometry { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_profile_spaces_starts() {
        let switch = ThroughputSwitch::new();
        switch.set(ThroughputProfile::Slow);
        let config = ProcessingConfig {
            slow_interval: Duration::from_millis(100),
            ..ProcessingConfig::default()
        };
        let (queue, _) = queue_with(switch, config);
        let queue = Arc::new(queue);

        let started = tokio::time::Instant::now();
        let tasks: Vec<_> = (0..3)
            .map(|i| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.enqueue(cube(i, 1.0)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        // Three starts spaced by 100ms: the last starts no earlier than +200ms.
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_drain_cancels_new_work() {
        let (queue, _) = queue_with(ThroughputSwitch::new(), ProcessingConfig::default());
        queue.drain();
        let err = queue.enqueue(cube(1, 1.0)).await.unwrap_err();
        assert_eq!(err, AssetError::Cancelled);
    }
}
