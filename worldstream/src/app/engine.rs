//! Engine bootstrap and lifecycle.
//!
//! The [`Engine`] is the single place where collaborators are injected and
//! where the long-running pieces are started and stopped, in order:
//!
//! ```text
//! start:     stats ──► AssetCache (spawns DownloadWorker) ──► LoadingQueue
//!                 ──► WorldContext ──► StreamingController ──► cleanup daemon
//!
//! shutdown:  cleanup daemon ──► regions ──► LoadingQueue ──► AssetCache
//!                 ──► wait for every tracked task
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::config::EngineConfig;
use super::error::EngineError;
use crate::asset::{ArtifactFetcher, AssetCache, CleanupResult, ThroughputSwitch};
use crate::ledger::{LedgerClient, LedgerSubmitter};
use crate::scene::SceneLoader;
use crate::snapshot::SnapshotStore;
use crate::telemetry::{EngineStats, StatsSnapshot};
use crate::world::{LoadingQueue, StreamingController, TickOutcome, ViewerInput, WorldContext};

/// External systems the engine talks to.
pub struct Collaborators {
    pub ledger: Arc<dyn LedgerClient>,
    /// Needed only for [`Region::save`](crate::world::Region::save).
    pub submitter: Option<Arc<dyn LedgerSubmitter>>,
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub loader: Arc<dyn SceneLoader>,
    pub viewer: Arc<dyn ViewerInput>,
    pub snapshots: Option<Arc<dyn SnapshotStore>>,
}

/// A running streaming engine.
pub struct Engine {
    ctx: Arc<WorldContext>,
    controller: StreamingController,
    throughput: ThroughputSwitch,
    cancellation: CancellationToken,
    config: EngineConfig,
}

impl Engine {
    /// Start every component.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, no runtime is
    /// available, or the download worker cannot be spawned.
    pub fn start(config: EngineConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Config)?;
        Handle::try_current().map_err(|e| EngineError::NoRuntime(e.to_string()))?;

        info!(version = crate::VERSION, "Starting streaming engine");

        let stats = Arc::new(EngineStats::new());
        let work = TaskTracker::new();
        let daemons = TaskTracker::new();
        let throughput = ThroughputSwitch::new();

        // 1. Asset cache FIRST: it owns the single download worker
        let cache = Arc::new(AssetCache::spawn(
            collaborators.fetcher,
            collaborators.loader,
            throughput.clone(),
            config.cache.clone(),
            Arc::clone(&stats),
            &daemons,
            work.clone(),
        )?);
        info!(
            max_concurrent_downloads = config.cache.worker.max_concurrent,
            timeout_secs = config.cache.worker.timeout.as_secs(),
            "Asset cache started"
        );

        // 2. Loading queue and shared world context
        let loading = Arc::new(LoadingQueue::new(config.max_concurrent_loads, work.clone()));
        let ctx = Arc::new(WorldContext {
            cache,
            ledger: collaborators.ledger,
            submitter: collaborators.submitter,
            snapshots: collaborators.snapshots,
            loading,
            viewer: collaborators.viewer,
            stats,
            work,
            daemons,
            settings: config.region.clone(),
        });

        // 3. Controller
        let controller = StreamingController::new(Arc::clone(&ctx), config.streaming.clone());
        info!(
            radius = config.streaming.radius,
            cell_size = config.streaming.cell_size,
            hysteresis = config.streaming.hysteresis,
            "Streaming controller ready"
        );

        // 4. Cleanup daemon
        let cancellation = CancellationToken::new();
        if config.cleanup_interval_secs > 0 {
            spawn_cleanup_daemon(
                Arc::clone(&ctx.cache),
                Duration::from_secs(config.cleanup_interval_secs),
                cancellation.clone(),
                &ctx.daemons,
            );
        }

        Ok(Self {
            ctx,
            controller,
            throughput,
            cancellation,
            config,
        })
    }

    /// Run one streaming step; call once per frame.
    pub async fn tick(&self) -> TickOutcome {
        self.controller.tick().await
    }

    /// Wait until every region load, refresh and item load in flight has
    /// finished. Retry timers are not waited for.
    pub async fn settle(&self) {
        self.ctx.work.close();
        self.ctx.work.wait().await;
        self.ctx.work.reopen();
    }

    /// Reclaim unreferenced cache entries now.
    pub fn cleanup(&self) -> CleanupResult {
        self.ctx.cache.cleanup()
    }

    /// Stop everything and wait for background tasks to exit.
    pub async fn shutdown(&self) {
        if self.cancellation.is_cancelled() {
            return;
        }
        info!("Shutting down streaming engine");
        self.cancellation.cancel();
        self.controller.shutdown();
        self.ctx.loading.shutdown();
        self.ctx.cache.dispose();

        self.ctx.work.close();
        self.ctx.daemons.close();
        self.ctx.work.wait().await;
        self.ctx.daemons.wait().await;

        info!(stats = %self.stats(), "Streaming engine stopped");
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn engine_stats(&self) -> &Arc<EngineStats> {
        &self.ctx.stats
    }

    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.ctx.cache
    }

    pub fn controller(&self) -> &StreamingController {
        &self.controller
    }

    pub fn context(&self) -> &Arc<WorldContext> {
        &self.ctx
    }

    pub fn throughput(&self) -> &ThroughputSwitch {
        &self.throughput
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.cancellation.is_cancelled() {
            self.cancellation.cancel();
            self.controller.shutdown();
            self.ctx.loading.shutdown();
            self.ctx.cache.dispose();
        }
    }
}

/// Run [`AssetCache::cleanup`] every `interval` until cancelled.
fn spawn_cleanup_daemon(
    cache: Arc<AssetCache>,
    interval: Duration,
    cancellation: CancellationToken,
    tracker: &TaskTracker,
) {
    tracker.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                _ = ticker.tick() => {
                    let result = cache.cleanup();
                    if result.entries_removed > 0 {
                        debug!(%result, "Cache cleanup pass");
                    }
                }
            }
        }
        debug!("Cache cleanup daemon stopped");
    });
    info!(interval_secs = interval.as_secs(), "Cache cleanup daemon started");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetKey;
    use crate::coord::{BoundaryShape, Transform};
    use crate::ledger::{ItemId, ItemRecord, RegionId, RegionMetadata};
    use crate::scene::headless::{HeadlessLoader, ModelDocument};
    use crate::sim::{MemoryFetcher, MemoryLedger};
    use crate::world::SharedViewer;
    use glam::Vec3;

    fn collaborators(ledger: Arc<MemoryLedger>, fetcher: Arc<MemoryFetcher>) -> Collaborators {
        Collaborators {
            ledger: ledger.clone(),
            submitter: Some(ledger),
            fetcher,
            loader: Arc::new(HeadlessLoader::new()),
            viewer: Arc::new(SharedViewer::new(Vec3::new(50.0, 0.0, 50.0))),
            snapshots: None,
        }
    }

    #[tokio::test]
    async fn test_start_tick_shutdown() {
        let ledger = Arc::new(MemoryLedger::new());
        let fetcher = Arc::new(MemoryFetcher::new());
        let key = AssetKey::new("col", 1);
        fetcher.insert_model(key.clone(), &ModelDocument::cuboid(Vec3::ONE));
        ledger.add_region(RegionMetadata {
            id: RegionId(0),
            origin: Vec3::new(50.0, 0.0, 50.0),
            boundary: BoundaryShape::Sphere { radius: 50.0 },
        });
        ledger.publish(
            RegionId(0),
            vec![ItemRecord::new(
                ItemId(1),
                key.clone(),
                Transform::from_position(Vec3::new(50.0, 0.0, 50.0)),
            )],
        );

        let engine = Engine::start(EngineConfig::default(), collaborators(ledger, fetcher)).unwrap();
        assert!(matches!(engine.tick().await, TickOutcome::Recomputed { loaded: 1, .. }));
        engine.settle().await;

        assert_eq!(engine.cache().ref_count(&key), Some(1));
        assert_eq!(engine.stats().items_loaded, 1);

        engine.shutdown().await;
        assert!(engine.cache().is_closed());
        assert_eq!(engine.controller().resident_count(), 0);
        assert_eq!(engine.stats().invariant_violations, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = EngineConfig::default().with_radius(-1.0);
        let result = Engine::start(
            config,
            collaborators(Arc::new(MemoryLedger::new()), Arc::new(MemoryFetcher::new())),
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_start_requires_runtime() {
        let result = Engine::start(
            EngineConfig::default(),
            collaborators(Arc::new(MemoryLedger::new()), Arc::new(MemoryFetcher::new())),
        );
        assert!(matches!(result, Err(EngineError::NoRuntime(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_daemon_reclaims() {
        let ledger = Arc::new(MemoryLedger::new());
        let fetcher = Arc::new(MemoryFetcher::new());
        let key = AssetKey::new("col", 1);
        fetcher.insert_model(key.clone(), &ModelDocument::cuboid(Vec3::ONE));
        ledger.add_region(RegionMetadata {
            id: RegionId(0),
            origin: Vec3::new(50.0, 0.0, 50.0),
            boundary: BoundaryShape::Sphere { radius: 50.0 },
        });
        ledger.publish(
            RegionId(0),
            vec![ItemRecord::new(
                ItemId(1),
                key.clone(),
                Transform::from_position(Vec3::new(50.0, 0.0, 50.0)),
            )],
        );

        let engine = Engine::start(
            EngineConfig::default().with_cleanup_interval_secs(5),
            collaborators(ledger.clone(), fetcher),
        )
        .unwrap();
        engine.tick().await;
        engine.settle().await;
        assert!(engine.cache().contains(&key));

        ledger.publish(RegionId(0), Vec::new());
        let region = engine.controller().region(RegionId(0)).unwrap();
        region.refresh(false).await;
        assert_eq!(engine.cache().ref_count(&key), Some(0));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!engine.cache().contains(&key));
        assert_eq!(engine.stats().assets_reclaimed, 1);
        engine.shutdown().await;
    }
}
