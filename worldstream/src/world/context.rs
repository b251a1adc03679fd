//! Shared handles every region and the controller work with.

use std::sync::Arc;

use tokio_util::task::TaskTracker;

use super::loading::LoadingQueue;
use super::policy::RetryPolicy;
use super::viewer::ViewerInput;
use crate::asset::AssetCache;
use crate::ledger::{LedgerClient, LedgerSubmitter};
use crate::snapshot::SnapshotStore;
use crate::telemetry::EngineStats;

/// Default distance within which unit-scale items are visible.
pub const DEFAULT_LOD_DISTANCE: f32 = 150.0;

/// Per-region behavior.
#[derive(Debug, Clone)]
pub struct RegionSettings {
    /// Visibility distance for an item of scale 1.
    pub lod_distance: f32,
    /// How failed refreshes are retried.
    pub retry: RetryPolicy,
}

impl Default for RegionSettings {
    fn default() -> Self {
        Self {
            lod_distance: DEFAULT_LOD_DISTANCE,
            retry: RetryPolicy::default(),
        }
    }
}

/// Collaborators and engine services injected into the world layer.
pub struct WorldContext {
    pub cache: Arc<AssetCache>,
    pub ledger: Arc<dyn LedgerClient>,
    pub submitter: Option<Arc<dyn LedgerSubmitter>>,
    pub snapshots: Option<Arc<dyn SnapshotStore>>,
    pub loading: Arc<LoadingQueue>,
    pub viewer: Arc<dyn ViewerInput>,
    pub stats: Arc<EngineStats>,
    /// Loads and refreshes; waited on when settling.
    pub work: TaskTracker,
    /// Timers and long-running tasks; only waited on at teardown.
    pub daemons: TaskTracker,
    pub settings: RegionSettings,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::asset::{CacheConfig, ThroughputSwitch};
    use crate::scene::headless::{HeadlessCounters, HeadlessLoader};
    use crate::sim::{MemoryFetcher, MemoryLedger};
    use crate::snapshot::MemorySnapshotStore;
    use crate::world::loading::DEFAULT_MAX_CONCURRENT_LOADS;
    use crate::world::viewer::SharedViewer;

    /// A world context wired to in-memory collaborators.
    pub(crate) struct TestWorld {
        pub ctx: Arc<WorldContext>,
        pub ledger: Arc<MemoryLedger>,
        pub fetcher: Arc<MemoryFetcher>,
        pub snapshots: Arc<MemorySnapshotStore>,
        pub viewer: SharedViewer,
        pub counters: Arc<HeadlessCounters>,
        pub throughput: ThroughputSwitch,
    }

    impl TestWorld {
        pub(crate) fn new(settings: RegionSettings) -> Self {
            let ledger = Arc::new(MemoryLedger::new());
            let fetcher = Arc::new(MemoryFetcher::new());
            let snapshots = Arc::new(MemorySnapshotStore::new());
            let viewer = SharedViewer::default();
            let loader = HeadlessLoader::new();
            let counters = loader.counters();
            let throughput = ThroughputSwitch::new();
            let stats = Arc::new(EngineStats::new());
            let work = TaskTracker::new();
            let daemons = TaskTracker::new();

            let cache = AssetCache::spawn(
                fetcher.clone(),
                Arc::new(loader),
                throughput.clone(),
                CacheConfig::default(),
                Arc::clone(&stats),
                &daemons,
                work.clone(),
            )
            .expect("spawn cache");

            let ctx = Arc::new(WorldContext {
                cache: Arc::new(cache),
                ledger: ledger.clone(),
                submitter: Some(ledger.clone()),
                snapshots: Some(snapshots.clone()),
                loading: Arc::new(LoadingQueue::new(DEFAULT_MAX_CONCURRENT_LOADS, work.clone())),
                viewer: Arc::new(viewer.clone()),
                stats,
                work,
                daemons,
                settings,
            });

            Self {
                ctx,
                ledger,
                fetcher,
                snapshots,
                viewer,
                counters,
                throughput,
            }
        }

        /// Wait until every load and refresh in flight has finished.
        pub(crate) async fn settle(&self) {
            self.ctx.work.close();
            self.ctx.work.wait().await;
            self.ctx.work.reopen();
        }
    }
}
