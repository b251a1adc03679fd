//! Deduplicating, reference-counted asset cache.
//!
//! One entry per [`AssetKey`], created synchronously on the first request and
//! shared by everyone who asks for the same key afterwards:
//!
//! ```text
//! acquire(key) ─┬─ entry exists ──────────────► join shared pipeline
//!               └─ no entry ── insert (locked) ─► spawn pipeline
//!                                                  download → process → wrap
//!                                                  │
//!                                  failure ◄───────┴───────► success
//!                         remove entry, then deliver    store resolved asset
//! ```
//!
//! The cache never takes references on behalf of callers. Whoever
//! instantiates the asset calls [`RefCounted::inc_ref`] and later
//! [`AssetCache::release`]. [`AssetCache::cleanup`] reclaims resolved
//! entries nobody references.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::error::{AssetError, InvariantViolation};
use super::fetch::ArtifactFetcher;
use super::key::AssetKey;
use super::processing::{ProcessingConfig, ProcessingQueue, ThroughputSwitch};
use super::refcount::RefCounted;
use super::worker::{DownloadWorker, WorkerConfig, WorkerSpawnError};
use crate::scene::{SceneLoader, SharedScene};
use crate::telemetry::EngineStats;
use crate::BoxFuture;

/// A resolved cache value.
pub type SharedAsset = Arc<RefCounted<SharedScene>>;

type Pipeline = Shared<BoxFuture<'static, Result<SharedAsset, AssetError>>>;

/// Result of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupResult {
    /// Entries reclaimed and disposed.
    pub entries_removed: usize,
    /// Resolved entries still referenced after the pass.
    pub entries_retained: usize,
    /// Duration of the pass in milliseconds.
    pub duration_ms: u64,
}

impl fmt::Display for CleanupResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cleanup: reclaimed {} entries, retained {} in {}ms",
            self.entries_removed, self.entries_retained, self.duration_ms
        )
    }
}

/// Settings for the pipeline stages behind the cache.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    pub worker: WorkerConfig,
    pub processing: ProcessingConfig,
}

struct CacheEntry {
    /// Distinguishes this entry from a later one for the same key.
    generation: u64,
    pipeline: Pipeline,
    resolved: Option<SharedAsset>,
}

/// `AssetKey -> in-flight or ready asset`.
pub struct AssetCache {
    entries: Mutex<HashMap<AssetKey, CacheEntry>>,
    next_generation: AtomicU64,
    worker: DownloadWorker,
    processing: Arc<ProcessingQueue>,
    stats: Arc<EngineStats>,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl AssetCache {
    pub fn new(
        worker: DownloadWorker,
        processing: Arc<ProcessingQueue>,
        stats: Arc<EngineStats>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            worker,
            processing,
            stats,
            tracker,
            closed: AtomicBool::new(false),
        }
    }

    /// Spawn the download worker and build the processing queue behind a
    /// new cache.
    ///
    /// The worker's own tasks go on `daemons`; per-key pipelines go on
    /// `work` so callers can wait for loads to settle.
    pub fn spawn(
        fetcher: Arc<dyn ArtifactFetcher>,
        loader: Arc<dyn SceneLoader>,
        throughput: ThroughputSwitch,
        config: CacheConfig,
        stats: Arc<EngineStats>,
        daemons: &TaskTracker,
        work: TaskTracker,
    ) -> Result<Self, WorkerSpawnError> {
        let worker = DownloadWorker::spawn(fetcher, config.worker, Arc::clone(&stats), daemons)?;
        let processing = Arc::new(ProcessingQueue::new(
            loader,
            throughput,
            config.processing,
            Arc::clone(&stats),
        ));
        Ok(Self::new(worker, processing, stats, work))
    }

    /// Get the scene-ready asset for `key`, downloading and processing it if
    /// nobody has yet.
    ///
    /// Concurrent calls for the same key share one pipeline. The returned
    /// value carries no reference; call [`RefCounted::inc_ref`] before use.
    pub async fn acquire(self: &Arc<Self>, key: &AssetKey) -> Result<SharedAsset, AssetError> {
        let pipeline = self.join_or_start(key)?;
        pipeline.await
    }

    fn join_or_start(self: &Arc<Self>, key: &AssetKey) -> Result<Pipeline, AssetError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AssetError::ShuttingDown);
        }

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            self.stats.record_cache_join();
            debug!(key = %key, resolved = entry.resolved.is_some(), "Joined cache entry");
            return Ok(entry.pipeline.clone());
        }

        // The spawned task finalizes under this same lock, so it cannot
        // observe the map before the entry below is inserted.
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cache = Arc::clone(self);
        let task_key = key.clone();
        let handle = self
            .tracker
            .spawn(async move { cache.run_pipeline(task_key, generation).await });

        let pipeline: Pipeline = async move { handle.await.unwrap_or(Err(AssetError::Cancelled)) }
            .boxed()
            .shared();

        entries.insert(
            key.clone(),
            CacheEntry {
                generation,
                pipeline: pipeline.clone(),
                resolved: None,
            },
        );
        self.stats.record_download_started();
        debug!(key = %key, generation, "Cache entry created");
        Ok(pipeline)
    }

    async fn run_pipeline(
        self: Arc<Self>,
        key: AssetKey,
        generation: u64,
    ) -> Result<SharedAsset, AssetError> {
        let result = match self.worker.download(key.clone()).await {
            Ok(raw) => self.processing.enqueue(raw).await,
            Err(e) => Err(e),
        };

        let mut entries = self.entries.lock();
        let current = entries
            .get(&key)
            .is_some_and(|entry| entry.generation == generation);

        match result {
            Ok(scene) if current => {
                let asset: SharedAsset = Arc::new(RefCounted::new(scene, key.canonical()));
                if let Some(entry) = entries.get_mut(&key) {
                    entry.resolved = Some(Arc::clone(&asset));
                }
                debug!(key = %key, "Cache entry resolved");
                Ok(asset)
            }
            Ok(scene) => {
                // Entry was dropped by dispose while we were working.
                drop(entries);
                scene.dispose();
                Err(AssetError::Cancelled)
            }
            Err(e) => {
                if current {
                    entries.remove(&key);
                }
                drop(entries);
                warn!(key = %key, error = %e, "Asset pipeline failed");
                Err(e)
            }
        }
    }

    /// Drop one reference previously taken on `key`'s asset. Returns the
    /// remaining count.
    ///
    /// Releasing a key that is still pending or has no entry at all is a
    /// bookkeeping bug: the release is dropped, logged and counted.
    pub fn release(&self, key: &AssetKey) -> Result<u64, InvariantViolation> {
        let result = {
            let entries = self.entries.lock();
            match entries.get(key) {
                None => Err(InvariantViolation::ReleaseWithoutEntry(key.clone())),
                Some(CacheEntry { resolved: None, .. }) => {
                    Err(InvariantViolation::ReleaseWhilePending(key.clone()))
                }
                Some(CacheEntry {
                    resolved: Some(asset),
                    ..
                }) => asset.dec_ref(),
            }
        };

        if let Err(violation) = &result {
            self.report(violation);
            self.stats.record_dropped_release();
        }
        result
    }

    /// Log and count an invariant violation.
    pub fn report(&self, violation: &InvariantViolation) {
        error!(violation = %violation, "Invariant violation");
        self.stats.record_invariant_violation();
    }

    /// Reclaim every resolved entry nobody references.
    ///
    /// Candidates are collected from a snapshot, then each one is claimed
    /// under the lock. An entry that gained a reference (or was replaced) in
    /// between is left alone.
    pub fn cleanup(&self) -> CleanupResult {
        let started = Instant::now();

        let candidates: Vec<(AssetKey, u64)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .resolved
                        .as_ref()
                        .is_some_and(|asset| asset.should_reclaim())
                })
                .map(|(key, entry)| (key.clone(), entry.generation))
                .collect()
        };

        let mut reclaimed = Vec::with_capacity(candidates.len());
        for (key, generation) in candidates {
            let mut entries = self.entries.lock();
            let claimed = entries.get(&key).is_some_and(|entry| {
                entry.generation == generation
                    && entry
                        .resolved
                        .as_ref()
                        .is_some_and(|asset| asset.try_reclaim())
            });
            if claimed {
                if let Some(entry) = entries.remove(&key) {
                    reclaimed.push((key, entry));
                }
            }
        }

        for (key, entry) in &reclaimed {
            if let Some(asset) = &entry.resolved {
                asset.value().dispose();
            }
            debug!(key = %key, "Cache entry reclaimed");
        }

        let retained = self
            .entries
            .lock()
            .values()
            .filter(|entry| entry.resolved.is_some())
            .count();

        self.stats.record_reclaimed(reclaimed.len() as u64);
        CleanupResult {
            entries_removed: reclaimed.len(),
            entries_retained: retained,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Tear the cache down.
    ///
    /// Cancels the download worker, drains the processing queue and disposes
    /// every resolved asset whether or not it is still referenced. Later
    /// acquires fail with [`AssetError::ShuttingDown`].
    pub fn dispose(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.worker.shutdown();
        self.processing.drain();

        let drained: Vec<(AssetKey, CacheEntry)> = self.entries.lock().drain().collect();
        let mut disposed = 0usize;
        for (key, entry) in drained {
            if let Some(asset) = entry.resolved {
                let outstanding = asset.force_reclaim();
                if outstanding > 0 {
                    warn!(key = %key, outstanding, "Disposing asset that is still referenced");
                }
                asset.value().dispose();
                disposed += 1;
            }
        }
        info!(disposed, "Asset cache disposed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Entries currently in the map, pending or resolved.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn contains(&self, key: &AssetKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Reference count of a resolved entry; `None` while pending or absent.
    pub fn ref_count(&self, key: &AssetKey) -> Option<u64> {
        self.entries
            .lock()
            .get(key)
            .and_then(|entry| entry.resolved.as_ref())
            .map(|asset| asset.ref_count())
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub fn processing(&self) -> &Arc<ProcessingQueue> {
        &self.processing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{
        ArtifactFetcher, FetchError, FetchLimits, ProcessingConfig, RawArtifact, ThroughputSwitch,
        WorkerConfig,
    };
    use crate::scene::headless::{HeadlessCounters, HeadlessLoader, ModelDocument, HEADLESS_MODEL_MIME};
    use glam::Vec3;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    // =========================================================================
    // Test fetcher
    // =========================================================================

    /// Serves cubes; blocks on `gate` until the test releases permits and
    /// fails the first `fail_first` fetches.
    struct GatedFetcher {
        gate: Arc<Semaphore>,
        fetches: AtomicUsize,
        fail_first: usize,
    }

    impl ArtifactFetcher for GatedFetcher {
        fn fetch<'a>(
            &'a self,
            key: &'a AssetKey,
            _limits: &'a FetchLimits,
        ) -> BoxFuture<'a, Result<RawArtifact, FetchError>> {
            Box::pin(async move {
                let n = self.fetches.fetch_add(1, Ordering::SeqCst);
                let permit = self.gate.acquire().await.map_err(|_| FetchError::NotFound)?;
                permit.forget();
                if n < self.fail_first {
                    return Err(FetchError::Network("connection reset".into()));
                }
                Ok(RawArtifact::new(
                    key.clone(),
                    HEADLESS_MODEL_MIME,
                    ModelDocument::cuboid(Vec3::ONE).to_bytes(),
                ))
            })
        }
    }

    struct Harness {
        cache: Arc<AssetCache>,
        fetcher: Arc<GatedFetcher>,
        counters: Arc<HeadlessCounters>,
        stats: Arc<EngineStats>,
    }

    fn harness(open: bool, fail_first: usize) -> Harness {
        let fetcher = Arc::new(GatedFetcher {
            gate: Arc::new(Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 })),
            fetches: AtomicUsize::new(0),
            fail_first,
        });
        let stats = Arc::new(EngineStats::new());
        let tracker = TaskTracker::new();
        let worker = DownloadWorker::spawn(
            fetcher.clone(),
            WorkerConfig::default(),
            Arc::clone(&stats),
            &tracker,
        )
        .unwrap();
        let loader = HeadlessLoader::new();
        let counters = loader.counters();
        let processing = Arc::new(ProcessingQueue::new(
            Arc::new(loader),
            ThroughputSwitch::new(),
            ProcessingConfig::default(),
            Arc::clone(&stats),
        ));
        let cache = Arc::new(AssetCache::new(worker, processing, Arc::clone(&stats), tracker));
        Harness {
            cache,
            fetcher,
            counters,
            stats,
        }
    }

    fn key(id: u64) -> AssetKey {
        AssetKey::new("col", id)
    }

    // =========================================================================
    // Tests
    // =========================================================================

    #[test]
    fn test_cleanup_result_display() {
        let result = CleanupResult {
            entries_removed: 3,
            entries_retained: 7,
            duration_ms: 12,
        };
        let display = result.to_string();
        assert!(display.contains("reclaimed 3"));
        assert!(display.contains("retained 7"));
        assert!(display.contains("12ms"));
    }

    #[tokio::test]
    async fn test_concurrent_acquires_share_one_download() {
        let h = harness(false, 0);

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let cache = Arc::clone(&h.cache);
                tokio::spawn(async move { cache.acquire(&key(1)).await })
            })
            .collect();
        tokio::task::yield_now().await;

        h.fetcher.gate.add_permits(1);
        let mut assets = Vec::new();
        for waiter in waiters {
            assets.push(waiter.await.unwrap().unwrap());
        }

        assert_eq!(h.fetcher.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(h.counters.parsed(), 1);
        assert!(assets.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(h.cache.entry_count(), 1);
        assert_eq!(h.cache.ref_count(&key(1)), Some(0));
    }

    #[tokio::test]
    async fn test_failure_removes_entry_and_next_acquire_retries() {
        let h = harness(true, 1);

        let err = h.cache.acquire(&key(2)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!h.cache.contains(&key(2)));

        let asset = h.cache.acquire(&key(2)).await.unwrap();
        assert_eq!(asset.ref_count(), 0);
        assert_eq!(h.fetcher.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refcount_conservation_and_cleanup() {
        let h = harness(true, 0);

        let asset = h.cache.acquire(&key(3)).await.unwrap();
        for _ in 0..4 {
            asset.inc_ref().unwrap();
        }
        for _ in 0..4 {
            h.cache.release(&key(3)).unwrap();
        }
        assert_eq!(h.cache.ref_count(&key(3)), Some(0));

        let result = h.cache.cleanup();
        assert_eq!(result.entries_removed, 1);
        assert_eq!(h.cache.entry_count(), 0);
        assert_eq!(h.counters.disposed(), 1);
        assert_eq!(h.stats.snapshot().assets_reclaimed, 1);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_referenced_entries() {
        let h = harness(true, 0);

        let held = h.cache.acquire(&key(4)).await.unwrap();
        held.inc_ref().unwrap();
        h.cache.acquire(&key(5)).await.unwrap();

        let result = h.cache.cleanup();
        assert_eq!(result.entries_removed, 1);
        assert_eq!(result.entries_retained, 1);
        assert!(h.cache.contains(&key(4)));
        assert!(!h.cache.contains(&key(5)));
    }

    #[tokio::test]
    async fn test_reclaimed_asset_rejects_late_claim() {
        let h = harness(true, 0);

        let stale = h.cache.acquire(&key(6)).await.unwrap();
        h.cache.cleanup();
        assert!(stale.inc_ref().is_err());

        let fresh = h.cache.acquire(&key(6)).await.unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(fresh.inc_ref(), Ok(1));
    }

    #[tokio::test]
    async fn test_release_without_entry_is_dropped() {
        let h = harness(true, 0);

        let err = h.cache.release(&key(7)).unwrap_err();
        assert_eq!(err, InvariantViolation::ReleaseWithoutEntry(key(7)));
        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.invariant_violations, 1);
        assert_eq!(snapshot.dropped_releases, 1);
    }

    #[tokio::test]
    async fn test_release_while_pending_is_dropped() {
        let h = harness(false, 0);

        let cache = Arc::clone(&h.cache);
        let pending = tokio::spawn(async move { cache.acquire(&key(8)).await });
        tokio::task::yield_now().await;
        assert!(h.cache.contains(&key(8)));

        let err = h.cache.release(&key(8)).unwrap_err();
        assert_eq!(err, InvariantViolation::ReleaseWhilePending(key(8)));

        h.fetcher.gate.add_permits(1);
        let asset = pending.await.unwrap().unwrap();
        assert_eq!(asset.ref_count(), 0);
        assert_eq!(h.stats.invariant_violations(), 1);
    }

    #[tokio::test]
    async fn test_release_below_zero_is_reported() {
        let h = harness(true, 0);

        h.cache.acquire(&key(9)).await.unwrap();
        let err = h.cache.release(&key(9)).unwrap_err();
        assert!(matches!(err, InvariantViolation::NegativeRefCount(_)));
        assert_eq!(h.cache.ref_count(&key(9)), Some(0));
    }

    #[tokio::test]
    async fn test_dispose_force_disposes_and_rejects() {
        let h = harness(true, 0);

        let asset = h.cache.acquire(&key(10)).await.unwrap();
        asset.inc_ref().unwrap();

        h.cache.dispose();
        assert!(h.cache.is_closed());
        assert_eq!(h.cache.entry_count(), 0);
        assert_eq!(h.counters.disposed(), 1);

        let err = h.cache.acquire(&key(11)).await.unwrap_err();
        assert_eq!(err, AssetError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_dispose_cancels_pending_pipeline() {
        let h = harness(false, 0);

        let cache = Arc::clone(&h.cache);
        let pending = tokio::spawn(async move { cache.acquire(&key(12)).await });
        tokio::task::yield_now().await;

        h.cache.dispose();
        h.fetcher.gate.add_permits(1);

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::asset::ErrorKind::Cancelled);
    }
}
