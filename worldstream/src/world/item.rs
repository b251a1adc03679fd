//! Placed items and their load state machine.
//!
//! ```text
//!   NotLoaded ──begin_load──► Queued ──acquire ok──► Loaded
//!                               │
//!                               └──acquire err───► Failed
//! ```
//!
//! `Loaded` and `Failed` are terminal. An item holds exactly one reference
//! on its asset while `Loaded` and gives it back exactly once on dispose.
//! All post-acquire work happens under the item's slot lock, so a dispose
//! racing a load either sees the finished instance (and releases it) or
//! prevents it from being created at all.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use glam::Vec3;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::owner::Owner;
use crate::asset::{AssetCache, AssetError, AssetKey, InvariantViolation};
use crate::coord::{ground_distance, Aabb, BoundaryShape, Transform};
use crate::ledger::{ItemId, ItemRecord};
use crate::scene::SceneInstance;

/// Attempts to claim an asset that cleanup reclaimed between resolve and claim.
const MAX_CLAIM_ATTEMPTS: usize = 3;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Load state of a [`PlacedItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    NotLoaded,
    Queued,
    Loaded,
    Failed,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::NotLoaded => "not_loaded",
            LoadState::Queued => "queued",
            LoadState::Loaded => "loaded",
            LoadState::Failed => "failed",
        }
    }
}

/// How a queued load ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded,
    Failed(AssetError),
    /// Loaded, but the instance did not fit the owner's boundary and was
    /// disposed again.
    OutOfBounds(Aabb),
    /// The item was disposed before the asset arrived.
    Cancelled,
}

/// Boundary a region-owned item must fit inside.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Containment {
    pub origin: Vec3,
    pub boundary: BoundaryShape,
}

impl Containment {
    pub fn contains(&self, bounds: &Aabb) -> bool {
        self.boundary.contains(self.origin, bounds)
    }
}

struct ItemSlot {
    state: LoadState,
    transform: Transform,
    instance: Option<Box<dyn SceneInstance>>,
    visible: bool,
    disposed: bool,
    /// Disposed by the bounds check rather than by the owner.
    rejected: bool,
    error: Option<AssetError>,
}

/// One placement of an asset.
pub struct PlacedItem {
    owner: Owner,
    record: ItemRecord,
    serial: u64,
    name: String,
    marked_for_removal: bool,
    slot: Arc<Mutex<ItemSlot>>,
}

impl PlacedItem {
    /// Create an item from a ledger (or local) record.
    ///
    /// A record with an unusable transform produces an item that is already
    /// `Failed` and can never be queued.
    pub fn new(owner: Owner, record: ItemRecord) -> Self {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}/item-{}", owner, record.id);

        let (state, error) = if record.transform.is_valid() {
            (LoadState::NotLoaded, None)
        } else {
            warn!(item = %record.id, owner = %owner, "Rejecting item with invalid transform");
            (
                LoadState::Failed,
                Some(AssetError::Malformed {
                    key: record.asset.clone(),
                    reason: "invalid transform".to_string(),
                }),
            )
        };

        Self {
            owner,
            serial,
            name,
            marked_for_removal: false,
            slot: Arc::new(Mutex::new(ItemSlot {
                state,
                transform: record.transform,
                instance: None,
                visible: true,
                disposed: false,
                rejected: false,
                error,
            })),
            record,
        }
    }

    pub fn id(&self) -> ItemId {
        self.record.id
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn asset_key(&self) -> &AssetKey {
        &self.record.asset
    }

    /// Ledger record as last applied.
    pub fn record(&self) -> ItemRecord {
        let mut record = self.record.clone();
        record.transform = self.slot.lock().transform;
        record
    }

    /// Process-unique serial distinguishing this item from a replacement
    /// with the same id.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LoadState {
        self.slot.lock().state
    }

    pub fn error(&self) -> Option<AssetError> {
        self.slot.lock().error.clone()
    }

    pub fn transform(&self) -> Transform {
        self.slot.lock().transform
    }

    pub fn is_disposed(&self) -> bool {
        self.slot.lock().disposed
    }

    pub fn is_visible(&self) -> bool {
        self.slot.lock().visible
    }

    /// World-space bounds of the instance, if one exists.
    pub fn world_bounds(&self) -> Option<Aabb> {
        self.slot
            .lock()
            .instance
            .as_ref()
            .map(|instance| instance.world_bounds())
    }

    pub fn marked_for_removal(&self) -> bool {
        self.marked_for_removal
    }

    pub fn set_marked_for_removal(&mut self, marked: bool) {
        self.marked_for_removal = marked;
    }

    /// Whether a failed load is worth repeating on a later refresh.
    pub fn has_transient_failure(&self) -> bool {
        let slot = self.slot.lock();
        slot.state == LoadState::Failed && slot.error.as_ref().is_some_and(|e| e.is_transient())
    }

    /// Apply updated ledger metadata in place. The asset is not reloaded.
    pub fn update_record(&mut self, record: &ItemRecord) {
        debug_assert_eq!(record.id, self.record.id);
        self.record.issuer.clone_from(&record.issuer);
        self.record.price = record.price;
        self.record.quantity = record.quantity;

        if !record.transform.is_valid() {
            warn!(item = %self.record.id, owner = %self.owner, "Ignoring invalid transform update");
            return;
        }
        self.record.transform = record.transform;
        let mut slot = self.slot.lock();
        slot.transform = record.transform;
        if let Some(instance) = slot.instance.as_mut() {
            instance.set_transform(&record.transform);
        }
    }

    /// Move `NotLoaded -> Queued` and hand back the work to run once the
    /// loading queue admits it.
    ///
    /// From any other state this is a no-op: loading twice would take a
    /// second reference.
    pub fn begin_load(
        &self,
        cache: Arc<AssetCache>,
        containment: Option<Containment>,
    ) -> Option<ItemLoad> {
        let mut slot = self.slot.lock();
        if slot.disposed || slot.state != LoadState::NotLoaded {
            warn!(
                item = %self.record.id,
                owner = %self.owner,
                state = slot.state.as_str(),
                disposed = slot.disposed,
                "Load requested for item that is not loadable"
            );
            return None;
        }
        slot.state = LoadState::Queued;

        Some(ItemLoad {
            key: self.record.asset.clone(),
            name: self.name.clone(),
            item: self.record.id,
            containment: if self.owner.is_bounded() { containment } else { None },
            slot: Arc::clone(&self.slot),
            cache,
        })
    }

    /// Show or hide the instance by distance. Returns the new visibility.
    ///
    /// Visible iff the item is within `lod_distance` scaled by its largest
    /// scale axis (never less than 1).
    pub fn update_lod(&self, viewer: Vec3, lod_distance: f32) -> bool {
        let mut slot = self.slot.lock();
        let reach = lod_distance * slot.transform.max_scale().max(1.0);
        let visible = ground_distance(viewer, slot.transform.position) <= reach;
        slot.visible = visible;
        if let Some(instance) = slot.instance.as_mut() {
            instance.set_visible(visible);
        }
        visible
    }

    /// Remove the item from the scene.
    ///
    /// Releases the asset reference if the item is `Loaded`. Returns whether
    /// a reference was released. Disposing twice is reported as an invariant
    /// violation and otherwise ignored.
    pub fn dispose(&self, cache: &AssetCache) -> Result<bool, InvariantViolation> {
        let mut slot = self.slot.lock();
        if slot.disposed {
            if slot.rejected {
                // Already disposed by the bounds check; owner just caught up.
                return Ok(false);
            }
            let violation = InvariantViolation::DoubleDispose(self.name.clone());
            drop(slot);
            cache.report(&violation);
            return Err(violation);
        }
        slot.disposed = true;

        let mut released = false;
        if let Some(mut instance) = slot.instance.take() {
            instance.dispose();
        }
        if slot.state == LoadState::Loaded {
            // A dropped release is already logged and counted by the cache.
            released = cache.release(&self.record.asset).is_ok();
        }
        debug!(item = %self.record.id, owner = %self.owner, released, "Item disposed");
        Ok(released)
    }
}

impl std::fmt::Debug for PlacedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlacedItem")
            .field("id", &self.record.id)
            .field("owner", &self.owner)
            .field("asset", &self.record.asset)
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Queued load
// =============================================================================

/// A load admitted by [`PlacedItem::begin_load`].
pub struct ItemLoad {
    key: AssetKey,
    name: String,
    item: ItemId,
    containment: Option<Containment>,
    slot: Arc<Mutex<ItemSlot>>,
    cache: Arc<AssetCache>,
}

impl ItemLoad {
    pub fn item(&self) -> ItemId {
        self.item
    }

    /// Acquire the asset, then instantiate, take a reference and check
    /// containment, in one step under the item lock.
    pub async fn run(self) -> LoadOutcome {
        let stats = Arc::clone(self.cache.stats());

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            if self.slot.lock().disposed {
                debug!(item = %self.item, key = %self.key, "Item disposed before acquire");
                return LoadOutcome::Cancelled;
            }
            let result = self.cache.acquire(&self.key).await;

            let mut slot = self.slot.lock();
            if slot.disposed {
                debug!(item = %self.item, key = %self.key, "Item disposed during load");
                return LoadOutcome::Cancelled;
            }

            let asset = match result {
                Ok(asset) => asset,
                Err(e) => {
                    slot.state = LoadState::Failed;
                    slot.error = Some(e.clone());
                    stats.record_item_failed();
                    return LoadOutcome::Failed(e);
                }
            };

            if asset.inc_ref().is_err() {
                // Reclaimed between resolve and claim; the next acquire
                // starts a fresh entry.
                continue;
            }

            let mut instance = asset.value().instantiate(&self.name);
            instance.set_transform(&slot.transform);
            instance.set_visible(slot.visible);
            let bounds = instance.world_bounds();
            slot.instance = Some(instance);
            slot.state = LoadState::Loaded;

            if let Some(containment) = &self.containment {
                if !containment.contains(&bounds) {
                    if let Some(mut instance) = slot.instance.take() {
                        instance.dispose();
                    }
                    slot.disposed = true;
                    slot.rejected = true;
                    drop(slot);
                    // A dropped release is already logged and counted by the cache.
                    let released = self.cache.release(&self.key).is_ok();
                    stats.record_item_out_of_bounds();
                    warn!(item = %self.item, key = %self.key, released, "Item out of bounds, disposed");
                    return LoadOutcome::OutOfBounds(bounds);
                }
            }

            stats.record_item_loaded();
            debug!(item = %self.item, key = %self.key, "Item loaded");
            return LoadOutcome::Loaded;
        }

        let mut slot = self.slot.lock();
        let error = AssetError::Cancelled;
        if !slot.disposed {
            slot.state = LoadState::Failed;
            slot.error = Some(error.clone());
        }
        stats.record_item_failed();
        LoadOutcome::Failed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{CacheConfig, ThroughputSwitch};
    use crate::ledger::{RegionId, WorldId};
    use crate::scene::headless::{HeadlessCounters, HeadlessLoader, ModelDocument};
    use crate::sim::MemoryFetcher;
    use crate::telemetry::EngineStats;
    use tokio_util::task::TaskTracker;

    struct Fixture {
        cache: Arc<AssetCache>,
        fetcher: Arc<MemoryFetcher>,
        counters: Arc<HeadlessCounters>,
        stats: Arc<EngineStats>,
    }

    fn fixture() -> Fixture {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert_model(key(1), &ModelDocument::cuboid(Vec3::ONE));
        let loader = HeadlessLoader::new();
        let counters = loader.counters();
        let stats = Arc::new(EngineStats::new());
        let tracker = TaskTracker::new();
        let cache = AssetCache::spawn(
            fetcher.clone(),
            Arc::new(loader),
            ThroughputSwitch::new(),
            CacheConfig::default(),
            Arc::clone(&stats),
            &tracker,
            tracker.clone(),
        )
        .unwrap();
        Fixture {
            cache: Arc::new(cache),
            fetcher,
            counters,
            stats,
        }
    }

    fn key(id: u64) -> AssetKey {
        AssetKey::new("col", id)
    }

    fn record(id: i64, position: Vec3) -> ItemRecord {
        ItemRecord::new(ItemId(id), key(1), Transform::from_position(position))
    }

    fn wide() -> Option<Containment> {
        Some(Containment {
            origin: Vec3::ZERO,
            boundary: BoundaryShape::Box {
                half_extents: Vec3::splat(50.0),
            },
        })
    }

    #[tokio::test]
    async fn test_load_then_dispose_releases_once() {
        let f = fixture();
        let item = PlacedItem::new(Owner::Region(RegionId(1)), record(1, Vec3::ZERO));
        assert_eq!(item.state(), LoadState::NotLoaded);

        let load = item.begin_load(Arc::clone(&f.cache), wide()).unwrap();
        assert_eq!(item.state(), LoadState::Queued);
        assert_eq!(load.run().await, LoadOutcome::Loaded);
        assert_eq!(item.state(), LoadState::Loaded);
        assert_eq!(f.cache.ref_count(&key(1)), Some(1));
        assert_eq!(f.counters.live_instances(), 1);

        assert_eq!(item.dispose(&f.cache), Ok(true));
        assert_eq!(f.cache.ref_count(&key(1)), Some(0));
        assert_eq!(f.counters.live_instances(), 0);

        let err = item.dispose(&f.cache).unwrap_err();
        assert!(matches!(err, InvariantViolation::DoubleDispose(_)));
        assert_eq!(f.cache.ref_count(&key(1)), Some(0));
        assert_eq!(f.stats.invariant_violations(), 1);
    }

    #[tokio::test]
    async fn test_second_load_is_noop() {
        let f = fixture();
        let item = PlacedItem::new(Owner::Region(RegionId(1)), record(1, Vec3::ZERO));
        item.begin_load(Arc::clone(&f.cache), wide()).unwrap().run().await;
        assert!(item.begin_load(Arc::clone(&f.cache), wide()).is_none());
        assert_eq!(f.cache.ref_count(&key(1)), Some(1));
    }

    #[tokio::test]
    async fn test_dispose_before_resolve_skips_instantiation() {
        let f = fixture();
        let item = PlacedItem::new(Owner::Region(RegionId(1)), record(1, Vec3::ZERO));
        let load = item.begin_load(Arc::clone(&f.cache), wide()).unwrap();

        assert_eq!(item.dispose(&f.cache), Ok(false));
        assert_eq!(load.run().await, LoadOutcome::Cancelled);
        assert_eq!(f.counters.live_instances(), 0);
        // Nothing was downloaded or parsed for the disposed item.
        assert_eq!(f.fetcher.fetch_count(&key(1)), 0);
        assert_eq!(f.counters.parsed(), 0);
        assert_eq!(f.cache.entry_count(), 0);
        assert_eq!(f.cache.ref_count(&key(1)), None);
    }

    #[tokio::test]
    async fn test_failed_acquire_does_not_increment() {
        let f = fixture();
        let missing = ItemRecord::new(ItemId(2), key(99), Transform::default());
        let item = PlacedItem::new(Owner::Region(RegionId(1)), missing);

        let outcome = item.begin_load(Arc::clone(&f.cache), wide()).unwrap().run().await;
        assert!(matches!(outcome, LoadOutcome::Failed(_)));
        assert_eq!(item.state(), LoadState::Failed);
        assert!(!item.has_transient_failure());
        assert_eq!(item.dispose(&f.cache), Ok(false));
        assert_eq!(f.stats.snapshot().dropped_releases, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_flagged() {
        let f = fixture();
        f.fetcher.fail_key(key(1));
        let item = PlacedItem::new(Owner::Region(RegionId(1)), record(1, Vec3::ZERO));
        item.begin_load(Arc::clone(&f.cache), wide()).unwrap().run().await;
        assert!(item.has_transient_failure());
    }

    #[tokio::test]
    async fn test_out_of_bounds_is_disposed() {
        let f = fixture();
        let item = PlacedItem::new(
            Owner::Region(RegionId(1)),
            record(3, Vec3::new(49.8, 0.0, 0.0)),
        );

        let outcome = item.begin_load(Arc::clone(&f.cache), wide()).unwrap().run().await;
        assert!(matches!(outcome, LoadOutcome::OutOfBounds(_)));
        assert!(item.is_disposed());
        assert_eq!(f.cache.ref_count(&key(1)), Some(0));
        assert_eq!(f.counters.live_instances(), 0);
        assert_eq!(f.stats.snapshot().dropped_releases, 0);

        // The owner disposing it afterwards is not a double dispose.
        assert_eq!(item.dispose(&f.cache), Ok(false));
        assert_eq!(f.stats.invariant_violations(), 0);
    }

    #[tokio::test]
    async fn test_world_items_skip_bounds_check() {
        let f = fixture();
        let item = PlacedItem::new(Owner::World(WorldId(0)), record(4, Vec3::splat(1000.0)));
        let outcome = item.begin_load(Arc::clone(&f.cache), wide()).unwrap().run().await;
        assert_eq!(outcome, LoadOutcome::Loaded);
    }

    #[test]
    fn test_invalid_transform_fails_immediately() {
        let mut bad = record(5, Vec3::ZERO);
        bad.transform.scale = Vec3::new(1.0, 0.0, 1.0);
        let item = PlacedItem::new(Owner::Region(RegionId(1)), bad);
        assert_eq!(item.state(), LoadState::Failed);
        assert!(matches!(item.error(), Some(AssetError::Malformed { .. })));
    }

    #[tokio::test]
    async fn test_update_record_moves_instance() {
        let f = fixture();
        let mut item = PlacedItem::new(Owner::Region(RegionId(1)), record(1, Vec3::ZERO));
        item.begin_load(Arc::clone(&f.cache), wide()).unwrap().run().await;

        let moved = record(1, Vec3::new(10.0, 0.0, 0.0)).with_price(5, 2);
        item.update_record(&moved);
        assert_eq!(item.record(), moved);
        let bounds = item.world_bounds().unwrap();
        assert!((bounds.center().x - 10.0).abs() < 1e-4);
        assert_eq!(f.fetcher.fetch_count(&key(1)), 1);
    }

    #[tokio::test]
    async fn test_update_lod_scales_with_item() {
        let f = fixture();
        let mut big = record(1, Vec3::new(200.0, 0.0, 0.0));
        big.transform = big.transform.with_uniform_scale(2.0);
        let item = PlacedItem::new(Owner::World(WorldId(0)), big);
        item.begin_load(Arc::clone(&f.cache), None).unwrap().run().await;

        assert!(!item.update_lod(Vec3::ZERO, 50.0));
        assert!(!item.is_visible());
        assert!(item.update_lod(Vec3::ZERO, 100.0));
        assert!(item.is_visible());
    }
}
