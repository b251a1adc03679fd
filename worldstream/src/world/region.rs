//! Regions: bounded areas synchronized against the ledger.
//!
//! A region keeps its item map equal to the authoritative item set it last
//! synchronized, plus local-only items (negative ids). Synchronization is
//! token based:
//!
//! ```text
//! refresh(force)
//!   token = ledger.region_change_token()
//!   token == last && !force ──► Unchanged (one cheap call)
//!   records = ledger.region_items()
//!   diff:  same id, same asset ──► update in place (kept)
//!          new id / new asset   ──► create + queue load
//!          id gone              ──► dispose
//!          local id             ──► untouched
//!   last = token, save snapshot
//! ```
//!
//! Ledger failures leave the current items in place and schedule a retry
//! with backoff. Refreshes of one region never overlap.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::WorldContext;
use super::item::{Containment, ItemLoad, LoadOutcome, LoadState, PlacedItem};
use super::loading::LoadPriority;
use super::owner::Owner;
use crate::asset::AssetError;
use crate::coord::{ground_distance, Aabb};
use crate::ledger::{ChangeToken, ItemId, ItemRecord, LedgerError, RegionId, RegionMetadata};
use crate::snapshot::RegionSnapshot;
use crate::BoxFuture;

/// Changes applied by one refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    /// Items updated in place.
    pub kept: usize,
    /// Items created and queued (including replacements).
    pub created: usize,
    /// Items disposed (removed or replaced).
    pub disposed: usize,
    /// Out-of-bounds records left alone because they did not change.
    pub skipped: usize,
}

impl fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kept {}, created {}, disposed {}, skipped {}",
            self.kept, self.created, self.disposed, self.skipped
        )
    }
}

/// Result of [`Region::refresh`].
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// The change token matched; nothing was fetched.
    Unchanged,
    Applied(DiffSummary),
    /// The ledger failed; a retry is pending.
    RetryScheduled,
    /// The ledger failed and the retry policy is exhausted.
    GaveUp(LedgerError),
    Disposed,
}

/// Errors from [`Region::save`].
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("no ledger submitter configured")]
    NoSubmitter,

    #[error("region is disposed")]
    Disposed,

    #[error("item {0} cannot be submitted from this region")]
    UnknownItem(ItemId),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Default)]
struct RegionState {
    items: BTreeMap<ItemId, PlacedItem>,
    token: Option<ChangeToken>,
    out_of_bounds: BTreeMap<ItemId, ItemRecord>,
    failed: BTreeMap<ItemId, AssetError>,
    next_local_id: i64,
    retry_attempt: u32,
    retry_pending: bool,
}

/// A load ready to go onto the loading queue.
struct PendingLoad {
    priority: LoadPriority,
    serial: u64,
    load: ItemLoad,
}

/// A bounded area owning placed items.
pub struct Region {
    metadata: RegionMetadata,
    ctx: Arc<WorldContext>,
    state: Mutex<RegionState>,
    refresh_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    this: Weak<Region>,
}

impl Region {
    pub fn new(metadata: RegionMetadata, ctx: Arc<WorldContext>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            metadata,
            ctx,
            state: Mutex::new(RegionState {
                next_local_id: -1,
                ..RegionState::default()
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> RegionId {
        self.metadata.id
    }

    pub fn metadata(&self) -> &RegionMetadata {
        &self.metadata
    }

    pub fn containment(&self) -> Containment {
        Containment {
            origin: self.metadata.origin,
            boundary: self.metadata.boundary,
        }
    }

    /// Exact containment of world-space bounds in the region boundary.
    pub fn is_in_bounds(&self, bounds: &Aabb) -> bool {
        self.containment().contains(bounds)
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn change_token(&self) -> Option<ChangeToken> {
        self.state.lock().token.clone()
    }

    pub fn item_ids(&self) -> Vec<ItemId> {
        self.state.lock().items.keys().copied().collect()
    }

    pub fn item_count(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn item_state(&self, id: ItemId) -> Option<LoadState> {
        self.state.lock().items.get(&id).map(|item| item.state())
    }

    /// Serial of the live item with `id`; changes when the item is replaced.
    pub fn item_serial(&self, id: ItemId) -> Option<u64> {
        self.state.lock().items.get(&id).map(|item| item.serial())
    }

    pub fn item_record(&self, id: ItemId) -> Option<ItemRecord> {
        self.state.lock().items.get(&id).map(|item| item.record())
    }

    /// Ids rejected by the bounds check, pending remediation on the ledger.
    pub fn out_of_bounds(&self) -> Vec<ItemId> {
        self.state.lock().out_of_bounds.keys().copied().collect()
    }

    pub fn failed_items(&self) -> Vec<(ItemId, AssetError)> {
        self.state
            .lock()
            .failed
            .iter()
            .map(|(id, e)| (*id, e.clone()))
            .collect()
    }

    /// Local items and items marked for removal, in the shape [`save`]
    /// expects.
    ///
    /// [`save`]: Self::save
    pub fn pending_edits(&self) -> (Vec<ItemId>, Vec<ItemId>) {
        let state = self.state.lock();
        let adds = state.items.keys().filter(|id| id.is_local()).copied().collect();
        let removals = state
            .items
            .values()
            .filter(|item| item.marked_for_removal() && !item.id().is_local())
            .map(|item| item.id())
            .collect();
        (adds, removals)
    }

    // =========================================================================
    // Load / refresh
    // =========================================================================

    /// Show the last snapshot (if any) right away, then synchronize.
    pub async fn load(&self) -> RefreshOutcome {
        if let Some(store) = self.ctx.snapshots.clone() {
            match store.load_snapshot(self.id()).await {
                Ok(Some(snapshot)) => self.restore(snapshot),
                Ok(None) => {}
                Err(e) => warn!(region = %self.id(), error = %e, "Snapshot load failed"),
            }
        }
        if self.is_disposed() {
            return RefreshOutcome::Disposed;
        }
        self.ctx.stats.record_region_loaded();
        info!(region = %self.id(), origin = ?self.metadata.origin, "Region loading");
        self.refresh(false).await
    }

    fn restore(&self, snapshot: RegionSnapshot) {
        let mut loads = Vec::new();
        {
            let mut state = self.state.lock();
            if self.is_disposed() || state.token.is_some() || !state.items.is_empty() {
                return;
            }
            if snapshot.region != self.id() || !snapshot.is_compatible() {
                warn!(region = %self.id(), snapshot_region = %snapshot.region, "Ignoring foreign snapshot");
                return;
            }
            for record in snapshot.items.into_iter().filter(|r| !r.id.is_local()) {
                let id = record.id;
                let item = self.create_item(record, &mut state, &mut loads);
                state.items.insert(id, item);
            }
            debug!(region = %self.id(), items = state.items.len(), "Snapshot restored");
        }
        self.schedule(loads);
    }

    /// Synchronize with the ledger. See the module docs for the diff rules.
    pub async fn refresh(&self, force: bool) -> RefreshOutcome {
        let _serialized = self.refresh_lock.lock().await;
        if self.is_disposed() {
            return RefreshOutcome::Disposed;
        }

        let token = match self.ctx.ledger.region_change_token(self.id()).await {
            Ok(token) => token,
            Err(e) => return self.schedule_retry(e, force),
        };
        if !force && self.state.lock().token.as_ref() == Some(&token) {
            self.state.lock().retry_attempt = 0;
            self.ctx.stats.record_refresh_unchanged();
            debug!(region = %self.id(), token = %token, "Region unchanged");
            return RefreshOutcome::Unchanged;
        }

        let records = match self.ctx.ledger.region_items(self.id()).await {
            Ok(records) => records,
            Err(e) => return self.schedule_retry(e, force),
        };
        let Some(summary) = self.apply(token.clone(), &records) else {
            debug!(region = %self.id(), "Region disposed during refresh");
            return RefreshOutcome::Disposed;
        };
        self.ctx.stats.record_refresh_applied();
        info!(region = %self.id(), token = %token, %summary, "Region refreshed");

        if let Some(store) = self.ctx.snapshots.clone() {
            let snapshot = RegionSnapshot::new(self.id(), Some(token), records);
            if let Err(e) = store.save_snapshot(snapshot).await {
                warn!(region = %self.id(), error = %e, "Snapshot save failed");
            }
        }
        RefreshOutcome::Applied(summary)
    }

    /// Diff `records` against the live items and swap in the result.
    ///
    /// Returns `None` without touching any state if the region was disposed.
    /// [`Region::dispose`] cancels before it takes the state lock, so the
    /// check under the lock either wins and installs items that dispose then
    /// collects, or sees the cancellation.
    fn apply(&self, token: ChangeToken, records: &[ItemRecord]) -> Option<DiffSummary> {
        let mut incoming: BTreeMap<ItemId, &ItemRecord> = BTreeMap::new();
        for record in records {
            if record.id.is_local() {
                warn!(region = %self.id(), item = %record.id, "Ignoring ledger record with local id");
                continue;
            }
            incoming.insert(record.id, record);
        }

        let mut summary = DiffSummary::default();
        let mut loads = Vec::new();
        let mut retired = Vec::new();
        {
            let mut state = self.state.lock();
            if self.is_disposed() {
                return None;
            }
            let current = std::mem::take(&mut state.items);
            let mut next = BTreeMap::new();

            for (id, mut item) in current {
                if id.is_local() {
                    next.insert(id, item);
                    continue;
                }
                match incoming.get(&id) {
                    Some(record) if Self::can_update_in_place(&item, record) => {
                        item.update_record(record);
                        next.insert(id, item);
                        summary.kept += 1;
                    }
                    _ => retired.push(item),
                }
            }

            for (id, record) in &incoming {
                if next.contains_key(id) {
                    continue;
                }
                if let Some(rejected) = state.out_of_bounds.get(id) {
                    if rejected == *record {
                        summary.skipped += 1;
                        continue;
                    }
                    state.out_of_bounds.remove(id);
                }
                state.failed.remove(id);
                let item = self.create_item((*record).clone(), &mut state, &mut loads);
                next.insert(*id, item);
                summary.created += 1;
            }

            state.out_of_bounds.retain(|id, _| incoming.contains_key(id));
            state.failed.retain(|id, _| next.contains_key(id));
            state.items = next;
            state.token = Some(token);
            state.retry_attempt = 0;
        }

        summary.disposed = retired.len();
        for item in retired {
            let _ = item.dispose(&self.ctx.cache);
        }
        self.schedule(loads);
        Some(summary)
    }

    /// Whether the live item can absorb `record` without reloading.
    fn can_update_in_place(item: &PlacedItem, record: &ItemRecord) -> bool {
        if item.asset_key() != &record.asset || item.is_disposed() {
            return false;
        }
        match item.state() {
            LoadState::Failed => !item.has_transient_failure() && item.record() == *record,
            _ => true,
        }
    }

    fn schedule_retry(&self, error: LedgerError, force: bool) -> RefreshOutcome {
        self.ctx.stats.record_refresh_failure();
        let attempt = {
            let mut state = self.state.lock();
            if state.retry_pending {
                return RefreshOutcome::RetryScheduled;
            }
            state.retry_attempt += 1;
            state.retry_attempt
        };

        let Some(delay) = self.ctx.settings.retry.delay_for_attempt(attempt) else {
            warn!(region = %self.id(), attempt, error = %error, "Refresh retries exhausted");
            return RefreshOutcome::GaveUp(error);
        };
        self.state.lock().retry_pending = true;
        warn!(
            region = %self.id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Refresh failed, retry scheduled"
        );

        let this = self.this.clone();
        let cancel = self.cancel.clone();
        self.ctx.daemons.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(region) = this.upgrade() {
                        region.state.lock().retry_pending = false;
                        region.refresh_owned(force).await;
                    }
                }
            }
        });
        RefreshOutcome::RetryScheduled
    }

    fn refresh_owned(self: Arc<Self>, force: bool) -> BoxFuture<'static, RefreshOutcome> {
        Box::pin(async move { self.refresh(force).await })
    }

    // =========================================================================
    // Items
    // =========================================================================

    fn create_item(
        &self,
        record: ItemRecord,
        state: &mut RegionState,
        loads: &mut Vec<PendingLoad>,
    ) -> PlacedItem {
        let item = PlacedItem::new(Owner::Region(self.id()), record);
        if item.state() == LoadState::Failed {
            if let Some(error) = item.error() {
                state.failed.insert(item.id(), error);
            }
            self.ctx.stats.record_item_failed();
            return item;
        }

        let viewer = self.ctx.viewer.viewer_position();
        let transform = item.transform();
        let priority = LoadPriority::new(
            transform.max_scale(),
            viewer.distance(transform.position),
        );
        if let Some(load) = item.begin_load(Arc::clone(&self.ctx.cache), Some(self.containment())) {
            loads.push(PendingLoad {
                priority,
                serial: item.serial(),
                load,
            });
        }
        item
    }

    fn schedule(&self, loads: Vec<PendingLoad>) {
        for PendingLoad {
            priority,
            serial,
            load,
        } in loads
        {
            let region = self.this.clone();
            let id = load.item();
            let label = format!("region-{}/item-{}", self.id(), id);
            self.ctx.loading.schedule(
                priority,
                label,
                Box::pin(async move {
                    let outcome = load.run().await;
                    if let Some(region) = region.upgrade() {
                        region.record_outcome(id, serial, outcome);
                    }
                }),
            );
        }
    }

    fn record_outcome(&self, id: ItemId, serial: u64, outcome: LoadOutcome) {
        let mut state = self.state.lock();
        let current = state
            .items
            .get(&id)
            .is_some_and(|item| item.serial() == serial);
        if !current {
            return;
        }
        match outcome {
            LoadOutcome::Loaded | LoadOutcome::Cancelled => {}
            LoadOutcome::Failed(error) => {
                debug!(region = %self.id(), item = %id, error = %error, "Item failed");
                state.failed.insert(id, error);
            }
            LoadOutcome::OutOfBounds(bounds) => {
                if let Some(item) = state.items.remove(&id) {
                    info!(
                        region = %self.id(),
                        item = %id,
                        min = ?bounds.min,
                        max = ?bounds.max,
                        "Item rejected: outside region boundary"
                    );
                    state.out_of_bounds.insert(id, item.record());
                }
            }
        }
    }

    /// Add a local-only item. Gets the next negative id and is queued at once.
    pub fn place_local(&self, mut record: ItemRecord) -> Option<ItemId> {
        let mut loads = Vec::new();
        let id = {
            let mut state = self.state.lock();
            if self.is_disposed() {
                return None;
            }
            let id = ItemId(state.next_local_id);
            state.next_local_id -= 1;
            record.id = id;
            let item = self.create_item(record, &mut state, &mut loads);
            state.items.insert(id, item);
            id
        };
        debug!(region = %self.id(), item = %id, "Local item placed");
        self.schedule(loads);
        Some(id)
    }

    /// Flag a ledger item for removal on the next [`save`](Self::save).
    pub fn mark_for_removal(&self, id: ItemId, marked: bool) -> bool {
        match self.state.lock().items.get_mut(&id) {
            Some(item) => {
                item.set_marked_for_removal(marked);
                true
            }
            None => false,
        }
    }

    /// Submit local additions and removals to the ledger.
    ///
    /// On success the submitted local items are disposed and a forced
    /// refresh brings in their authoritative copies.
    pub async fn save(&self, adds: &[ItemId], removals: &[ItemId]) -> Result<RefreshOutcome, SaveError> {
        let submitter = self.ctx.submitter.clone().ok_or(SaveError::NoSubmitter)?;
        if self.is_disposed() {
            return Err(SaveError::Disposed);
        }

        let add_records = {
            let state = self.state.lock();
            let mut records = Vec::with_capacity(adds.len());
            for id in adds {
                match state.items.get(id) {
                    Some(item) if id.is_local() => records.push(item.record()),
                    _ => return Err(SaveError::UnknownItem(*id)),
                }
            }
            if let Some(id) = removals
                .iter()
                .find(|id| id.is_local() || !state.items.contains_key(*id))
            {
                return Err(SaveError::UnknownItem(*id));
            }
            records
        };

        submitter
            .submit_region_edits(self.id(), add_records, removals.to_vec())
            .await?;
        info!(region = %self.id(), adds = adds.len(), removals = removals.len(), "Region edits submitted");

        let submitted: Vec<PlacedItem> = {
            let mut state = self.state.lock();
            adds.iter().filter_map(|id| state.items.remove(id)).collect()
        };
        for item in submitted {
            let _ = item.dispose(&self.ctx.cache);
        }
        Ok(self.refresh(true).await)
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    /// Update item visibility. Returns how many items are visible.
    pub fn update_lod(&self, viewer: glam::Vec3) -> usize {
        let lod_distance = self.ctx.settings.lod_distance;
        self.state
            .lock()
            .items
            .values()
            .filter(|item| item.update_lod(viewer, lod_distance))
            .count()
    }

    /// Ground distance from `position` to the region origin.
    ///
    /// Eviction uses this while [`SpatialIndex::query`](super::SpatialIndex::query)
    /// works on cell centers, so the two agree only when the ledger places
    /// region origins on their cell centers.
    pub fn distance_to(&self, position: glam::Vec3) -> f32 {
        ground_distance(position, self.metadata.origin)
    }

    /// Cancel pending retries and dispose every item.
    pub fn dispose(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let items = std::mem::take(&mut self.state.lock().items);
        let count = items.len();
        for item in items.into_values() {
            let _ = item.dispose(&self.ctx.cache);
        }
        info!(region = %self.id(), items = count, "Region disposed");
    }

    /// Ids of all live items, for diff assertions.
    pub fn item_id_set(&self) -> BTreeSet<ItemId> {
        self.state.lock().items.keys().copied().collect()
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.metadata.id)
            .field("origin", &self.metadata.origin)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
