//! Streaming controller: keeps the regions around the viewer resident.
//!
//! Called once per render tick. Movement below `update_threshold` is a cheap
//! early-out; otherwise the controller recomputes the wanted set:
//!
//! ```text
//! tick()
//!   ├─ throughput: Slow while the user is interacting, else Fast (every tick)
//!   ├─ moved < threshold && !dirty ──► Skipped
//!   ├─ wanted  = SpatialIndex::query(viewer, radius, count_regions)
//!   ├─ evict   resident ∖ wanted with distance > radius × hysteresis
//!   ├─ LOD     remaining residents
//!   └─ load    wanted ∖ resident  (metadata fetched concurrently)
//! ```
//!
//! A region only drops out of the wanted set once it is farther than
//! `radius`, and is only evicted past `radius × hysteresis`, so a viewer
//! idling on the boundary does not make regions flap.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use glam::Vec3;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::context::WorldContext;
use super::region::Region;
use super::spatial::{SpatialIndex, DEFAULT_CELL_SIZE};
use super::viewer::is_interacting;
use crate::asset::ThroughputProfile;
use crate::ledger::RegionId;

/// Default residency radius around the viewer.
pub const DEFAULT_STREAMING_RADIUS: f32 = 250.0;

/// Default minimum viewer movement before the resident set is recomputed.
pub const DEFAULT_UPDATE_THRESHOLD: f32 = 10.0;

/// Default eviction factor applied to the radius.
pub const DEFAULT_EVICTION_HYSTERESIS: f32 = 1.02;

/// Default time after the last input during which the user counts as
/// interacting.
pub const DEFAULT_INPUT_QUIET_PERIOD_MS: u64 = 1_000;

/// Streaming behavior.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub radius: f32,
    pub update_threshold: f32,
    /// Regions are evicted beyond `radius * hysteresis`.
    pub hysteresis: f32,
    pub input_quiet_period: Duration,
    pub cell_size: f32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            radius: DEFAULT_STREAMING_RADIUS,
            update_threshold: DEFAULT_UPDATE_THRESHOLD,
            hysteresis: DEFAULT_EVICTION_HYSTERESIS,
            input_quiet_period: Duration::from_millis(DEFAULT_INPUT_QUIET_PERIOD_MS),
            cell_size: DEFAULT_CELL_SIZE,
        }
    }
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The viewer had not moved far enough.
    Skipped,
    Recomputed {
        evicted: usize,
        loaded: usize,
        resident: usize,
    },
}

#[derive(Default)]
struct ControllerState {
    resident: BTreeMap<RegionId, Arc<Region>>,
    last_update: Option<Vec3>,
    known_regions: u32,
    /// A recompute left work undone; the next tick recomputes regardless
    /// of movement.
    dirty: bool,
}

/// Drives region residency from the viewer position.
pub struct StreamingController {
    ctx: Arc<WorldContext>,
    index: SpatialIndex,
    config: StreamingConfig,
    state: Mutex<ControllerState>,
    tick_lock: tokio::sync::Mutex<()>,
}

impl StreamingController {
    pub fn new(ctx: Arc<WorldContext>, config: StreamingConfig) -> Self {
        Self {
            index: SpatialIndex::new(config.cell_size),
            ctx,
            config,
            state: Mutex::new(ControllerState::default()),
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    /// Run one controller step. See the module docs.
    pub async fn tick(&self) -> TickOutcome {
        let _serialized = self.tick_lock.lock().await;

        self.update_throughput();

        let position = self.ctx.viewer.viewer_position();
        {
            let state = self.state.lock();
            if let Some(last) = state.last_update {
                if !state.dirty && last.distance(position) < self.config.update_threshold {
                    return TickOutcome::Skipped;
                }
            }
        }

        let mut dirty = false;
        let total = match self.ctx.ledger.count_regions().await {
            Ok(total) => {
                self.state.lock().known_regions = total;
                total
            }
            Err(e) => {
                let known = self.state.lock().known_regions;
                warn!(error = %e, known, "Region count unavailable, using last known");
                dirty = true;
                known
            }
        };
        let wanted = self.index.query(position, self.config.radius, total);

        let evicted = self.evict(position, &wanted);
        self.update_lod(position);

        let missing: Vec<RegionId> = {
            let state = self.state.lock();
            wanted
                .iter()
                .filter(|id| !state.resident.contains_key(*id))
                .copied()
                .collect()
        };
        let (loaded, failed) = self.load_regions(&missing).await;
        dirty |= failed > 0;

        let resident = {
            let mut state = self.state.lock();
            state.last_update = Some(position);
            state.dirty = dirty;
            state.resident.len()
        };

        if evicted > 0 || loaded > 0 {
            info!(
                x = position.x,
                z = position.z,
                evicted,
                loaded,
                resident,
                "Resident regions updated"
            );
        }
        TickOutcome::Recomputed {
            evicted,
            loaded,
            resident,
        }
    }

    fn update_throughput(&self) {
        let profile = if is_interacting(self.ctx.viewer.as_ref(), self.config.input_quiet_period) {
            ThroughputProfile::Slow
        } else {
            ThroughputProfile::Fast
        };
        let previous = self.ctx.cache.processing().throughput().set(profile);
        if previous != profile {
            debug!(profile = profile.as_str(), "Processing throughput changed");
        }
    }

    fn evict(&self, position: Vec3, wanted: &BTreeSet<RegionId>) -> usize {
        let limit = self.config.radius * self.config.hysteresis;
        let evicted: Vec<Arc<Region>> = {
            let mut state = self.state.lock();
            let ids: Vec<RegionId> = state
                .resident
                .iter()
                .filter(|(id, region)| !wanted.contains(*id) && region.distance_to(position) > limit)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| state.resident.remove(id)).collect()
        };

        for region in &evicted {
            debug!(region = %region.id(), distance = region.distance_to(position), "Evicting region");
            region.dispose();
            self.ctx.stats.record_region_evicted();
        }
        evicted.len()
    }

    fn update_lod(&self, position: Vec3) -> usize {
        let regions: Vec<Arc<Region>> = self.state.lock().resident.values().cloned().collect();
        regions.iter().map(|region| region.update_lod(position)).sum()
    }

    /// Fetch metadata for `ids` concurrently and start loading each region.
    /// Returns `(loaded, failed)`.
    async fn load_regions(&self, ids: &[RegionId]) -> (usize, usize) {
        if ids.is_empty() {
            return (0, 0);
        }
        let results = join_all(ids.iter().map(|id| self.ctx.ledger.region_metadata(*id))).await;

        let mut loaded = 0;
        let mut failed = 0;
        for (id, result) in ids.iter().zip(results) {
            let metadata = match result {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(region = %id, error = %e, "Region metadata unavailable, will retry");
                    failed += 1;
                    continue;
                }
            };
            let region = Region::new(metadata, Arc::clone(&self.ctx));
            {
                let mut state = self.state.lock();
                if state.resident.contains_key(id) {
                    continue;
                }
                state.resident.insert(*id, Arc::clone(&region));
            }
            self.ctx.work.spawn(async move {
                region.load().await;
            });
            loaded += 1;
        }
        (loaded, failed)
    }

    pub fn region(&self, id: RegionId) -> Option<Arc<Region>> {
        self.state.lock().resident.get(&id).cloned()
    }

    pub fn resident_ids(&self) -> BTreeSet<RegionId> {
        self.state.lock().resident.keys().copied().collect()
    }

    pub fn resident_count(&self) -> usize {
        self.state.lock().resident.len()
    }

    /// Dispose every resident region.
    pub fn shutdown(&self) {
        let regions = {
            let mut state = self.state.lock();
            state.last_update = None;
            std::mem::take(&mut state.resident)
        };
        let count = regions.len();
        for region in regions.into_values() {
            region.dispose();
        }
        info!(regions = count, "Streaming controller shut down");
    }
}
