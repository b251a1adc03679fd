//! Seeded synthetic worlds.
//!
//! Lays `regions` regions on the same grid the [`SpatialIndex`] queries,
//! gives each a box boundary of one cell, and scatters items over a shared
//! pool of cuboid assets. A small share of items is placed straddling the
//! region edge so the bounds check has something to reject.

use std::sync::Arc;

use glam::{Quat, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::fetcher::MemoryFetcher;
use super::ledger::MemoryLedger;
use crate::asset::AssetKey;
use crate::coord::{BoundaryShape, Transform};
use crate::ledger::{ChangeToken, ItemId, ItemRecord, RegionId, RegionMetadata};
use crate::scene::headless::ModelDocument;
use crate::world::{SpatialIndex, DEFAULT_CELL_SIZE};

/// Largest cuboid edge in the asset pool.
const MAX_ASSET_EDGE: f32 = 4.0;
const MIN_ITEM_SCALE: f32 = 0.5;
const MAX_ITEM_SCALE: f32 = 2.0;
/// Vertical half extent of every region boundary.
const REGION_HALF_HEIGHT: f32 = 50.0;

/// Shape of a generated world.
#[derive(Debug, Clone)]
pub struct SyntheticWorldConfig {
    pub regions: u32,
    pub items_per_region: usize,
    /// Distinct assets shared by all items.
    pub asset_pool: u64,
    pub cell_size: f32,
    pub seed: u64,
    /// Fraction of items placed across the region edge.
    pub stray_ratio: f64,
    pub collection: String,
}

impl Default for SyntheticWorldConfig {
    fn default() -> Self {
        Self {
            regions: 64,
            items_per_region: 16,
            asset_pool: 24,
            cell_size: DEFAULT_CELL_SIZE,
            seed: 7,
            stray_ratio: 0.02,
            collection: "synthetic".to_string(),
        }
    }
}

/// A populated [`MemoryLedger`] and [`MemoryFetcher`] pair.
pub struct SyntheticWorld {
    config: SyntheticWorldConfig,
    index: SpatialIndex,
    ledger: Arc<MemoryLedger>,
    fetcher: Arc<MemoryFetcher>,
    rng: StdRng,
    next_item_id: i64,
}

impl SyntheticWorld {
    pub fn generate(config: SyntheticWorldConfig) -> Self {
        let index = SpatialIndex::new(config.cell_size);
        let mut world = Self {
            rng: StdRng::seed_from_u64(config.seed),
            index,
            ledger: Arc::new(MemoryLedger::new()),
            fetcher: Arc::new(MemoryFetcher::new()),
            next_item_id: 1,
            config,
        };

        for id in 0..world.config.asset_pool.max(1) {
            let edge = 1.0 + (id % 4) as f32 * (MAX_ASSET_EDGE - 1.0) / 3.0;
            let size = Vec3::new(edge, edge * 0.75, edge);
            world
                .fetcher
                .insert_model(world.asset_key(id), &ModelDocument::cuboid(size));
        }

        for id in 0..world.config.regions {
            let region = RegionId(id);
            let Some(origin) = world.region_origin(region) else {
                continue;
            };
            world.ledger.add_region(RegionMetadata {
                id: region,
                origin,
                boundary: BoundaryShape::Box {
                    half_extents: Vec3::new(
                        world.index.cell_size() * 0.5,
                        REGION_HALF_HEIGHT,
                        world.index.cell_size() * 0.5,
                    ),
                },
            });
            let items = world.scatter(origin, world.config.items_per_region);
            world.ledger.set_items(region, "1", items);
        }

        debug!(
            regions = world.config.regions,
            items_per_region = world.config.items_per_region,
            assets = world.config.asset_pool,
            seed = world.config.seed,
            "Synthetic world generated"
        );
        world
    }

    pub fn config(&self) -> &SyntheticWorldConfig {
        &self.config
    }

    pub fn ledger(&self) -> Arc<MemoryLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn fetcher(&self) -> Arc<MemoryFetcher> {
        Arc::clone(&self.fetcher)
    }

    pub fn total_regions(&self) -> u32 {
        self.config.regions
    }

    pub fn region_origin(&self, region: RegionId) -> Option<Vec3> {
        self.index.cell_center(region, self.config.regions)
    }

    /// Far corner of the grid on the ground plane.
    pub fn extent(&self) -> Vec3 {
        let columns = SpatialIndex::columns(self.config.regions);
        let rows = if columns == 0 {
            0
        } else {
            self.config.regions.div_ceil(columns)
        };
        Vec3::new(
            columns as f32 * self.index.cell_size(),
            0.0,
            rows as f32 * self.index.cell_size(),
        )
    }

    /// Move, replace and add a few items in `region` and publish the result.
    ///
    /// Returns the new change token, or `None` for an unknown region.
    pub fn churn(&mut self, region: RegionId) -> Option<ChangeToken> {
        let origin = self.region_origin(region)?;
        let mut items = self.ledger.items(region);

        if !items.is_empty() {
            let moved = self.rng.random_range(0..items.len());
            items[moved].transform = self.placement(origin, false);
        }
        if items.len() > 1 {
            let swapped = self.rng.random_range(0..items.len());
            items[swapped].asset = self.random_asset();
        }
        if items.len() > 2 {
            let removed = self.rng.random_range(0..items.len());
            items.remove(removed);
        }
        items.extend(self.scatter(origin, 1));

        self.ledger.publish(region, items)
    }

    fn scatter(&mut self, origin: Vec3, count: usize) -> Vec<ItemRecord> {
        (0..count)
            .map(|_| {
                let stray = self.rng.random_bool(self.config.stray_ratio.clamp(0.0, 1.0));
                let transform = self.placement(origin, stray);
                let asset = self.random_asset();
                let id = ItemId(self.next_item_id);
                self.next_item_id += 1;
                ItemRecord::new(id, asset, transform).with_issuer("synthetic")
            })
            .collect()
    }

    fn placement(&mut self, origin: Vec3, stray: bool) -> Transform {
        let half = self.index.cell_size() * 0.5;
        // Rotated corners of the largest scaled asset stay within this margin.
        let margin = MAX_ASSET_EDGE * MAX_ITEM_SCALE * std::f32::consts::FRAC_1_SQRT_2 + 0.5;
        let offset = if stray {
            // Centered on the +x edge, so the item always crosses it.
            Vec3::new(half, 0.0, self.rng.random_range(-0.5f32..=0.5) * half)
        } else {
            let limit = (half - margin).max(0.0);
            if limit > 0.0 {
                Vec3::new(
                    self.rng.random_range(-limit..=limit),
                    0.0,
                    self.rng.random_range(-limit..=limit),
                )
            } else {
                Vec3::ZERO
            }
        };
        let yaw = self.rng.random_range(0.0..std::f32::consts::TAU);
        let scale = self.rng.random_range(MIN_ITEM_SCALE..=MAX_ITEM_SCALE);
        Transform::from_position(origin + offset)
            .with_rotation(Quat::from_rotation_y(yaw))
            .with_uniform_scale(scale)
    }

    fn random_asset(&mut self) -> AssetKey {
        let id = self.rng.random_range(0..self.config.asset_pool.max(1));
        self.asset_key(id)
    }

    fn asset_key(&self, id: u64) -> AssetKey {
        AssetKey::new(self.config.collection.clone(), id)
    }
}
