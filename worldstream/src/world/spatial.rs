//! Deterministic region lookup.
//!
//! Regions are laid out on a square grid in the XZ plane:
//!
//! ```text
//!   columns = ceil(sqrt(total))
//!
//!   z ▲
//!     │  6  7  8
//!     │  3  4  5
//!     │  0  1  2
//!     └──────────► x      region i at cell (i % columns, i / columns)
//! ```
//!
//! A region is resident when its cell center is within the query radius.
//! The result depends only on the arguments, so the controller can diff it
//! against the resident set without any generation counter.

use std::collections::BTreeSet;

use glam::Vec3;

use crate::ledger::RegionId;

/// Default edge length of one grid cell in world units.
pub const DEFAULT_CELL_SIZE: f32 = 100.0;

/// Grid layout of the world's regions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialIndex {
    cell_size: f32,
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new(DEFAULT_CELL_SIZE)
    }
}

impl SpatialIndex {
    pub fn new(cell_size: f32) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            DEFAULT_CELL_SIZE
        };
        Self { cell_size }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Grid columns for a world of `total` regions.
    pub fn columns(total: u32) -> u32 {
        if total == 0 {
            return 0;
        }
        let mut columns = (f64::from(total)).sqrt().ceil() as u32;
        // Guard against float rounding on perfect squares.
        while columns.saturating_mul(columns) < total {
            columns += 1;
        }
        while columns > 1 && (columns - 1) * (columns - 1) >= total {
            columns -= 1;
        }
        columns
    }

    /// World-space center of a region's cell, or `None` if out of range.
    pub fn cell_center(&self, region: RegionId, total: u32) -> Option<Vec3> {
        if region.0 >= total {
            return None;
        }
        let columns = Self::columns(total);
        let col = region.0 % columns;
        let row = region.0 / columns;
        Some(Vec3::new(
            (col as f32 + 0.5) * self.cell_size,
            0.0,
            (row as f32 + 0.5) * self.cell_size,
        ))
    }

    /// Regions whose cell center lies within `radius` of `position` on the
    /// ground plane.
    pub fn query(&self, position: Vec3, radius: f32, total: u32) -> BTreeSet<RegionId> {
        let mut result = BTreeSet::new();
        if total == 0 || !position.is_finite() || !radius.is_finite() || radius < 0.0 {
            return result;
        }

        let columns = Self::columns(total);
        let rows = total.div_ceil(columns);
        let cell = self.cell_size;

        // Candidate window: cells whose center can be inside the circle.
        let to_index = |v: f32, max: u32| -> u32 {
            let idx = (v / cell - 0.5).floor();
            if idx < 0.0 {
                0
            } else {
                (idx as u32).min(max.saturating_sub(1))
            }
        };
        let col_lo = to_index(position.x - radius, columns);
        let col_hi = to_index(position.x + radius + cell, columns);
        let row_lo = to_index(position.z - radius, rows);
        let row_hi = to_index(position.z + radius + cell, rows);

        let r2 = radius * radius;
        for row in row_lo..=row_hi {
            for col in col_lo..=col_hi {
                let id = row * columns + col;
                if id >= total {
                    continue;
                }
                let cx = (col as f32 + 0.5) * cell;
                let cz = (row as f32 + 0.5) * cell;
                let dx = cx - position.x;
                let dz = cz - position.z;
                if dx * dx + dz * dz <= r2 {
                    result.insert(RegionId(id));
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_columns() {
        assert_eq!(SpatialIndex::columns(0), 0);
        assert_eq!(SpatialIndex::columns(1), 1);
        assert_eq!(SpatialIndex::columns(4), 2);
        assert_eq!(SpatialIndex::columns(5), 3);
        assert_eq!(SpatialIndex::columns(9), 3);
        assert_eq!(SpatialIndex::columns(10), 4);
    }

    #[test]
    fn test_cell_center() {
        let index = SpatialIndex::new(100.0);
        assert_eq!(index.cell_center(RegionId(0), 9), Some(Vec3::new(50.0, 0.0, 50.0)));
        assert_eq!(index.cell_center(RegionId(5), 9), Some(Vec3::new(250.0, 0.0, 150.0)));
        assert_eq!(index.cell_center(RegionId(9), 9), None);
    }

    #[test]
    fn test_query_small_radius_hits_own_cell() {
        let index = SpatialIndex::new(100.0);
        let result = index.query(Vec3::new(150.0, 0.0, 150.0), 10.0, 9);
        assert_eq!(result, BTreeSet::from([RegionId(4)]));
    }

    #[test]
    fn test_query_covers_neighbours() {
        let index = SpatialIndex::new(100.0);
        let result = index.query(Vec3::new(150.0, 0.0, 150.0), 100.0, 9);
        let expected: BTreeSet<_> = [1, 3, 4, 5, 7].into_iter().map(RegionId).collect();
        assert_eq!(result, expected);
    }

    #[test]
    fn test_query_ignores_missing_cells() {
        let index = SpatialIndex::new(100.0);
        // 5 regions on a 3x2 grid: ids 0..5, cell 5 does not exist.
        let result = index.query(Vec3::new(250.0, 0.0, 150.0), 1.0, 5);
        assert!(result.is_empty());
    }

    #[test]
    fn test_query_degenerate_inputs() {
        let index = SpatialIndex::default();
        assert!(index.query(Vec3::ZERO, 100.0, 0).is_empty());
        assert!(index.query(Vec3::splat(f32::NAN), 100.0, 9).is_empty());
        assert!(index.query(Vec3::ZERO, -1.0, 9).is_empty());
    }

    proptest! {
        #[test]
        fn prop_query_is_deterministic(
            x in -500.0f32..1500.0,
            z in -500.0f32..1500.0,
            radius in 0.0f32..600.0,
            total in 0u32..200,
        ) {
            let index = SpatialIndex::new(100.0);
            let position = Vec3::new(x, 0.0, z);
            prop_assert_eq!(index.query(position, radius, total), index.query(position, radius, total));
        }

        #[test]
        fn prop_query_matches_brute_force(
            x in -200.0f32..1200.0,
            z in -200.0f32..1200.0,
            radius in 0.0f32..400.0,
            total in 1u32..120,
        ) {
            let index = SpatialIndex::new(100.0);
            let position = Vec3::new(x, 0.0, z);
            let expected: BTreeSet<RegionId> = (0..total)
                .map(RegionId)
                .filter(|id| {
                    let c = index.cell_center(*id, total).unwrap();
                    let (dx, dz) = (c.x - x, c.z - z);
                    dx * dx + dz * dz <= radius * radius
                })
                .collect();
            prop_assert_eq!(index.query(position, radius, total), expected);
        }
    }
}
