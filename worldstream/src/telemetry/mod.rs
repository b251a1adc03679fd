//! Engine-wide counters.
//!
//! Every component receives the same `Arc<EngineStats>` and bumps relaxed
//! atomics on its hot paths. [`EngineStats::snapshot`] copies them into a
//! plain [`StatsSnapshot`] for the CLI summary and for tests.
//!
//! Invariant violations (negative refcounts, double dispose, stray releases)
//! are never fatal; they are logged at `error` level by the component that
//! detects them and counted here so tests can assert on them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lock-free counters shared by every engine component.
#[derive(Debug)]
pub struct EngineStats {
    started_at: Instant,

    // Asset pipeline
    downloads_started: AtomicU64,
    downloads_failed: AtomicU64,
    bytes_downloaded: AtomicU64,
    cache_joins: AtomicU64,
    assets_processed: AtomicU64,
    processing_failed: AtomicU64,
    assets_reclaimed: AtomicU64,
    dropped_releases: AtomicU64,

    // Items
    items_loaded: AtomicU64,
    items_failed: AtomicU64,
    items_out_of_bounds: AtomicU64,

    // Regions
    refreshes_applied: AtomicU64,
    refreshes_unchanged: AtomicU64,
    refresh_failures: AtomicU64,
    regions_loaded: AtomicU64,
    regions_evicted: AtomicU64,

    invariant_violations: AtomicU64,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            downloads_started: AtomicU64::new(0),
            downloads_failed: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            cache_joins: AtomicU64::new(0),
            assets_processed: AtomicU64::new(0),
            processing_failed: AtomicU64::new(0),
            assets_reclaimed: AtomicU64::new(0),
            dropped_releases: AtomicU64::new(0),
            items_loaded: AtomicU64::new(0),
            items_failed: AtomicU64::new(0),
            items_out_of_bounds: AtomicU64::new(0),
            refreshes_applied: AtomicU64::new(0),
            refreshes_unchanged: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
            regions_loaded: AtomicU64::new(0),
            regions_evicted: AtomicU64::new(0),
            invariant_violations: AtomicU64::new(0),
        }
    }

    counter! {
        record_download_started => downloads_started,
        record_download_failed => downloads_failed,
        record_cache_join => cache_joins,
        record_processed => assets_processed,
        record_processing_failed => processing_failed,
        record_dropped_release => dropped_releases,
        record_item_loaded => items_loaded,
        record_item_failed => items_failed,
        record_item_out_of_bounds => items_out_of_bounds,
        record_refresh_applied => refreshes_applied,
        record_refresh_unchanged => refreshes_unchanged,
        record_refresh_failure => refresh_failures,
        record_region_loaded => regions_loaded,
        record_region_evicted => regions_evicted,
        record_invariant_violation => invariant_violations,
    }

    pub fn record_bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self, count: u64) {
        self.assets_reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn invariant_violations(&self) -> u64 {
        self.invariant_violations.load(Ordering::Relaxed)
    }

    /// Copy all counters into a plain snapshot.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            downloads_started: load(&self.downloads_started),
            downloads_failed: load(&self.downloads_failed),
            bytes_downloaded: load(&self.bytes_downloaded),
            cache_joins: load(&self.cache_joins),
            assets_processed: load(&self.assets_processed),
            processing_failed: load(&self.processing_failed),
            assets_reclaimed: load(&self.assets_reclaimed),
            dropped_releases: load(&self.dropped_releases),
            items_loaded: load(&self.items_loaded),
            items_failed: load(&self.items_failed),
            items_out_of_bounds: load(&self.items_out_of_bounds),
            refreshes_applied: load(&self.refreshes_applied),
            refreshes_unchanged: load(&self.refreshes_unchanged),
            refresh_failures: load(&self.refresh_failures),
            regions_loaded: load(&self.regions_loaded),
            regions_evicted: load(&self.regions_evicted),
            invariant_violations: load(&self.invariant_violations),
        }
    }
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub downloads_started: u64,
    pub downloads_failed: u64,
    pub bytes_downloaded: u64,
    pub cache_joins: u64,
    pub assets_processed: u64,
    pub processing_failed: u64,
    pub assets_reclaimed: u64,
    pub dropped_releases: u64,
    pub items_loaded: u64,
    pub items_failed: u64,
    pub items_out_of_bounds: u64,
    pub refreshes_applied: u64,
    pub refreshes_unchanged: u64,
    pub refresh_failures: u64,
    pub regions_loaded: u64,
    pub regions_evicted: u64,
    pub invariant_violations: u64,
}

impl StatsSnapshot {
    /// Fraction of acquisitions served by joining an existing entry.
    pub fn dedup_rate(&self) -> f64 {
        let total = self.downloads_started + self.cache_joins;
        if total == 0 {
            0.0
        } else {
            self.cache_joins as f64 / total as f64
        }
    }

    /// Downloaded bytes in human-readable form.
    pub fn bytes_downloaded_human(&self) -> String {
        format_bytes(self.bytes_downloaded)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "regions {} loaded / {} evicted | items {} loaded, {} failed, {} out of bounds | \
             downloads {} ({} failed, {}) | dedup {:.0}% | reclaimed {} | violations {}",
            self.regions_loaded,
            self.regions_evicted,
            self.items_loaded,
            self.items_failed,
            self.items_out_of_bounds,
            self.downloads_started,
            self.downloads_failed,
            self.bytes_downloaded_human(),
            self.dedup_rate() * 100.0,
            self.assets_reclaimed,
            self.invariant_violations
        )
    }
}

/// Format a byte count using binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
