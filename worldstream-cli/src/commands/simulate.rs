//! Simulate command - stream a generated world along a viewer path.
//!
//! The viewer walks a loop one cell inside the world edge. Each step moves
//! it `speed` units and runs one engine tick; every `churn_every` ticks one
//! resident region is edited on the ledger and refreshed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Args;
use glam::Vec3;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use worldstream::app::{Collaborators, Engine};
use worldstream::scene::headless::HeadlessLoader;
use worldstream::sim::{SyntheticWorld, SyntheticWorldConfig};
use worldstream::snapshot::{FileSnapshotStore, SnapshotStore};
use worldstream::telemetry::StatsSnapshot;
use worldstream::world::{RefreshOutcome, SharedViewer, TickOutcome};

use crate::error::CliError;
use crate::runner::CliRunner;

/// Arguments for the simulate command.
#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Number of regions in the generated world
    #[arg(long, default_value_t = 64)]
    pub regions: u32,

    /// Items placed in each region
    #[arg(long, default_value_t = 16)]
    pub items: usize,

    /// Distinct assets shared by all items
    #[arg(long, default_value_t = 24)]
    pub assets: u64,

    /// World generation seed
    #[arg(long, default_value_t = 7)]
    pub seed: u64,

    /// Number of engine ticks to run
    #[arg(long, default_value_t = 600)]
    pub ticks: u32,

    /// Viewer movement per tick in world units
    #[arg(long, default_value_t = 5.0)]
    pub speed: f32,

    /// Delay between ticks in milliseconds
    #[arg(long, default_value_t = 16)]
    pub tick_ms: u64,

    /// Simulated fetch latency in milliseconds
    #[arg(long, default_value_t = 0)]
    pub latency_ms: u64,

    /// Edit and refresh one resident region every N ticks (0 = never)
    #[arg(long, default_value_t = 0)]
    pub churn_every: u32,

    /// Streaming radius (overrides config)
    #[arg(long)]
    pub radius: Option<f32>,

    /// Do not read or write region snapshots
    #[arg(long)]
    pub no_snapshots: bool,

    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,
}

/// Run the simulate command.
pub fn run(args: SimulateArgs) -> Result<(), CliError> {
    if !(args.speed.is_finite() && args.speed >= 0.0) {
        return Err(CliError::Config(format!(
            "--speed must be a non-negative number, got {}",
            args.speed
        )));
    }
    if args.regions == 0 {
        return Err(CliError::Config("--regions must be at least 1".to_string()));
    }

    let runner = CliRunner::new(args.verbose)?;
    runner.log_startup("simulate");
    let config = runner.config();

    let mut engine_config = config.to_engine_config();
    if let Some(radius) = args.radius {
        engine_config = engine_config.with_radius(radius);
    }

    let mut world = SyntheticWorld::generate(SyntheticWorldConfig {
        regions: args.regions,
        items_per_region: args.items,
        asset_pool: args.assets,
        cell_size: engine_config.streaming.cell_size,
        seed: args.seed,
        ..Default::default()
    });
    let fetcher = world.fetcher();
    if args.latency_ms > 0 {
        fetcher.set_latency(Some(Duration::from_millis(args.latency_ms)));
    }

    let snapshots: Option<Arc<dyn SnapshotStore>> = match (&config.cache.snapshot_dir, args.no_snapshots) {
        (Some(dir), false) => Some(Arc::new(FileSnapshotStore::new(dir.clone()))),
        _ => None,
    };

    let extent = world.extent();
    let inset = engine_config.streaming.cell_size * 0.5;
    let viewer = Arc::new(SharedViewer::new(path_position(extent, inset, 0.0)));

    println!("WorldStream Simulation v{}", worldstream::VERSION);
    println!("=============================");
    println!();
    println!("World:    {} regions, {} items each, {} assets", args.regions, args.items, args.assets);
    println!("Extent:   {:.0} x {:.0}", extent.x, extent.z);
    println!("Radius:   {:.0}", engine_config.streaming.radius);
    println!(
        "Snapshots: {}",
        if snapshots.is_some() { "enabled" } else { "disabled" }
    );
    println!();
    println!("Press Ctrl+C to stop early");
    println!();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::SeqCst);
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    let started = Instant::now();
    let (stats, ticks_run, recomputed) = runner.block_on(async {
        let ledger = world.ledger();
        let engine = Engine::start(
            engine_config,
            Collaborators {
                ledger: ledger.clone(),
                submitter: Some(ledger),
                fetcher,
                loader: Arc::new(HeadlessLoader::new()),
                viewer: viewer.clone(),
                snapshots,
            },
        )?;

        let progress = ProgressBar::new(u64::from(args.ticks));
        progress.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} ticks | {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut ticks_run = 0u32;
        let mut recomputed = 0u32;
        for tick in 0..args.ticks {
            if shutdown.load(Ordering::SeqCst) {
                progress.println("Received shutdown signal, stopping...");
                break;
            }

            let distance = tick as f32 * args.speed;
            viewer.move_to(path_position(extent, inset, distance));
            if let TickOutcome::Recomputed { resident, .. } = engine.tick().await {
                recomputed += 1;
                progress.set_message(format!("{} regions resident", resident));
            }

            if args.churn_every > 0 && tick > 0 && tick % args.churn_every == 0 {
                churn_one(&engine, &mut world, tick).await;
            }

            ticks_run += 1;
            progress.inc(1);
            tokio::time::sleep(Duration::from_millis(args.tick_ms)).await;
        }
        progress.finish_and_clear();

        engine.settle().await;
        let stats = engine.stats();
        engine.shutdown().await;
        Ok::<_, CliError>((stats, ticks_run, recomputed))
    })?;

    print_summary(&stats, ticks_run, recomputed, started.elapsed());
    Ok(())
}

/// Edit one resident region on the ledger and refresh it.
async fn churn_one(engine: &Engine, world: &mut SyntheticWorld, tick: u32) {
    let resident: Vec<_> = engine.controller().resident_ids().into_iter().collect();
    if resident.is_empty() {
        return;
    }
    let id = resident[tick as usize % resident.len()];
    if world.churn(id).is_none() {
        return;
    }
    let Some(region) = engine.controller().region(id) else {
        return;
    };
    match region.refresh(false).await {
        RefreshOutcome::Applied(summary) => info!(region = %id, %summary, "Churned region"),
        RefreshOutcome::GaveUp(e) => warn!(region = %id, error = %e, "Churn refresh gave up"),
        _ => {}
    }
}

/// Point `distance` units along the loop `inset` inside `extent`.
fn path_position(extent: Vec3, inset: f32, distance: f32) -> Vec3 {
    let lo = inset.min(extent.x * 0.5).min(extent.z * 0.5);
    let width = (extent.x - 2.0 * lo).max(0.0);
    let depth = (extent.z - 2.0 * lo).max(0.0);
    let perimeter = 2.0 * (width + depth);
    if perimeter <= 0.0 {
        return Vec3::new(lo, 0.0, lo);
    }

    let mut d = distance.rem_euclid(perimeter);
    if d < width {
        return Vec3::new(lo + d, 0.0, lo);
    }
    d -= width;
    if d < depth {
        return Vec3::new(lo + width, 0.0, lo + d);
    }
    d -= depth;
    if d < width {
        return Vec3::new(lo + width - d, 0.0, lo + depth);
    }
    d -= width;
    Vec3::new(lo, 0.0, lo + depth - d)
}

fn print_summary(stats: &StatsSnapshot, ticks: u32, recomputed: u32, elapsed: Duration) {
    println!();
    println!("Session Summary");
    println!("───────────────");
    println!(
        "  Ticks:           {} ({} recomputed) in {:.1}s",
        ticks,
        recomputed,
        elapsed.as_secs_f64()
    );
    println!(
        "  Regions:         {} loaded, {} evicted",
        stats.regions_loaded, stats.regions_evicted
    );
    println!(
        "  Items:           {} loaded, {} failed, {} out of bounds",
        stats.items_loaded, stats.items_failed, stats.items_out_of_bounds
    );
    println!(
        "  Downloads:       {} ({} failed, {})",
        stats.downloads_started,
        stats.downloads_failed,
        stats.bytes_downloaded_human()
    );
    println!(
        "  Cache joins:     {} ({:.0}% dedup)",
        stats.cache_joins,
        stats.dedup_rate() * 100.0
    );
    println!(
        "  Refreshes:       {} applied, {} unchanged, {} failed",
        stats.refreshes_applied, stats.refreshes_unchanged, stats.refresh_failures
    );
    println!("  Assets reclaimed: {}", stats.assets_reclaimed);
    if stats.invariant_violations > 0 {
        println!("  Invariant violations: {}", stats.invariant_violations);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_path_corners() {
        let extent = Vec3::new(400.0, 0.0, 200.0);
        assert_eq!(path_position(extent, 50.0, 0.0), Vec3::new(50.0, 0.0, 50.0));
        assert_eq!(path_position(extent, 50.0, 300.0), Vec3::new(350.0, 0.0, 50.0));
        assert_eq!(path_position(extent, 50.0, 400.0), Vec3::new(350.0, 0.0, 150.0));
        assert_eq!(path_position(extent, 50.0, 700.0), Vec3::new(50.0, 0.0, 150.0));
        // Full loop.
        assert_eq!(path_position(extent, 50.0, 800.0), Vec3::new(50.0, 0.0, 50.0));
    }

    #[test]
    fn test_path_degenerate_world() {
        let extent = Vec3::new(100.0, 0.0, 100.0);
        assert_eq!(path_position(extent, 50.0, 123.0), Vec3::new(50.0, 0.0, 50.0));
    }

    proptest! {
        #[test]
        fn prop_path_stays_inside(
            w in 100.0f32..2000.0,
            h in 100.0f32..2000.0,
            d in 0.0f32..100_000.0,
        ) {
            let p = path_position(Vec3::new(w, 0.0, h), 50.0, d);
            prop_assert!(p.x >= 49.9 && p.x <= w - 49.9);
            prop_assert!(p.z >= 49.9 && p.z <= h - 49.9);
        }
    }
}
