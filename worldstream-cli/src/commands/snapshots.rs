//! Region snapshot management CLI commands.

use std::path::{Path, PathBuf};

use clap::Subcommand;
use worldstream::config::ConfigFile;
use worldstream::telemetry::format_bytes;

use crate::error::CliError;

/// Snapshot action subcommands.
#[derive(Debug, Subcommand)]
pub enum SnapshotAction {
    /// Delete every persisted region snapshot
    Clear,
    /// Show how many snapshots are stored and their size
    Stats,
}

/// Run a snapshots subcommand.
pub fn run(action: SnapshotAction) -> Result<(), CliError> {
    let config = ConfigFile::load()?;
    let dir = config.cache.snapshot_dir.ok_or_else(|| {
        CliError::Config(
            "Snapshots are disabled. Set cache.snapshot_dir to enable them.".to_string(),
        )
    })?;

    match action {
        SnapshotAction::Clear => {
            println!("Clearing snapshots in: {}", dir.display());
            let (files, bytes) = clear_snapshots(&dir)?;
            println!("Deleted {} snapshots, freed {}", files, format_bytes(bytes));
        }
        SnapshotAction::Stats => {
            println!("Snapshots: {}", dir.display());
            let files = snapshot_files(&dir)?;
            let bytes = total_size(&files);
            println!("  Regions: {}", files.len());
            println!("  Size:    {}", format_bytes(bytes));
        }
    }
    Ok(())
}

/// `region-*.json` files in `dir`; empty if the directory does not exist.
fn snapshot_files(dir: &Path) -> Result<Vec<PathBuf>, CliError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CliError::Snapshots(format!("{}: {}", dir.display(), e))),
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("region-") && name.ends_with(".json"))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn total_size(files: &[PathBuf]) -> u64 {
    files
        .iter()
        .filter_map(|path| std::fs::metadata(path).ok())
        .map(|meta| meta.len())
        .sum()
}

fn clear_snapshots(dir: &Path) -> Result<(usize, u64), CliError> {
    let files = snapshot_files(dir)?;
    let mut deleted = 0;
    let mut freed = 0;
    for path in files {
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        std::fs::remove_file(&path)
            .map_err(|e| CliError::Snapshots(format!("{}: {}", path.display(), e)))?;
        deleted += 1;
        freed += size;
    }
    Ok((deleted, freed))
}
