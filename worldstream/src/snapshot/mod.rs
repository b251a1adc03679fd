//! Best-effort persistence of region item sets.
//!
//! A snapshot lets a region show its last known items immediately on load,
//! before the first ledger round-trip completes. Snapshots are advisory:
//! the refresh that follows always diffs against the ledger, so a stale or
//! missing snapshot only costs time. Corrupted or foreign-version files are
//! treated as absent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ledger::{ChangeToken, ItemRecord, RegionId};
use crate::BoxFuture;

/// Persisted state of one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSnapshot {
    /// Crate version that wrote the snapshot.
    pub version: String,
    pub region: RegionId,
    /// Token the items were synchronized at.
    pub token: Option<ChangeToken>,
    pub items: Vec<ItemRecord>,
    /// Seconds since UNIX_EPOCH.
    pub saved_at_secs: u64,
}

impl RegionSnapshot {
    pub fn new(region: RegionId, token: Option<ChangeToken>, items: Vec<ItemRecord>) -> Self {
        let saved_at_secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            version: crate::VERSION.to_string(),
            region,
            token,
            items,
            saved_at_secs,
        }
    }

    /// Whether this build can use the snapshot.
    pub fn is_compatible(&self) -> bool {
        self.version == crate::VERSION
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage for region snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Load the snapshot of a region; `Ok(None)` when there is none usable.
    fn load_snapshot(
        &self,
        region: RegionId,
    ) -> BoxFuture<'_, Result<Option<RegionSnapshot>, SnapshotError>>;

    fn save_snapshot(&self, snapshot: RegionSnapshot) -> BoxFuture<'_, Result<(), SnapshotError>>;
}

// =============================================================================
// File store
// =============================================================================

/// One JSON file per region under a directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, region: RegionId) -> PathBuf {
        self.dir.join(format!("region-{}.json", region.0))
    }
}

/// Default snapshot directory (`~/.worldstream/snapshots`).
pub fn default_snapshot_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".worldstream").join("snapshots"))
}

impl SnapshotStore for FileSnapshotStore {
    fn load_snapshot(
        &self,
        region: RegionId,
    ) -> BoxFuture<'_, Result<Option<RegionSnapshot>, SnapshotError>> {
        Box::pin(async move {
            let path = self.path_for(region);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            match serde_json::from_slice::<RegionSnapshot>(&bytes) {
                Ok(snapshot) if snapshot.is_compatible() && snapshot.region == region => {
                    Ok(Some(snapshot))
                }
                Ok(snapshot) => {
                    debug!(
                        region = %region,
                        version = %snapshot.version,
                        "Ignoring snapshot from another version"
                    );
                    Ok(None)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupted snapshot");
                    Ok(None)
                }
            }
        })
    }

    fn save_snapshot(&self, snapshot: RegionSnapshot) -> BoxFuture<'_, Result<(), SnapshotError>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.dir).await?;
            let path = self.path_for(snapshot.region);
            let bytes = serde_json::to_vec_pretty(&snapshot)?;

            // Write to temp file first, then rename
            let temp_path = path.with_extension("tmp");
            tokio::fs::write(&temp_path, &bytes).await?;
            tokio::fs::rename(&temp_path, &path).await?;

            debug!(region = %snapshot.region, items = snapshot.items.len(), "Snapshot saved");
            Ok(())
        })
    }
}

// =============================================================================
// Memory store
// =============================================================================

/// In-memory store for tests and the simulator.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<RegionId, RegionSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, region: RegionId) -> Option<RegionSnapshot> {
        self.snapshots.lock().get(&region).cloned()
    }

    pub fn insert(&self, snapshot: RegionSnapshot) {
        self.snapshots.lock().insert(snapshot.region, snapshot);
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load_snapshot(
        &self,
        region: RegionId,
    ) -> BoxFuture<'_, Result<Option<RegionSnapshot>, SnapshotError>> {
        let snapshot = self.get(region);
        Box::pin(async move { Ok(snapshot) })
    }

    fn save_snapshot(&self, snapshot: RegionSnapshot) -> BoxFuture<'_, Result<(), SnapshotError>> {
        self.insert(snapshot);
        Box::pin(async { Ok(()) })
    }
}
