//! World streaming: regions, placed items and the controller that keeps the
//! right regions resident.
//!
//! Regions and the controller share one [`WorldContext`] holding the asset
//! cache, the ledger collaborators and the task trackers. Items refer to
//! their owner by id ([`Owner`]); the region map and the controller map are
//! the only owners of items and regions.

mod context;
mod controller;
mod item;
mod loading;
mod owner;
mod policy;
mod region;
mod spatial;
mod viewer;

pub use context::{RegionSettings, WorldContext, DEFAULT_LOD_DISTANCE};
pub use controller::{
    StreamingConfig, StreamingController, TickOutcome, DEFAULT_EVICTION_HYSTERESIS,
    DEFAULT_INPUT_QUIET_PERIOD_MS, DEFAULT_STREAMING_RADIUS, DEFAULT_UPDATE_THRESHOLD,
};
pub use item::{Containment, ItemLoad, LoadOutcome, LoadState, PlacedItem};
pub use loading::{LoadPriority, LoadingQueue, DEFAULT_MAX_CONCURRENT_LOADS, MIN_PRIORITY_DISTANCE};
pub use owner::Owner;
pub use policy::{
    RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_RETRY_INITIAL_DELAY_MS,
    DEFAULT_RETRY_MAX_DELAY_SECS,
};
pub use region::{DiffSummary, RefreshOutcome, Region, SaveError};
pub use spatial::{SpatialIndex, DEFAULT_CELL_SIZE};
pub use viewer::{is_interacting, SharedViewer, ViewerInput};
