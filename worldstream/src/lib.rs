//! WorldStream - Asset streaming and region synchronization for ledger-backed 3D worlds
//!
//! This library keeps a bounded set of expensive, asynchronously fetched 3D
//! content resident while a viewer moves through an open world whose regions
//! and placed items are defined by records on an external ledger.
//!
//! # Architecture
//!
//! ```text
//! StreamingController ──► SpatialIndex ──► Region::load / refresh (ledger + diff)
//!                                                  │
//!                                                  ▼
//!                               LoadingQueue (scale / distance² priority)
//!                                                  │
//!                                                  ▼
//!                 AssetCache::acquire ──► DownloadWorker ──► ProcessingQueue
//!                                                  │
//!                                                  ▼
//!                          PlacedItem instantiates + increments refcount
//! ```
//!
//! The [`app::Engine`] owns every component and is the only place where the
//! collaborators (ledger, fetcher, scene engine, viewer, persistence) are
//! injected.

pub mod app;
pub mod asset;
pub mod config;
pub mod coord;
pub mod ledger;
pub mod logging;
pub mod scene;
pub mod sim;
pub mod snapshot;
pub mod telemetry;
pub mod world;

use std::future::Future;
use std::pin::Pin;

/// Boxed future type for dyn-compatible async trait methods.
///
/// Collaborator traits (ledger, fetcher, persistence) return this so the
/// engine can hold them as `Arc<dyn Trait>`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Crate version, reported in logs and the CLI banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
