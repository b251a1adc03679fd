//! Engine bootstrap and lifecycle management.
//!
//! The [`Engine`] owns the asset cache, the download worker, the loading
//! queue and the streaming controller, and is the only place where the
//! collaborators (ledger, fetcher, scene loader, viewer, snapshot store)
//! are injected.
//!
//! # Example
//!
//! ```ignore
//! use worldstream::app::{Collaborators, Engine, EngineConfig};
//!
//! let engine = Engine::start(EngineConfig::default(), collaborators)?;
//!
//! // Once per frame
//! engine.tick().await;
//!
//! // Graceful shutdown
//! engine.shutdown().await;
//! ```

mod config;
mod engine;
mod error;

pub use config::{EngineConfig, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use engine::{Collaborators, Engine};
pub use error::EngineError;
