//! Asset pipeline: keys, download worker, processing queue and cache.
//!
//! ```text
//! AssetCache::acquire(key)
//!     │ (one pipeline per key)
//!     ▼
//! DownloadWorker ──► ArtifactFetcher (content network)
//!     │ RawArtifact
//!     ▼
//! ProcessingQueue ──► SceneLoader (parse, strip, rescale, freeze)
//!     │ SharedScene
//!     ▼
//! RefCounted<SharedScene>  (callers inc_ref / release)
//! ```

mod cache;
mod error;
mod fetch;
mod key;
mod processing;
mod refcount;
mod worker;

pub use cache::{AssetCache, CacheConfig, CleanupResult, SharedAsset};
pub use error::{AssetError, ErrorKind, FetchError, InvariantViolation};
pub use fetch::{
    ArtifactFetcher, FetchLimits, RawArtifact, DEFAULT_MAX_BYTES, DEFAULT_MAX_TEXTURE_SIZE,
    DEFAULT_MAX_TRIANGLES,
};
pub use key::{AssetKey, AssetKeyParseError};
pub use processing::{
    ProcessingConfig, ProcessingQueue, ThroughputProfile, ThroughputSwitch, DEFAULT_BASE_SIZE,
    DEFAULT_SLOW_INTERVAL_MS,
};
pub use refcount::{AlreadyReclaimed, RefCounted};
pub use worker::{
    DownloadWorker, WorkerConfig, WorkerSpawnError, DEFAULT_WORKER_CHANNEL_CAPACITY,
    DEFAULT_DOWNLOAD_TIMEOUT_SECS, DEFAULT_MAX_CONCURRENT_DOWNLOADS,
};
