//! Error types for the asset pipeline.
//!
//! [`AssetError`] is `Clone` because a single pipeline result is shared by
//! every requester that joined the same cache entry.

use thiserror::Error;

use super::key::AssetKey;

/// How the engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network/ledger hiccup or worker timeout. Retried at the next natural
    /// opportunity (a later acquire, a region refresh retry).
    Transient,
    /// The artifact itself is unusable. Surfaced as a failed item, never
    /// retried automatically.
    Content,
    /// The operation was abandoned because its owner went away.
    Cancelled,
}

/// Errors produced while acquiring a scene-ready asset.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AssetError {
    /// Raw download failed.
    #[error("download of {key} failed: {reason}")]
    Download { key: AssetKey, reason: String },

    /// The download worker did not answer in time.
    #[error("download of {key} timed out after {timeout_ms}ms")]
    WorkerTimeout { key: AssetKey, timeout_ms: u64 },

    /// The artifact's mime type is not handled by the scene loader.
    #[error("unsupported format '{mime}' for {key}")]
    UnsupportedFormat { key: AssetKey, mime: String },

    /// The artifact exceeds a configured fetch limit.
    #[error("{key} exceeds {limit} limit ({actual} > {max})")]
    LimitExceeded {
        key: AssetKey,
        limit: &'static str,
        actual: u64,
        max: u64,
    },

    /// The artifact could not be parsed.
    #[error("malformed artifact {key}: {reason}")]
    Malformed { key: AssetKey, reason: String },

    /// Nothing renderable was left after stripping non-geometry content.
    #[error("{key} has no geometry")]
    EmptyGeometry { key: AssetKey },

    /// The pipeline was cancelled (worker or queue shut down).
    #[error("asset pipeline cancelled")]
    Cancelled,

    /// The cache has been disposed.
    #[error("asset cache is shutting down")]
    ShuttingDown,
}

impl AssetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AssetError::Download { .. } | AssetError::WorkerTimeout { .. } => ErrorKind::Transient,
            AssetError::UnsupportedFormat { .. }
            | AssetError::LimitExceeded { .. }
            | AssetError::Malformed { .. }
            | AssetError::EmptyGeometry { .. } => ErrorKind::Content,
            AssetError::Cancelled | AssetError::ShuttingDown => ErrorKind::Cancelled,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Errors returned by an [`super::ArtifactFetcher`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("artifact not found")]
    NotFound,

    #[error("{limit} limit exceeded ({actual} > {max})")]
    LimitExceeded {
        limit: &'static str,
        actual: u64,
        max: u64,
    },
}

impl FetchError {
    /// Attach the key the fetch was for.
    pub fn into_asset_error(self, key: &AssetKey) -> AssetError {
        match self {
            FetchError::Network(reason) => AssetError::Download {
                key: key.clone(),
                reason,
            },
            // A missing artifact will stay missing.
            FetchError::NotFound => AssetError::Malformed {
                key: key.clone(),
                reason: "artifact not found".to_string(),
            },
            FetchError::LimitExceeded { limit, actual, max } => AssetError::LimitExceeded {
                key: key.clone(),
                limit,
                actual,
                max,
            },
        }
    }
}

/// Bookkeeping bugs. Logged and counted, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("refcount of {0} would go negative")]
    NegativeRefCount(String),

    #[error("{0} disposed twice")]
    DoubleDispose(String),

    #[error("release of {0} without a cache entry")]
    ReleaseWithoutEntry(AssetKey),

    #[error("release of {0} while its load is still pending")]
    ReleaseWhilePending(AssetKey),
}
