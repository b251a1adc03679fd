//! Content-addressed fetch boundary.

use bytes::Bytes;

use super::error::FetchError;
use super::key::AssetKey;
use crate::BoxFuture;

/// Default maximum artifact size (64 MiB).
pub const DEFAULT_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Default maximum triangle count.
pub const DEFAULT_MAX_TRIANGLES: u64 = 1_000_000;

/// Default maximum texture edge length in pixels.
pub const DEFAULT_MAX_TEXTURE_SIZE: u32 = 4096;

/// Limits handed to the fetcher with every request.
///
/// The fetcher is expected to reject artifacts that break any limit; the
/// download worker re-checks `max_bytes` on the payload it gets back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    pub max_bytes: u64,
    pub max_triangles: u64,
    pub max_texture_size: u32,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_triangles: DEFAULT_MAX_TRIANGLES,
            max_texture_size: DEFAULT_MAX_TEXTURE_SIZE,
        }
    }
}

/// A downloaded, not yet processed artifact.
#[derive(Debug, Clone)]
pub struct RawArtifact {
    pub key: AssetKey,
    pub mime: String,
    pub bytes: Bytes,
}

impl RawArtifact {
    pub fn new(key: AssetKey, mime: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            key,
            mime: mime.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Fetches raw artifacts from the content-addressed network.
///
/// Called only from the download worker, never from the main flow.
pub trait ArtifactFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        key: &'a AssetKey,
        limits: &'a FetchLimits,
    ) -> BoxFuture<'a, Result<RawArtifact, FetchError>>;
}
