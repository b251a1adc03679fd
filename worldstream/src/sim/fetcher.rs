//! In-memory artifact store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::asset::{ArtifactFetcher, AssetKey, FetchError, FetchLimits, RawArtifact};
use crate::scene::headless::{ModelDocument, HEADLESS_MODEL_MIME};
use crate::BoxFuture;

/// [`ArtifactFetcher`] serving artifacts from memory.
///
/// Counts fetches per key, and can inject latency and network failures.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    artifacts: RwLock<HashMap<AssetKey, (String, Bytes)>>,
    fetch_counts: Mutex<HashMap<AssetKey, u64>>,
    total_fetches: AtomicU64,
    latency: Mutex<Option<Duration>>,
    failing: Mutex<HashSet<AssetKey>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = Some(latency);
        self
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn insert_model(&self, key: AssetKey, document: &ModelDocument) {
        self.insert_raw(key, HEADLESS_MODEL_MIME, document.to_bytes());
    }

    pub fn insert_raw(&self, key: AssetKey, mime: impl Into<String>, bytes: impl Into<Bytes>) {
        self.artifacts.write().insert(key, (mime.into(), bytes.into()));
    }

    /// Make fetches of `key` fail with a network error until healed.
    pub fn fail_key(&self, key: AssetKey) {
        self.failing.lock().insert(key);
    }

    pub fn heal_key(&self, key: &AssetKey) {
        self.failing.lock().remove(key);
    }

    pub fn fetch_count(&self, key: &AssetKey) -> u64 {
        self.fetch_counts.lock().get(key).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u64 {
        self.total_fetches.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.read().is_empty()
    }

    fn lookup(&self, key: &AssetKey, limits: &FetchLimits) -> Result<RawArtifact, FetchError> {
        if self.failing.lock().contains(key) {
            return Err(FetchError::Network(format!("injected failure for {}", key)));
        }
        let (mime, bytes) = self
            .artifacts
            .read()
            .get(key)
            .cloned()
            .ok_or(FetchError::NotFound)?;

        if bytes.len() as u64 > limits.max_bytes {
            return Err(FetchError::LimitExceeded {
                limit: "bytes",
                actual: bytes.len() as u64,
                max: limits.max_bytes,
            });
        }
        if mime == HEADLESS_MODEL_MIME {
            if let Ok(document) = serde_json::from_slice::<ModelDocument>(&bytes) {
                let triangles = document.triangle_count();
                if triangles > limits.max_triangles {
                    return Err(FetchError::LimitExceeded {
                        limit: "triangles",
                        actual: triangles,
                        max: limits.max_triangles,
                    });
                }
            }
        }
        Ok(RawArtifact::new(key.clone(), mime, bytes))
    }
}

impl ArtifactFetcher for MemoryFetcher {
    fn fetch<'a>(
        &'a self,
        key: &'a AssetKey,
        limits: &'a FetchLimits,
    ) -> BoxFuture<'a, Result<RawArtifact, FetchError>> {
        Box::pin(async move {
            self.total_fetches.fetch_add(1, Ordering::SeqCst);
            *self.fetch_counts.lock().entry(key.clone()).or_insert(0) += 1;

            let latency = *self.latency.lock();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            self.lookup(key, limits)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::headless::ModelNode;
    use glam::Vec3;

    #[tokio::test]
    async fn test_fetch_counts_and_not_found() {
        let fetcher = MemoryFetcher::new();
        let key = AssetKey::new("col", 1);
        fetcher.insert_model(key.clone(), &ModelDocument::cuboid(Vec3::ONE));

        let raw = fetcher.fetch(&key, &FetchLimits::default()).await.unwrap();
        assert_eq!(raw.mime, HEADLESS_MODEL_MIME);
        assert_eq!(fetcher.fetch_count(&key), 1);

        let missing = AssetKey::new("col", 2);
        let err = fetcher.fetch(&missing, &FetchLimits::default()).await.unwrap_err();
        assert_eq!(err, FetchError::NotFound);
        assert_eq!(fetcher.total_fetches(), 2);
    }

    #[tokio::test]
    async fn test_triangle_limit() {
        let fetcher = MemoryFetcher::new();
        let key = AssetKey::new("col", 1);
        let heavy = ModelDocument::default().with_node(ModelNode::Mesh {
            min: Vec3::ZERO,
            max: Vec3::ONE,
            triangles: 5_000,
        });
        fetcher.insert_model(key.clone(), &heavy);

        let limits = FetchLimits {
            max_triangles: 1_000,
            ..FetchLimits::default()
        };
        let err = fetcher.fetch(&key, &limits).await.unwrap_err();
        assert!(matches!(err, FetchError::LimitExceeded { limit: "triangles", .. }));
    }

    #[tokio::test]
    async fn test_injected_failure_and_heal() {
        let fetcher = MemoryFetcher::new();
        let key = AssetKey::new("col", 1);
        fetcher.insert_model(key.clone(), &ModelDocument::cuboid(Vec3::ONE));
        fetcher.fail_key(key.clone());
        assert!(matches!(
            fetcher.fetch(&key, &FetchLimits::default()).await,
            Err(FetchError::Network(_))
        ));
        fetcher.heal_key(&key);
        assert!(fetcher.fetch(&key, &FetchLimits::default()).await.is_ok());
    }
}
