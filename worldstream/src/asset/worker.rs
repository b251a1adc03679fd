//! Download worker boundary.
//!
//! The [`DownloadWorker`] is a long-running background task that owns every
//! raw transfer so large downloads never run on the per-frame flow:
//!
//! ```text
//! AssetCache ──► DownloadRequest ──► mpsc ──► worker loop
//!                                              │ (semaphore: max concurrent)
//!                                              ▼
//!                                   ArtifactFetcher::fetch (timeout)
//!                                              │
//! AssetCache ◄── oneshot ◄─────────────────────┘
//! ```
//!
//! Exactly one worker exists per engine. It is spawned once at start and
//! cancelled once at shutdown; requests in flight at shutdown resolve to
//! [`AssetError::Cancelled`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::error::AssetError;
use super::fetch::{ArtifactFetcher, FetchLimits, RawArtifact};
use super::key::AssetKey;
use crate::telemetry::EngineStats;

// =============================================================================
// Configuration
// =============================================================================

/// Default channel capacity for download requests.
pub const DEFAULT_WORKER_CHANNEL_CAPACITY: usize = 256;

/// Default number of concurrent transfers.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 8;

/// Default per-download timeout in seconds.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 30;

/// Configuration for the download worker.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Request channel capacity.
    pub channel_capacity: usize,

    /// Maximum concurrent transfers.
    pub max_concurrent: usize,

    /// Timeout for a single transfer.
    pub timeout: Duration,

    /// Limits passed to the fetcher.
    pub limits: FetchLimits,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_WORKER_CHANNEL_CAPACITY,
            max_concurrent: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            limits: FetchLimits::default(),
        }
    }
}

/// The worker could not be started.
#[derive(Debug, Error)]
pub enum WorkerSpawnError {
    #[error("no Tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("invalid worker configuration: {0}")]
    InvalidConfig(String),
}

// =============================================================================
// Worker
// =============================================================================

struct DownloadRequest {
    key: AssetKey,
    reply: oneshot::Sender<Result<RawArtifact, AssetError>>,
}

/// Handle to the background download task.
pub struct DownloadWorker {
    tx: mpsc::Sender<DownloadRequest>,
    shutdown: CancellationToken,
}

impl DownloadWorker {
    /// Spawn the worker on the current runtime.
    ///
    /// Fails when called outside a Tokio runtime or with a zero-sized
    /// channel or pool; the engine treats both as fatal.
    pub fn spawn(
        fetcher: Arc<dyn ArtifactFetcher>,
        config: WorkerConfig,
        stats: Arc<EngineStats>,
        tracker: &TaskTracker,
    ) -> Result<Self, WorkerSpawnError> {
        if config.channel_capacity == 0 || config.max_concurrent == 0 {
            return Err(WorkerSpawnError::InvalidConfig(format!(
                "channel_capacity={} max_concurrent={}",
                config.channel_capacity, config.max_concurrent
            )));
        }
        let handle =
            Handle::try_current().map_err(|e| WorkerSpawnError::NoRuntime(e.to_string()))?;

        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let shutdown = CancellationToken::new();

        info!(
            max_concurrent = config.max_concurrent,
            timeout_secs = config.timeout.as_secs(),
            max_bytes = config.limits.max_bytes,
            "Download worker starting"
        );

        tracker.spawn_on(
            run(rx, fetcher, config, stats, shutdown.clone(), tracker.clone()),
            &handle,
        );

        Ok(Self { tx, shutdown })
    }

    /// Download one artifact through the worker.
    pub async fn download(&self, key: AssetKey) -> Result<RawArtifact, AssetError> {
        if self.shutdown.is_cancelled() {
            return Err(AssetError::Cancelled);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DownloadRequest { key, reply })
            .await
            .map_err(|_| AssetError::Cancelled)?;
        // A dropped reply means the worker shut down mid-transfer.
        rx.await.map_err(|_| AssetError::Cancelled)?
    }

    /// Cancel the worker. In-flight and queued downloads resolve to `Cancelled`.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Download worker shutting down");
            self.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for DownloadWorker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(
    mut rx: mpsc::Receiver<DownloadRequest>,
    fetcher: Arc<dyn ArtifactFetcher>,
    config: WorkerConfig,
    stats: Arc<EngineStats>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    let permits = Arc::new(Semaphore::new(config.max_concurrent));

    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        // Waiting here is the backpressure: the channel fills up behind us.
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let fetcher = Arc::clone(&fetcher);
        let stats = Arc::clone(&stats);
        let shutdown = shutdown.clone();
        let limits = config.limits;
        let timeout = config.timeout;

        tracker.spawn(async move {
            let _permit = permit;
            let DownloadRequest { key, reply } = request;
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Err(AssetError::Cancelled),
                result = fetch_one(fetcher.as_ref(), &key, &limits, timeout) => result,
            };
            match &result {
                Ok(raw) => {
                    stats.record_bytes_downloaded(raw.len() as u64);
                    debug!(key = %key, bytes = raw.len(), mime = %raw.mime, "Download complete");
                }
                Err(AssetError::Cancelled) => {}
                Err(e) => {
                    stats.record_download_failed();
                    warn!(key = %key, error = %e, "Download failed");
                }
            }
            // Requester may have gone away; nothing to do then.
            let _ = reply.send(result);
        });
    }

    rx.close();
    debug!("Download worker stopped");
}

async fn fetch_one(
    fetcher: &dyn ArtifactFetcher,
    key: &AssetKey,
    limits: &FetchLimits,
    timeout: Duration,
) -> Result<RawArtifact, AssetError> {
    let raw = match tokio::time::timeout(timeout, fetcher.fetch(key, limits)).await {
        Err(_) => {
            return Err(AssetError::WorkerTimeout {
                key: key.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
        Ok(result) => result.map_err(|e| e.into_asset_error(key))?,
    };

    if raw.len() as u64 > limits.max_bytes {
        return Err(AssetError::LimitExceeded {
            key: key.clone(),
            limit: "bytes",
            actual: raw.len() as u64,
            max: limits.max_bytes,
        });
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::error::FetchError;
    use crate::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubFetcher {
        calls: AtomicUsize,
        payload: Vec<u8>,
        delay: Duration,
    }

    impl StubFetcher {
        fn new(payload: Vec<u8>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                payload,
                delay: Duration::ZERO,
            }
        }
    }

    impl ArtifactFetcher for StubFetcher {
        fn fetch<'a>(
            &'a self,
            key: &'a AssetKey,
            _limits: &'a FetchLimits,
        ) -> BoxFuture<'a, Result<RawArtifact, FetchError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                if key.id == 404 {
                    return Err(FetchError::NotFound);
                }
                Ok(RawArtifact::new(key.clone(), "model/test", self.payload.clone()))
            })
        }
    }

    fn spawn_worker(fetcher: Arc<StubFetcher>, config: WorkerConfig) -> DownloadWorker {
        DownloadWorker::spawn(
            fetcher,
            config,
            Arc::new(EngineStats::new()),
            &TaskTracker::new(),
        )
        .expect("worker should spawn inside a runtime")
    }

    #[tokio::test]
    async fn test_download_round_trip() {
        let fetcher = Arc::new(StubFetcher::new(vec![1, 2, 3]));
        let worker = spawn_worker(Arc::clone(&fetcher), WorkerConfig::default());

        let raw = worker.download(AssetKey::new("col", 1)).await.unwrap();
        assert_eq!(raw.len(), 3);
        assert_eq!(raw.mime, "model/test");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_payload_over_byte_limit_is_rejected() {
        let fetcher = Arc::new(StubFetcher::new(vec![0; 64]));
        let mut config = WorkerConfig::default();
        config.limits.max_bytes = 16;
        let worker = spawn_worker(fetcher, config);

        let err = worker.download(AssetKey::new("col", 1)).await.unwrap_err();
        assert!(matches!(err, AssetError::LimitExceeded { actual: 64, max: 16, .. }));
    }

    #[tokio::test]
    async fn test_fetch_error_is_mapped() {
        let worker = spawn_worker(Arc::new(StubFetcher::new(vec![1])), WorkerConfig::default());
        let err = worker.download(AssetKey::new("col", 404)).await.unwrap_err();
        assert!(matches!(err, AssetError::Malformed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let mut fetcher = StubFetcher::new(vec![1]);
        fetcher.delay = Duration::from_secs(60);
        let config = WorkerConfig {
            timeout: Duration::from_secs(1),
            ..WorkerConfig::default()
        };
        let worker = spawn_worker(Arc::new(fetcher), config);

        let err = worker.download(AssetKey::new("col", 1)).await.unwrap_err();
        assert!(matches!(err, AssetError::WorkerTimeout { timeout_ms: 1000, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_download_after_shutdown_is_cancelled() {
        let worker = spawn_worker(Arc::new(StubFetcher::new(vec![1])), WorkerConfig::default());
        worker.shutdown();
        assert!(worker.is_shut_down());
        let err = worker.download(AssetKey::new("col", 1)).await.unwrap_err();
        assert_eq!(err, AssetError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_in_flight() {
        let mut fetcher = StubFetcher::new(vec![1]);
        fetcher.delay = Duration::from_secs(10);
        let worker = Arc::new(spawn_worker(Arc::new(fetcher), WorkerConfig::default()));

        let pending = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.download(AssetKey::new("col", 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        worker.shutdown();

        let result = pending.await.unwrap();
        assert_eq!(result.unwrap_err(), AssetError::Cancelled);
    }

    #[test]
    fn test_spawn_outside_runtime_fails() {
        let result = DownloadWorker::spawn(
            Arc::new(StubFetcher::new(vec![])),
            WorkerConfig::default(),
            Arc::new(EngineStats::new()),
            &TaskTracker::new(),
        );
        assert!(matches!(result, Err(WorkerSpawnError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_rejected() {
        let config = WorkerConfig {
            max_concurrent: 0,
            ..WorkerConfig::default()
        };
        let result = DownloadWorker::spawn(
            Arc::new(StubFetcher::new(vec![])),
            config,
            Arc::new(EngineStats::new()),
            &TaskTracker::new(),
        );
        assert!(matches!(result, Err(WorkerSpawnError::InvalidConfig(_))));
    }
}
