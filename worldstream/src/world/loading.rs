//! Priority-ordered, concurrency-limited queue for item loads.
//!
//! Every region pushes its item loads here. Jobs are ordered by
//! [`LoadPriority`] (higher first), then by push order (FIFO within the
//! same priority). Ordering is a scheduling preference only: completion
//! order is not guaranteed once jobs are admitted.
//!
//! Each push spawns one admission task. When an admission task obtains a
//! permit it pops whichever job is best *at that moment*, so a large, near
//! item pushed late still overtakes small, far items that are waiting.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::BoxFuture;

/// Default number of item loads admitted at once.
pub const DEFAULT_MAX_CONCURRENT_LOADS: usize = 16;

/// Distances below this are clamped so priority stays finite.
pub const MIN_PRIORITY_DISTANCE: f32 = 1.0;

// =============================================================================
// Priority
// =============================================================================

/// `scale / distance²`: large-and-near items load before small-and-far ones.
#[derive(Debug, Clone, Copy)]
pub struct LoadPriority(f64);

impl LoadPriority {
    pub fn new(max_scale: f32, distance: f32) -> Self {
        let distance = if distance.is_finite() {
            distance.max(MIN_PRIORITY_DISTANCE)
        } else {
            f32::MAX
        };
        let scale = if max_scale.is_finite() { max_scale.max(0.0) } else { 0.0 };
        let d = f64::from(distance);
        Self(f64::from(scale) / (d * d))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl PartialEq for LoadPriority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LoadPriority {}

impl PartialOrd for LoadPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LoadPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

// =============================================================================
// Queued job
// =============================================================================

struct QueuedLoad {
    priority: LoadPriority,
    sequence: u64,
    label: String,
    job: BoxFuture<'static, ()>,
}

impl fmt::Debug for QueuedLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedLoad")
            .field("label", &self.label)
            .field("priority", &self.priority.0)
            .field("sequence", &self.sequence)
            .finish()
    }
}

// Max-heap: higher priority first, then lower sequence (older) first
impl PartialEq for QueuedLoad {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedLoad {}

impl PartialOrd for QueuedLoad {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedLoad {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

// =============================================================================
// Loading queue
// =============================================================================

/// Shared loading queue.
pub struct LoadingQueue {
    heap: Arc<Mutex<BinaryHeap<QueuedLoad>>>,
    permits: Arc<Semaphore>,
    sequence: AtomicU64,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl LoadingQueue {
    pub fn new(max_concurrent: usize, tracker: TaskTracker) -> Self {
        Self {
            heap: Arc::new(Mutex::new(BinaryHeap::new())),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            sequence: AtomicU64::new(0),
            tracker,
            shutdown: CancellationToken::new(),
        }
    }

    /// Queue a load job. Dropped without running if the queue shuts down
    /// before it is admitted.
    pub fn schedule(&self, priority: LoadPriority, label: impl Into<String>, job: BoxFuture<'static, ()>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().push(QueuedLoad {
            priority,
            sequence,
            label: label.into(),
            job,
        });

        let heap = Arc::clone(&self.heap);
        let permits = Arc::clone(&self.permits);
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let Some(next) = heap.lock().pop() else {
                return;
            };
            debug!(label = %next.label, priority = next.priority.0, "Load admitted");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                _ = next.job => {}
            }
        });
    }

    /// Jobs waiting for admission.
    pub fn pending(&self) -> usize {
        self.heap.lock().len()
    }

    /// Drop every waiting job and stop admitting new ones.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.permits.close();
        let dropped = {
            let mut heap = self.heap.lock();
            let n = heap.len();
            heap.clear();
            n
        };
        info!(dropped, "Loading queue shut down");
    }
}
