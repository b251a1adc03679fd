//! Viewer position and input activity.

use std::sync::Arc;
use std::time::Duration;

use glam::Vec3;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Where the viewer is and how recently the user did something.
pub trait ViewerInput: Send + Sync {
    fn viewer_position(&self) -> Vec3;

    /// Milliseconds since the last user input; `u64::MAX` if there was none.
    fn ms_since_last_input(&self) -> u64;
}

#[derive(Debug)]
struct ViewerState {
    position: Vec3,
    last_input: Option<Instant>,
}

/// Settable [`ViewerInput`] for the simulator and tests.
///
/// Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct SharedViewer {
    state: Arc<Mutex<ViewerState>>,
}

impl Default for SharedViewer {
    fn default() -> Self {
        Self::new(Vec3::ZERO)
    }
}

impl SharedViewer {
    pub fn new(position: Vec3) -> Self {
        Self {
            state: Arc::new(Mutex::new(ViewerState {
                position,
                last_input: None,
            })),
        }
    }

    /// Move without registering input (e.g. a scripted camera).
    pub fn set_position(&self, position: Vec3) {
        self.state.lock().position = position;
    }

    /// Move because the user asked to; registers input now.
    pub fn move_to(&self, position: Vec3) {
        let mut state = self.state.lock();
        state.position = position;
        state.last_input = Some(Instant::now());
    }

    pub fn touch(&self) {
        self.state.lock().last_input = Some(Instant::now());
    }

    pub fn clear_input(&self) {
        self.state.lock().last_input = None;
    }
}

impl ViewerInput for SharedViewer {
    fn viewer_position(&self) -> Vec3 {
        self.state.lock().position
    }

    fn ms_since_last_input(&self) -> u64 {
        match self.state.lock().last_input {
            Some(at) => at.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
            None => u64::MAX,
        }
    }
}

/// Whether input happened within `quiet_period`.
pub fn is_interacting(viewer: &dyn ViewerInput, quiet_period: Duration) -> bool {
    u128::from(viewer.ms_since_last_input()) < quiet_period.as_millis()
}
