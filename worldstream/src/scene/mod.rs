//! Rendering engine boundary.
//!
//! The streaming core never looks inside a scene. It drives these traits:
//!
//! - [`SceneLoader`] turns a raw artifact into an editable [`SceneDraft`]
//! - [`SceneDraft`] exposes the processing steps the [`ProcessingQueue`]
//!   runs in order, then freezes into a shareable [`SceneAsset`]
//! - [`SceneAsset`] is instantiated once per placed item as a lightweight
//!   [`SceneInstance`]
//!
//! [`headless`] provides a bounds-only implementation used by the simulator
//! and the tests.
//!
//! [`ProcessingQueue`]: crate::asset::ProcessingQueue

pub mod headless;

use std::fmt;
use std::sync::Arc;

use crate::asset::{AssetError, RawArtifact};
use crate::coord::{Aabb, Transform};

/// A processed asset shared by every instance of its key.
pub type SharedScene = Arc<dyn SceneAsset>;

/// Parses raw artifacts into drafts.
pub trait SceneLoader: Send + Sync {
    /// Whether this loader understands the mime type.
    fn supports(&self, mime: &str) -> bool;

    /// Parse the artifact. Fails with a content error on malformed data.
    fn parse(&self, raw: &RawArtifact) -> Result<Box<dyn SceneDraft>, AssetError>;
}

/// A parsed, still mutable scene.
pub trait SceneDraft: Send {
    /// Remove lights, cameras and other non-geometry nodes. Returns how many
    /// nodes were removed.
    fn strip_non_geometry(&mut self) -> usize;

    /// Stop and reset any embedded animation.
    fn stop_animations(&mut self);

    /// Local bounding box of the remaining geometry, `None` if there is none.
    fn extent(&self) -> Option<Aabb>;

    /// Scale every node uniformly.
    fn scale_uniform(&mut self, factor: f32);

    /// Freeze derived render state and make the scene shareable.
    fn freeze(self: Box<Self>) -> SharedScene;
}

/// An immutable, instantiable asset owned by the rendering engine.
pub trait SceneAsset: Send + Sync {
    /// Local bounds after processing.
    fn bounds(&self) -> Aabb;

    /// Create a lightweight instance named `name`.
    fn instantiate(&self, name: &str) -> Box<dyn SceneInstance>;

    /// Release engine resources. Called once by the cache on reclaim.
    fn dispose(&self);
}

impl fmt::Debug for dyn SceneAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneAsset")
            .field("bounds", &self.bounds())
            .finish()
    }
}

/// One placement of a [`SceneAsset`] in the scene graph.
pub trait SceneInstance: Send {
    fn set_transform(&mut self, transform: &Transform);

    /// World-space bounds of the whole instance hierarchy.
    fn world_bounds(&self) -> Aabb;

    fn set_visible(&mut self, visible: bool);

    fn is_visible(&self) -> bool;

    /// Remove the instance from the scene.
    fn dispose(&mut self);
}
