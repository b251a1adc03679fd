//! Bounds-only scene backend.
//!
//! Models are small JSON documents listing typed nodes:
//!
//! ```json
//! {
//!   "nodes": [
//!     { "kind": "mesh", "min": [-1, 0, -1], "max": [1, 2, 1], "triangles": 12 },
//!     { "kind": "light" },
//!     { "kind": "camera" }
//!   ],
//!   "animations": ["idle"]
//! }
//! ```
//!
//! Instances track only their transform and visibility, which is all the
//! streaming engine needs. Counters are shared through [`HeadlessCounters`]
//! so callers can observe parses, reclaims and live instances.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::{SceneAsset, SceneDraft, SceneInstance, SceneLoader, SharedScene};
use crate::asset::{AssetError, RawArtifact};
use crate::coord::{Aabb, Transform};

/// Mime type understood by [`HeadlessLoader`].
pub const HEADLESS_MODEL_MIME: &str = "model/vnd.worldstream.headless+json";

/// Node of a headless model document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelNode {
    Mesh {
        min: Vec3,
        max: Vec3,
        #[serde(default)]
        triangles: u64,
    },
    Light,
    Camera,
}

/// A headless model document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDocument {
    pub nodes: Vec<ModelNode>,
    #[serde(default)]
    pub animations: Vec<String>,
}

impl ModelDocument {
    /// A single box mesh of the given size resting on the origin.
    pub fn cuboid(size: Vec3) -> Self {
        let half = size * 0.5;
        Self {
            nodes: vec![ModelNode::Mesh {
                min: Vec3::new(-half.x, 0.0, -half.z),
                max: Vec3::new(half.x, size.y, half.z),
                triangles: 12,
            }],
            animations: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: ModelNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_animation(mut self, name: impl Into<String>) -> Self {
        self.animations.push(name.into());
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn triangle_count(&self) -> u64 {
        self.nodes
            .iter()
            .map(|n| match n {
                ModelNode::Mesh { triangles, .. } => *triangles,
                _ => 0,
            })
            .sum()
    }
}

/// Shared counters for everything a [`HeadlessLoader`] produced.
#[derive(Debug, Default)]
pub struct HeadlessCounters {
    pub parsed: AtomicU64,
    pub frozen: AtomicU64,
    pub disposed: AtomicU64,
    pub live_instances: AtomicU64,
}

impl HeadlessCounters {
    pub fn parsed(&self) -> u64 {
        self.parsed.load(Ordering::SeqCst)
    }

    pub fn frozen(&self) -> u64 {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> u64 {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn live_instances(&self) -> u64 {
        self.live_instances.load(Ordering::SeqCst)
    }
}

/// Loader for [`HEADLESS_MODEL_MIME`] documents.
#[derive(Debug, Default, Clone)]
pub struct HeadlessLoader {
    counters: Arc<HeadlessCounters>,
}

impl HeadlessLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> Arc<HeadlessCounters> {
        Arc::clone(&self.counters)
    }
}

impl SceneLoader for HeadlessLoader {
    fn supports(&self, mime: &str) -> bool {
        mime == HEADLESS_MODEL_MIME
    }

    fn parse(&self, raw: &RawArtifact) -> Result<Box<dyn SceneDraft>, AssetError> {
        let document: ModelDocument =
            serde_json::from_slice(&raw.bytes).map_err(|e| AssetError::Malformed {
                key: raw.key.clone(),
                reason: e.to_string(),
            })?;
        self.counters.parsed.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(HeadlessDraft {
            document,
            animating: true,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct HeadlessDraft {
    document: ModelDocument,
    animating: bool,
    counters: Arc<HeadlessCounters>,
}

impl SceneDraft for HeadlessDraft {
    fn strip_non_geometry(&mut self) -> usize {
        let before = self.document.nodes.len();
        self.document
            .nodes
            .retain(|n| matches!(n, ModelNode::Mesh { .. }));
        before - self.document.nodes.len()
    }

    fn stop_animations(&mut self) {
        self.animating = false;
    }

    fn extent(&self) -> Option<Aabb> {
        self.document
            .nodes
            .iter()
            .filter_map(|n| match n {
                ModelNode::Mesh { min, max, .. } => Some(Aabb::new(*min, *max)),
                _ => None,
            })
            .reduce(|a, b| a.union(&b))
    }

    fn scale_uniform(&mut self, factor: f32) {
        for node in &mut self.document.nodes {
            if let ModelNode::Mesh { min, max, .. } = node {
                *min *= factor;
                *max *= factor;
            }
        }
    }

    fn freeze(self: Box<Self>) -> SharedScene {
        self.counters.frozen.fetch_add(1, Ordering::SeqCst);
        let bounds = self
            .extent()
            .unwrap_or_else(|| Aabb::new(Vec3::ZERO, Vec3::ZERO));
        Arc::new(HeadlessAsset {
            bounds,
            triangles: self.document.triangle_count(),
            animating: self.animating,
            disposed: AtomicBool::new(false),
            counters: Arc::clone(&self.counters),
        })
    }
}

/// A frozen headless model.
#[derive(Debug)]
pub struct HeadlessAsset {
    bounds: Aabb,
    triangles: u64,
    animating: bool,
    disposed: AtomicBool,
    counters: Arc<HeadlessCounters>,
}

impl HeadlessAsset {
    pub fn triangles(&self) -> u64 {
        self.triangles
    }

    pub fn is_animating(&self) -> bool {
        self.animating
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl SceneAsset for HeadlessAsset {
    fn bounds(&self) -> Aabb {
        self.bounds
    }

    fn instantiate(&self, name: &str) -> Box<dyn SceneInstance> {
        self.counters.live_instances.fetch_add(1, Ordering::SeqCst);
        Box::new(HeadlessInstance {
            name: name.to_string(),
            local_bounds: self.bounds,
            transform: Transform::default(),
            visible: true,
            disposed: false,
            counters: Arc::clone(&self.counters),
        })
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.counters.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// One placement of a [`HeadlessAsset`].
#[derive(Debug)]
pub struct HeadlessInstance {
    name: String,
    local_bounds: Aabb,
    transform: Transform,
    visible: bool,
    disposed: bool,
    counters: Arc<HeadlessCounters>,
}

impl HeadlessInstance {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SceneInstance for HeadlessInstance {
    fn set_transform(&mut self, transform: &Transform) {
        self.transform = *transform;
    }

    fn world_bounds(&self) -> Aabb {
        self.local_bounds.transformed(&self.transform)
    }

    fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    fn is_visible(&self) -> bool {
        self.visible
    }

    fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.counters.live_instances.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for HeadlessInstance {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetKey;

    fn raw(document: &ModelDocument) -> RawArtifact {
        RawArtifact::new(AssetKey::new("col", 1), HEADLESS_MODEL_MIME, document.to_bytes())
    }

    #[test]
    fn test_supports_only_headless_mime() {
        let loader = HeadlessLoader::new();
        assert!(loader.supports(HEADLESS_MODEL_MIME));
        assert!(!loader.supports("model/gltf-binary"));
    }

    #[test]
    fn test_parse_malformed() {
        let loader = HeadlessLoader::new();
        let bad = RawArtifact::new(AssetKey::new("col", 1), HEADLESS_MODEL_MIME, b"{nope".to_vec());
        assert!(matches!(loader.parse(&bad), Err(AssetError::Malformed { .. })));
    }

    #[test]
    fn test_draft_steps() {
        let loader = HeadlessLoader::new();
        let document = ModelDocument::cuboid(Vec3::new(2.0, 4.0, 2.0))
            .with_node(ModelNode::Light)
            .with_node(ModelNode::Camera)
            .with_animation("spin");
        let mut draft = loader.parse(&raw(&document)).unwrap();

        assert_eq!(draft.strip_non_geometry(), 2);
        draft.stop_animations();
        let extent = draft.extent().unwrap();
        assert_eq!(extent.size(), Vec3::new(2.0, 4.0, 2.0));

        draft.scale_uniform(0.25);
        assert_eq!(draft.extent().unwrap().size(), Vec3::new(0.5, 1.0, 0.5));

        let asset = draft.freeze();
        assert_eq!(asset.bounds().size(), Vec3::new(0.5, 1.0, 0.5));
        assert_eq!(loader.counters().frozen(), 1);
    }

    #[test]
    fn test_instance_world_bounds_and_lifecycle() {
        let loader = HeadlessLoader::new();
        let asset = loader
            .parse(&raw(&ModelDocument::cuboid(Vec3::ONE)))
            .unwrap()
            .freeze();

        let mut instance = asset.instantiate("item-1");
        assert_eq!(loader.counters().live_instances(), 1);

        instance.set_transform(&Transform::from_position(Vec3::new(10.0, 0.0, 0.0)));
        let bounds = instance.world_bounds();
        assert!((bounds.center().x - 10.0).abs() < 1e-5);

        instance.dispose();
        instance.dispose();
        assert_eq!(loader.counters().live_instances(), 0);

        asset.dispose();
        asset.dispose();
        assert_eq!(loader.counters().disposed(), 1);
    }

    #[test]
    fn test_empty_document_has_no_extent() {
        let loader = HeadlessLoader::new();
        let document = ModelDocument::default().with_node(ModelNode::Light);
        let mut draft = loader.parse(&raw(&document)).unwrap();
        draft.strip_non_geometry();
        assert!(draft.extent().is_none());
    }
}
