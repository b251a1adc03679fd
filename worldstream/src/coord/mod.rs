//! Geometry primitives shared by the streaming engine.
//!
//! World space is right-handed with Y up; regions are laid out on the XZ
//! plane. Vectors and rotations come from `glam`, everything here is plain
//! data that serializes with the ledger records and region snapshots.

use glam::{Affine3A, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Tolerance used by containment tests to absorb float rounding on faces.
pub const CONTAINMENT_EPSILON: f32 = 1e-4;

/// Placement of an item in world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    /// Create a translation-only transform.
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Set a uniform scale.
    pub fn with_uniform_scale(mut self, scale: f32) -> Self {
        self.scale = Vec3::splat(scale);
        self
    }

    /// Set the rotation.
    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Largest scale component, used for load priority and LOD.
    pub fn max_scale(&self) -> f32 {
        self.scale.max_element()
    }

    /// Whether the transform can be applied to a scene instance.
    ///
    /// Ledger data is untrusted: every component must be finite, the
    /// rotation must be normalizable and every scale axis strictly positive.
    pub fn is_valid(&self) -> bool {
        self.position.is_finite()
            && self.rotation.is_finite()
            && self.rotation.length_squared() > f32::EPSILON
            && self.scale.is_finite()
            && self.scale.min_element() > 0.0
    }

    /// Affine matrix for this transform.
    pub fn to_affine(&self) -> Affine3A {
        Affine3A::from_scale_rotation_translation(
            self.scale,
            self.rotation.normalize(),
            self.position,
        )
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
        }
    }

    /// Box centered on `center` with the given half extents.
    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self::new(center - half_extents, center + half_extents)
    }

    /// Smallest box containing all points, `None` for an empty iterator.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(min, max), p| (min.min(p), max.max(p)));
        Some(Self { min, max })
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// The eight corners of the box.
    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// World-space box of this local box after applying `transform`.
    pub fn transformed(&self, transform: &Transform) -> Self {
        let affine = transform.to_affine();
        let corners = self.corners().map(|c| affine.transform_point3(c));
        // Eight corners, never empty.
        Self::from_points(corners).unwrap_or(*self)
    }

    /// Union of two boxes.
    pub fn union(&self, other: &Aabb) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Whether `other` lies entirely inside this box.
    pub fn contains(&self, other: &Aabb) -> bool {
        other.min.cmpge(self.min - CONTAINMENT_EPSILON).all()
            && other.max.cmple(self.max + CONTAINMENT_EPSILON).all()
    }

    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }
}

/// Boundary volume of a region, relative to the region origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum BoundaryShape {
    /// Axis-aligned box centered on the origin.
    Box { half_extents: Vec3 },
    /// Sphere centered on the origin.
    Sphere { radius: f32 },
}

impl BoundaryShape {
    /// Exact containment of world-space `bounds` in this boundary placed at `origin`.
    pub fn contains(&self, origin: Vec3, bounds: &Aabb) -> bool {
        if !bounds.is_finite() {
            return false;
        }
        match *self {
            BoundaryShape::Box { half_extents } => {
                Aabb::from_center_half_extents(origin, half_extents).contains(bounds)
            }
            BoundaryShape::Sphere { radius } => {
                let limit = radius + CONTAINMENT_EPSILON;
                bounds
                    .corners()
                    .iter()
                    .all(|corner| corner.distance_squared(origin) <= limit * limit)
            }
        }
    }

    /// Radius of the smallest origin-centered sphere enclosing the boundary.
    pub fn bounding_radius(&self) -> f32 {
        match *self {
            BoundaryShape::Box { half_extents } => half_extents.length(),
            BoundaryShape::Sphere { radius } => radius,
        }
    }
}

/// Horizontal (XZ plane) distance between two points.
pub fn ground_distance(a: Vec3, b: Vec3) -> f32 {
    let dx = a.x - b.x;
    let dz = a.z - b.z;
    (dx * dx + dz * dz).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_4;

    fn unit_box() -> Aabb {
        Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5))
    }

    #[test]
    fn test_transform_validity() {
        assert!(Transform::default().is_valid());
        assert!(!Transform::default().with_uniform_scale(0.0).is_valid());
        assert!(!Transform::from_position(Vec3::new(f32::NAN, 0.0, 0.0)).is_valid());

        let degenerate = Transform {
            rotation: Quat::from_xyzw(0.0, 0.0, 0.0, 0.0),
            ..Transform::default()
        };
        assert!(!degenerate.is_valid());
    }

    #[test]
    fn test_aabb_transformed_translation_and_scale() {
        let transform = Transform::from_position(Vec3::new(10.0, 0.0, 5.0)).with_uniform_scale(2.0);
        let world = unit_box().transformed(&transform);
        assert!((world.min - Vec3::new(9.0, -1.0, 4.0)).length() < 1e-5);
        assert!((world.max - Vec3::new(11.0, 1.0, 6.0)).length() < 1e-5);
    }

    #[test]
    fn test_aabb_transformed_rotation_grows_box() {
        let transform = Transform::default().with_rotation(Quat::from_rotation_y(FRAC_PI_4));
        let world = unit_box().transformed(&transform);
        let expected = 0.5f32 * 2.0f32.sqrt();
        assert!((world.max.x - expected).abs() < 1e-4);
        assert!((world.max.y - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_aabb_contains() {
        let outer = Aabb::new(Vec3::ZERO, Vec3::splat(10.0));
        assert!(outer.contains(&Aabb::new(Vec3::ONE, Vec3::splat(9.0))));
        assert!(outer.contains(&outer));
        assert!(!outer.contains(&Aabb::new(Vec3::ONE, Vec3::splat(10.5))));
    }

    #[test]
    fn test_box_boundary_contains() {
        let shape = BoundaryShape::Box {
            half_extents: Vec3::new(50.0, 100.0, 50.0),
        };
        let origin = Vec3::new(100.0, 0.0, 100.0);
        let inside = Aabb::from_center_half_extents(Vec3::new(120.0, 0.0, 90.0), Vec3::ONE);
        let crossing = Aabb::from_center_half_extents(Vec3::new(149.5, 0.0, 100.0), Vec3::ONE);
        assert!(shape.contains(origin, &inside));
        assert!(!shape.contains(origin, &crossing));
    }

    #[test]
    fn test_sphere_boundary_uses_corners() {
        let shape = BoundaryShape::Sphere { radius: 10.0 };
        // Center is inside but the corner reaches sqrt(3) * 6 > 10.
        let corner_out = Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(6.0));
        let inside = Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(5.0));
        assert!(!shape.contains(Vec3::ZERO, &corner_out));
        assert!(shape.contains(Vec3::ZERO, &inside));
    }

    #[test]
    fn test_non_finite_bounds_never_contained() {
        let shape = BoundaryShape::Sphere { radius: 1000.0 };
        let bad = Aabb {
            min: Vec3::splat(f32::NAN),
            max: Vec3::ONE,
        };
        assert!(!shape.contains(Vec3::ZERO, &bad));
    }

    #[test]
    fn test_ground_distance_ignores_height() {
        let d = ground_distance(Vec3::new(0.0, 100.0, 0.0), Vec3::new(3.0, -50.0, 4.0));
        assert!((d - 5.0).abs() < 1e-6);
    }
}
