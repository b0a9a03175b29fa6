//! Collision shapes and their backend query geometry
//!
//! `CollisionShape` is the engine-side description used as query input.
//! `adapt_shape` turns it plus a rotation into a `GeometryHandle`: the
//! backend geometry and the backend pose rotation. The backend's capsule
//! axis is Y while the engine's up axis is Z, so every capsule crossing the
//! boundary goes through [`to_backend_capsule_rotation`] or its inverse.

use crate::math::{is_nearly_zero, to_point, Quat, Vec3, KINDA_SMALL_NUMBER};
use rapier3d::na::{Isometry3, Point3, Translation3};
use rapier3d::parry::transformation::convex_hull;
use rapier3d::prelude::SharedShape;
use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_PI_2;
use std::fmt;
use std::sync::Arc;

/// Smallest radius a query sphere is given
pub const MIN_SPHERE_RADIUS: f32 = KINDA_SMALL_NUMBER;

/// Planes whose distance to a point differs by less than this are ties
const FACE_DISTANCE_TOLERANCE: f32 = 0.01;

/// Engine-side query shape
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CollisionShape {
    /// Zero-extent trace
    Line,
    Sphere { radius: f32 },
    Box { half_extents: Vec3 },
    /// Z-aligned capsule; `half_height` includes the hemispherical caps
    Capsule { radius: f32, half_height: f32 },
}

impl Default for CollisionShape {
    fn default() -> Self {
        Self::Line
    }
}

impl CollisionShape {
    pub fn sphere(radius: f32) -> Self {
        Self::Sphere { radius }
    }

    pub fn cuboid(hx: f32, hy: f32, hz: f32) -> Self {
        Self::Box {
            half_extents: Vec3::new(hx, hy, hz),
        }
    }

    pub fn capsule(radius: f32, half_height: f32) -> Self {
        Self::Capsule { radius, half_height }
    }

    /// True when the shape has no usable extent
    pub fn is_nearly_zero(&self) -> bool {
        match self {
            Self::Line => true,
            Self::Sphere { radius } => *radius <= KINDA_SMALL_NUMBER,
            Self::Box { half_extents } => is_nearly_zero(half_extents, KINDA_SMALL_NUMBER),
            Self::Capsule { radius, .. } => *radius <= KINDA_SMALL_NUMBER,
        }
    }

    pub fn is_line(&self) -> bool {
        matches!(self, Self::Line)
    }

    /// Half distance between the capsule's cap centers
    pub fn capsule_axis_half_length(&self) -> f32 {
        match self {
            Self::Capsule { radius, half_height } => (half_height - radius).max(KINDA_SMALL_NUMBER),
            _ => 0.0,
        }
    }

    /// Same shape grown by `amount` in every direction
    pub fn inflated(&self, amount: f32) -> Self {
        match *self {
            Self::Line => Self::Sphere { radius: amount },
            Self::Sphere { radius } => Self::Sphere {
                radius: radius + amount,
            },
            Self::Box { half_extents } => Self::Box {
                half_extents: half_extents.add_scalar(amount),
            },
            Self::Capsule { radius, half_height } => Self::Capsule {
                radius: radius + amount,
                half_height: half_height + amount,
            },
        }
    }
}

/// Kind of a shape hosted by a scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeKind {
    Sphere,
    Box,
    Capsule,
    Convex,
    TriMesh,
    HeightField,
}

impl ShapeKind {
    /// Whether query geometry of this kind can be inflated for MTD probing
    pub fn can_inflate(self) -> bool {
        matches!(self, Self::Sphere | Self::Box | Self::Capsule)
    }
}

/// Plane of a hull face in hull-local space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HullPlane {
    pub normal: Vec3,
    pub offset: f32,
}

impl HullPlane {
    /// Signed distance of `point` to the plane
    #[inline]
    pub fn distance(&self, point: &Vec3) -> f32 {
        self.normal.dot(point) - self.offset
    }
}

/// Convex hull with face planes, shared between body templates and query geometry
#[derive(Clone)]
pub struct ConvexHull {
    vertices: Vec<Point3<f32>>,
    indices: Vec<[u32; 3]>,
    planes: Vec<HullPlane>,
    shape: SharedShape,
}

impl fmt::Debug for ConvexHull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvexHull")
            .field("vertices", &self.vertices.len())
            .field("faces", &self.indices.len())
            .finish()
    }
}

impl ConvexHull {
    /// Build a hull from a point cloud. `None` for degenerate (flat or empty) input.
    pub fn from_points(points: &[Vec3]) -> Option<Self> {
        if !spans_volume(points) {
            return None;
        }
        let pts: Vec<Point3<f32>> = points.iter().map(to_point).collect();
        let (vertices, indices) = convex_hull(&pts);
        if indices.len() < 4 {
            return None;
        }
        let shape = SharedShape::convex_mesh(vertices.clone(), &indices)?;
        let planes = indices
            .iter()
            .filter_map(|tri| {
                let a = vertices[tri[0] as usize].coords;
                let b = vertices[tri[1] as usize].coords;
                let c = vertices[tri[2] as usize].coords;
                let normal = (b - a).cross(&(c - a)).try_normalize(1.0e-12)?;
                Some(HullPlane {
                    normal,
                    offset: normal.dot(&a),
                })
            })
            .collect();
        Some(Self {
            vertices,
            indices,
            planes,
            shape,
        })
    }

    pub fn vertices(&self) -> &[Point3<f32>] {
        &self.vertices
    }

    pub fn planes(&self) -> &[HullPlane] {
        &self.planes
    }

    /// Backend shape at unit scale
    pub fn shape(&self) -> &SharedShape {
        &self.shape
    }

    /// Backend shape with `scale` baked into the vertices
    pub fn scaled_shape(&self, scale: &Vec3) -> Option<SharedShape> {
        if (scale - Vec3::repeat(1.0)).abs().max() <= KINDA_SMALL_NUMBER {
            return Some(self.shape.clone());
        }
        let pts: Vec<Point3<f32>> = self
            .vertices
            .iter()
            .map(|p| Point3::from(p.coords.component_mul(scale)))
            .collect();
        SharedShape::convex_hull(&pts)
    }

    /// Hull mirrored across the local YZ plane
    pub fn mirrored(&self) -> Option<Self> {
        let pts: Vec<Vec3> = self
            .vertices
            .iter()
            .map(|p| Vec3::new(-p.x, p.y, p.z))
            .collect();
        Self::from_points(&pts)
    }

    /// Center of the local bounding box
    pub fn bounds_center(&self) -> Vec3 {
        let mut mins = Vec3::repeat(f32::MAX);
        let mut maxs = Vec3::repeat(f32::MIN);
        for p in &self.vertices {
            mins = mins.inf(&p.coords);
            maxs = maxs.sup(&p.coords);
        }
        (mins + maxs) * 0.5
    }

    /// Face whose plane is closest to `local_point`; among near-ties the face
    /// most opposed to `local_dir` wins.
    pub fn find_face_index(&self, local_point: &Vec3, local_dir: &Vec3) -> Option<usize> {
        let min_dist = self
            .planes
            .iter()
            .map(|p| p.distance(local_point).abs())
            .fold(f32::MAX, f32::min);
        if min_dist == f32::MAX {
            return None;
        }
        let mut best: Option<(usize, f32)> = None;
        for (index, plane) in self.planes.iter().enumerate() {
            if plane.distance(local_point).abs() - min_dist > FACE_DISTANCE_TOLERANCE {
                continue;
            }
            let dot = plane.normal.dot(local_dir);
            if best.map_or(true, |(_, best_dot)| dot < best_dot) {
                best = Some((index, dot));
            }
        }
        best.map(|(index, _)| index)
    }
}

/// True if the points are not all coplanar
fn spans_volume(points: &[Vec3]) -> bool {
    let Some(a) = points.first() else {
        return false;
    };
    let Some(b) = points
        .iter()
        .max_by(|p, q| (*p - a).norm_squared().total_cmp(&(*q - a).norm_squared()))
    else {
        return false;
    };
    let ab = b - a;
    let Some(c) = points
        .iter()
        .max_by(|p, q| {
            ab.cross(&(*p - a))
                .norm_squared()
                .total_cmp(&ab.cross(&(*q - a)).norm_squared())
        })
    else {
        return false;
    };
    let normal = ab.cross(&(c - a));
    let extent = ab.norm().max(KINDA_SMALL_NUMBER);
    if normal.norm() <= KINDA_SMALL_NUMBER * extent {
        return false;
    }
    let normal = normal.normalize();
    points
        .iter()
        .any(|p| normal.dot(&(p - a)).abs() > KINDA_SMALL_NUMBER * extent)
}

/// Backend-native query geometry
#[derive(Debug, Clone)]
pub enum QueryGeometry {
    Sphere { radius: f32 },
    Box { half_extents: Vec3 },
    /// Y-aligned backend capsule; `half_axis` is half the distance between the caps
    Capsule { radius: f32, half_axis: f32 },
    Convex { hull: Arc<ConvexHull>, scale: Vec3 },
}

impl QueryGeometry {
    pub fn kind(&self) -> ShapeKind {
        match self {
            Self::Sphere { .. } => ShapeKind::Sphere,
            Self::Box { .. } => ShapeKind::Box,
            Self::Capsule { .. } => ShapeKind::Capsule,
            Self::Convex { .. } => ShapeKind::Convex,
        }
    }

    /// Backend shape for this geometry
    pub fn to_shared_shape(&self) -> Option<SharedShape> {
        match self {
            Self::Sphere { radius } => Some(SharedShape::ball(*radius)),
            Self::Box { half_extents } => Some(SharedShape::cuboid(
                half_extents.x,
                half_extents.y,
                half_extents.z,
            )),
            Self::Capsule { radius, half_axis } => Some(SharedShape::capsule_y(*half_axis, *radius)),
            Self::Convex { hull, scale } => hull.scaled_shape(scale),
        }
    }

    /// Geometry grown by `amount`; convex geometry cannot be inflated
    pub fn inflated(&self, amount: f32) -> Option<Self> {
        match self {
            Self::Sphere { radius } => Some(Self::Sphere {
                radius: radius + amount,
            }),
            Self::Box { half_extents } => Some(Self::Box {
                half_extents: half_extents.add_scalar(amount),
            }),
            Self::Capsule { radius, half_axis } => Some(Self::Capsule {
                radius: radius + amount,
                half_axis: *half_axis,
            }),
            Self::Convex { .. } => None,
        }
    }
}

/// Backend geometry plus the backend rotation it is posed with
#[derive(Debug, Clone)]
pub struct GeometryHandle {
    geometry: QueryGeometry,
    rotation: Quat,
    shape: SharedShape,
}

impl GeometryHandle {
    /// Wrap a backend geometry; `None` if the backend cannot build it
    pub fn new(geometry: QueryGeometry, backend_rotation: Quat) -> Option<Self> {
        let shape = geometry.to_shared_shape()?;
        Some(Self {
            geometry,
            rotation: backend_rotation,
            shape,
        })
    }

    /// Convex query geometry taken from a hull at the given mesh scale
    pub fn convex(hull: Arc<ConvexHull>, scale: Vec3, rotation: Quat) -> Option<Self> {
        Self::new(QueryGeometry::Convex { hull, scale }, rotation)
    }

    pub fn geometry(&self) -> &QueryGeometry {
        &self.geometry
    }

    pub fn kind(&self) -> ShapeKind {
        self.geometry.kind()
    }

    pub fn shape(&self) -> &SharedShape {
        &self.shape
    }

    /// Rotation in backend convention
    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    /// Rotation in engine convention (capsules undo the axis remap)
    pub fn engine_rotation(&self) -> Quat {
        match self.geometry {
            QueryGeometry::Capsule { .. } => to_engine_capsule_rotation(&self.rotation),
            _ => self.rotation,
        }
    }

    /// Backend pose of the geometry centred at `position`
    pub fn pose_at(&self, position: &Vec3) -> Isometry3<f32> {
        Isometry3::from_parts(Translation3::from(*position), self.rotation)
    }

    /// Same pose, geometry grown by `amount`; `None` for convex geometry
    pub fn inflated(&self, amount: f32) -> Option<Self> {
        Self::new(self.geometry.inflated(amount)?, self.rotation)
    }
}

/// Engine capsule rotation (axis Z) to backend capsule rotation (axis Y)
#[inline]
pub fn to_backend_capsule_rotation(engine: &Quat) -> Quat {
    engine * Quat::from_axis_angle(&Vec3::x_axis(), FRAC_PI_2)
}

/// Backend capsule rotation (axis Y) to engine capsule rotation (axis Z)
#[inline]
pub fn to_engine_capsule_rotation(backend: &Quat) -> Quat {
    backend * Quat::from_axis_angle(&Vec3::x_axis(), -FRAC_PI_2)
}

/// Adapt an engine query shape and rotation to backend geometry.
///
/// Spheres ignore the rotation, boxes pass it through and capsules get the
/// axis remap. Lines and degenerate non-sphere shapes become a minimal sphere.
pub fn adapt_shape(rotation: &Quat, shape: &CollisionShape) -> GeometryHandle {
    let geometry = match *shape {
        CollisionShape::Sphere { radius } => QueryGeometry::Sphere {
            radius: radius.max(MIN_SPHERE_RADIUS),
        },
        _ if shape.is_nearly_zero() => QueryGeometry::Sphere {
            radius: MIN_SPHERE_RADIUS,
        },
        CollisionShape::Box { half_extents } => QueryGeometry::Box {
            half_extents: half_extents.map(|e| e.max(KINDA_SMALL_NUMBER)),
        },
        CollisionShape::Capsule { radius, .. } => QueryGeometry::Capsule {
            radius: radius.max(MIN_SPHERE_RADIUS),
            half_axis: shape.capsule_axis_half_length(),
        },
        CollisionShape::Line => QueryGeometry::Sphere {
            radius: MIN_SPHERE_RADIUS,
        },
    };
    let backend_rotation = match geometry {
        QueryGeometry::Sphere { .. } => Quat::identity(),
        QueryGeometry::Capsule { .. } => to_backend_capsule_rotation(rotation),
        _ => *rotation,
    };
    let shape = geometry
        .to_shared_shape()
        .unwrap_or_else(|| SharedShape::ball(MIN_SPHERE_RADIUS));
    GeometryHandle {
        geometry,
        rotation: backend_rotation,
        shape,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_cube() -> ConvexHull {
        let mut pts = Vec::new();
        for x in [-1.0, 1.0] {
            for y in [-1.0, 1.0] {
                for z in [-1.0, 1.0] {
                    pts.push(Vec3::new(x, y, z));
                }
            }
        }
        ConvexHull::from_points(&pts).unwrap()
    }

    #[test]
    fn test_capsule_rotation_roundtrip() {
        let samples = [
            Quat::identity(),
            Quat::from_euler_angles(0.3, -1.2, 2.0),
            Quat::from_axis_angle(&Vec3::z_axis(), 3.0),
            Quat::from_axis_angle(&Vec3::x_axis(), -FRAC_PI_2),
        ];
        for q in samples {
            let back = to_engine_capsule_rotation(&to_backend_capsule_rotation(&q));
            assert!(back.angle_to(&q) < 1e-4);
            let fwd = to_backend_capsule_rotation(&to_engine_capsule_rotation(&q));
            assert!(fwd.angle_to(&q) < 1e-4);
        }
    }

    #[test]
    fn test_capsule_axis_maps_to_engine_up() {
        let handle = adapt_shape(&Quat::identity(), &CollisionShape::capsule(10.0, 40.0));
        let backend_axis = handle.rotation() * Vec3::y();
        assert_relative_eq!(backend_axis, Vec3::z(), epsilon = 1e-5);
        match handle.geometry() {
            QueryGeometry::Capsule { radius, half_axis } => {
                assert_relative_eq!(*radius, 10.0);
                assert_relative_eq!(*half_axis, 30.0);
            }
            other => panic!("expected capsule, got {:?}", other),
        }
    }

    #[test]
    fn test_sphere_ignores_rotation() {
        let rot = Quat::from_axis_angle(&Vec3::y_axis(), 1.0);
        let handle = adapt_shape(&rot, &CollisionShape::sphere(5.0));
        assert_eq!(handle.rotation(), Quat::identity());
        assert_eq!(handle.kind(), ShapeKind::Sphere);
    }

    #[test]
    fn test_degenerate_shapes_become_minimal_spheres() {
        for shape in [
            CollisionShape::Line,
            CollisionShape::cuboid(0.0, 0.0, 0.0),
            CollisionShape::capsule(0.0, 10.0),
        ] {
            let handle = adapt_shape(&Quat::identity(), &shape);
            match handle.geometry() {
                QueryGeometry::Sphere { radius } => assert_relative_eq!(*radius, MIN_SPHERE_RADIUS),
                other => panic!("expected sphere, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_box_keeps_rotation() {
        let rot = Quat::from_axis_angle(&Vec3::z_axis(), 0.5);
        let handle = adapt_shape(&rot, &CollisionShape::cuboid(1.0, 2.0, 3.0));
        assert_eq!(handle.rotation(), rot);
        assert_eq!(handle.engine_rotation(), rot);
    }

    #[test]
    fn test_hull_face_lookup() {
        let hull = unit_cube();
        let face = hull
            .find_face_index(&Vec3::new(0.2, 0.1, 1.0), &Vec3::new(0.0, 0.0, -1.0))
            .unwrap();
        assert_relative_eq!(hull.planes()[face].normal, Vec3::z(), epsilon = 1e-5);

        // on an edge the face facing the incoming direction wins
        let face = hull
            .find_face_index(&Vec3::new(1.0, 0.0, 1.0), &Vec3::new(-1.0, 0.0, 0.0))
            .unwrap();
        assert_relative_eq!(hull.planes()[face].normal, Vec3::x(), epsilon = 1e-5);
    }

    #[test]
    fn test_degenerate_hull_rejected() {
        let flat = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
        ];
        assert!(ConvexHull::from_points(&flat).is_none());
        assert!(unit_cube().mirrored().is_some());
    }
}
