//! Body templates: the shared, read-only shape source of body instances

use crate::material::MaterialId;
use crate::math::{Quat, Vec3};
use crate::shape::{ConvexHull, ShapeKind};
use rapier3d::na::{DMatrix, Point3};
use rapier3d::prelude::SharedShape;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Sphere element of an aggregate geometry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SphereElem {
    pub center: Vec3,
    pub radius: f32,
}

/// Box element of an aggregate geometry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxElem {
    pub center: Vec3,
    pub rotation: Quat,
    pub half_extents: Vec3,
}

/// Z-aligned capsule element; `length` is the distance between the cap centers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapsuleElem {
    pub center: Vec3,
    pub rotation: Quat,
    pub radius: f32,
    pub length: f32,
}

/// Convex element with its pre-built mirrored variant
#[derive(Debug, Clone)]
pub struct ConvexElem {
    pub center: Vec3,
    pub rotation: Quat,
    pub hull: Arc<ConvexHull>,
    pub mirrored: Option<Arc<ConvexHull>>,
}

impl ConvexElem {
    /// Build from a point cloud, with or without the mirrored variant
    pub fn from_points(points: &[Vec3], build_mirrored: bool) -> Option<Self> {
        let hull = ConvexHull::from_points(points)?;
        let mirrored = if build_mirrored {
            hull.mirrored().map(Arc::new)
        } else {
            None
        };
        Some(Self {
            center: Vec3::zeros(),
            rotation: Quat::identity(),
            hull: Arc::new(hull),
            mirrored,
        })
    }

    /// Hull to instantiate for a scale whose sign product is `determinant`
    pub fn hull_for(&self, determinant: f32) -> Option<&Arc<ConvexHull>> {
        if determinant < 0.0 {
            self.mirrored.as_ref()
        } else {
            Some(&self.hull)
        }
    }
}

/// Simple collision primitives of a body template
#[derive(Debug, Clone, Default)]
pub struct AggregateGeom {
    pub spheres: Vec<SphereElem>,
    pub boxes: Vec<BoxElem>,
    pub capsules: Vec<CapsuleElem>,
    pub convexes: Vec<ConvexElem>,
}

impl AggregateGeom {
    pub fn element_count(&self) -> usize {
        self.spheres.len() + self.boxes.len() + self.capsules.len() + self.convexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.element_count() == 0
    }

    pub fn with_sphere(mut self, center: Vec3, radius: f32) -> Self {
        self.spheres.push(SphereElem { center, radius });
        self
    }

    pub fn with_box(mut self, center: Vec3, half_extents: Vec3) -> Self {
        self.boxes.push(BoxElem {
            center,
            rotation: Quat::identity(),
            half_extents,
        });
        self
    }

    pub fn with_capsule(mut self, center: Vec3, radius: f32, length: f32) -> Self {
        self.capsules.push(CapsuleElem {
            center,
            rotation: Quat::identity(),
            radius,
            length,
        });
        self
    }

    pub fn with_convex(mut self, elem: ConvexElem) -> Self {
        self.convexes.push(elem);
        self
    }
}

/// Index buffer of a triangle mesh
#[derive(Debug, Clone, PartialEq)]
pub enum MeshIndices {
    U16(Vec<[u16; 3]>),
    U32(Vec<[u32; 3]>),
}

impl MeshIndices {
    pub fn len(&self) -> usize {
        match self {
            Self::U16(tris) => tris.len(),
            Self::U32(tris) => tris.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vertex indices of triangle `index`, widened to 32 bits
    pub fn triangle(&self, index: usize) -> Option<[u32; 3]> {
        match self {
            Self::U16(tris) => tris
                .get(index)
                .map(|t| [t[0] as u32, t[1] as u32, t[2] as u32]),
            Self::U32(tris) => tris.get(index).copied(),
        }
    }

    fn to_u32(&self) -> Vec<[u32; 3]> {
        (0..self.len()).filter_map(|i| self.triangle(i)).collect()
    }

    fn flipped(&self) -> Self {
        match self {
            Self::U16(tris) => Self::U16(tris.iter().map(|t| [t[0], t[2], t[1]]).collect()),
            Self::U32(tris) => Self::U32(tris.iter().map(|t| [t[0], t[2], t[1]]).collect()),
        }
    }
}

/// Triangle mesh collision data
#[derive(Debug, Clone)]
pub struct TriMeshData {
    pub vertices: Vec<Vec3>,
    pub indices: MeshIndices,
    /// Material slot per triangle
    pub material_indices: Option<Arc<[u16]>>,
}

impl TriMeshData {
    pub fn new(vertices: Vec<Vec3>, indices: MeshIndices) -> Self {
        Self {
            vertices,
            indices,
            material_indices: None,
        }
    }

    pub fn with_material_indices(mut self, slots: Vec<u16>) -> Self {
        self.material_indices = Some(Arc::from(slots));
        self
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    /// Local-space corners of triangle `index`
    pub fn triangle_vertices(&self, index: usize) -> Option<[Vec3; 3]> {
        let [a, b, c] = self.indices.triangle(index)?;
        Some([
            *self.vertices.get(a as usize)?,
            *self.vertices.get(b as usize)?,
            *self.vertices.get(c as usize)?,
        ])
    }

    /// Mesh mirrored across the local YZ plane with winding flipped to keep faces outward
    pub fn mirrored(&self) -> Self {
        Self {
            vertices: self.vertices.iter().map(|v| Vec3::new(-v.x, v.y, v.z)).collect(),
            indices: self.indices.flipped(),
            material_indices: self.material_indices.clone(),
        }
    }

    /// Backend mesh with `scale` baked into the vertices
    pub fn to_shared_shape(&self, scale: &Vec3) -> Option<SharedShape> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return None;
        }
        let points: Vec<Point3<f32>> = self
            .vertices
            .iter()
            .map(|v| Point3::from(v.component_mul(scale)))
            .collect();
        Some(SharedShape::trimesh(points, self.indices.to_u32()))
    }
}

/// Regular grid of heights, engine Z up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeightFieldData {
    pub rows: usize,
    pub columns: usize,
    /// Row-major heights
    pub heights: Vec<f32>,
    /// Total extent along X and Y, and height multiplier
    pub scale: Vec3,
}

impl HeightFieldData {
    pub fn flat(rows: usize, columns: usize, scale: Vec3) -> Self {
        Self {
            rows,
            columns,
            heights: vec![0.0; rows * columns],
            scale,
        }
    }

    /// Backend height field (backend up axis is Y; the shape's local pose supplies the remap)
    pub fn to_shared_shape(&self) -> Option<SharedShape> {
        if self.rows < 2 || self.columns < 2 || self.heights.len() != self.rows * self.columns {
            return None;
        }
        let heights = DMatrix::from_row_slice(self.rows, self.columns, &self.heights);
        Some(SharedShape::heightfield(
            heights,
            rapier3d::na::Vector3::new(self.scale.x, self.scale.z, self.scale.y),
        ))
    }
}

/// How simple and complex collision are used for queries and simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CollisionTraceFlag {
    /// Simple shapes simulate and answer simple queries; the mesh answers complex queries
    #[default]
    UseDefault,
    UseSimpleAndComplex,
    /// Simple shapes also answer complex queries
    UseSimpleAsComplex,
    /// The mesh also answers simple queries and simulates
    UseComplexAsSimple,
}

/// Shared shape template of one or more body instances
#[derive(Debug, Clone)]
pub struct BodySetup {
    pub agg_geom: AggregateGeom,
    pub tri_mesh: Option<Arc<TriMeshData>>,
    /// Pre-built mirrored triangle mesh
    pub mirrored_tri_mesh: Option<Arc<TriMeshData>>,
    pub height_field: Option<Arc<HeightFieldData>>,
    pub collision_trace_flag: CollisionTraceFlag,
    pub generate_non_mirrored_collision: bool,
    pub generate_mirrored_collision: bool,
    pub double_sided_geometry: bool,
    pub default_material: Option<MaterialId>,
    pub bone_name: Option<Arc<str>>,
}

impl Default for BodySetup {
    fn default() -> Self {
        Self {
            agg_geom: AggregateGeom::default(),
            tri_mesh: None,
            mirrored_tri_mesh: None,
            height_field: None,
            collision_trace_flag: CollisionTraceFlag::UseDefault,
            generate_non_mirrored_collision: true,
            generate_mirrored_collision: true,
            double_sided_geometry: false,
            default_material: None,
            bone_name: None,
        }
    }
}

impl BodySetup {
    /// Template with only simple collision
    pub fn from_geom(agg_geom: AggregateGeom) -> Self {
        Self {
            agg_geom,
            ..Default::default()
        }
    }

    /// Template with a triangle mesh, building the mirrored variant when requested
    pub fn with_tri_mesh(mut self, mesh: TriMeshData) -> Self {
        if self.generate_mirrored_collision {
            self.mirrored_tri_mesh = Some(Arc::new(mesh.mirrored()));
        }
        self.tri_mesh = Some(Arc::new(mesh));
        self
    }

    pub fn with_height_field(mut self, height_field: HeightFieldData) -> Self {
        self.height_field = Some(Arc::new(height_field));
        self
    }

    pub fn with_trace_flag(mut self, flag: CollisionTraceFlag) -> Self {
        self.collision_trace_flag = flag;
        self
    }

    pub fn with_bone_name(mut self, bone: &str) -> Self {
        self.bone_name = Some(Arc::from(bone));
        self
    }

    /// Whether a transform with this scale determinant can be instantiated
    pub fn supports_determinant(&self, determinant: f32) -> bool {
        if determinant < 0.0 {
            self.generate_mirrored_collision
        } else {
            self.generate_non_mirrored_collision
        }
    }

    /// Triangle mesh variant for a scale determinant
    pub fn tri_mesh_for(&self, determinant: f32) -> Option<&Arc<TriMeshData>> {
        if determinant < 0.0 {
            self.mirrored_tri_mesh.as_ref()
        } else {
            self.tri_mesh.as_ref()
        }
    }

    /// Kinds of shapes this template instantiates
    pub fn shape_kinds(&self) -> Vec<ShapeKind> {
        let mut kinds = Vec::new();
        if !self.agg_geom.spheres.is_empty() {
            kinds.push(ShapeKind::Sphere);
        }
        if !self.agg_geom.boxes.is_empty() {
            kinds.push(ShapeKind::Box);
        }
        if !self.agg_geom.capsules.is_empty() {
            kinds.push(ShapeKind::Capsule);
        }
        if !self.agg_geom.convexes.is_empty() {
            kinds.push(ShapeKind::Convex);
        }
        if self.tri_mesh.is_some() {
            kinds.push(ShapeKind::TriMesh);
        }
        if self.height_field.is_some() {
            kinds.push(ShapeKind::HeightField);
        }
        kinds
    }

    pub fn has_geometry(&self) -> bool {
        !self.agg_geom.is_empty() || self.tri_mesh.is_some() || self.height_field.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn quad() -> TriMeshData {
        TriMeshData::new(
            vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            MeshIndices::U16(vec![[0, 1, 2], [0, 2, 3]]),
        )
    }

    #[test]
    fn test_index_widths_agree() {
        let narrow = MeshIndices::U16(vec![[0, 1, 2]]);
        let wide = MeshIndices::U32(vec![[0, 1, 2]]);
        assert_eq!(narrow.triangle(0), wide.triangle(0));
        assert_eq!(narrow.triangle(1), None);
    }

    #[test]
    fn test_mirrored_mesh_keeps_outward_winding() {
        let mesh = quad();
        let normal = |m: &TriMeshData| {
            let [a, b, c] = m.triangle_vertices(0).unwrap();
            (b - a).cross(&(c - a)).normalize()
        };
        let original = normal(&mesh);
        let mirrored = normal(&mesh.mirrored());
        // mirroring in X and flipping the winding leaves a Z-facing quad facing Z
        assert_relative_eq!(original, mirrored, epsilon = 1e-6);
        assert_relative_eq!(mesh.mirrored().vertices[1].x, -1.0);
    }

    #[test]
    fn test_mirroring_support() {
        let mut setup = BodySetup::from_geom(AggregateGeom::default().with_sphere(Vec3::zeros(), 1.0));
        assert!(setup.supports_determinant(1.0));
        setup.generate_mirrored_collision = false;
        assert!(!setup.supports_determinant(-1.0));
        assert_eq!(setup.shape_kinds(), vec![ShapeKind::Sphere]);
    }
}
