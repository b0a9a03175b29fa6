//! Scene backend interface
//!
//! A backend is one logical simulation scene seen through the operations
//! the query layer needs: raycast, sweep and overlap with engine filtering
//! applied per candidate shape, plus the geometric helpers the converters
//! use to recover normals for penetrating hits.

pub mod rapier;

#[cfg(test)]
pub(crate) mod scripted;

use crate::body_setup::TriMeshData;
use crate::filter::{FilterData, HitType, QueryFilterCallback};
use crate::identity::{ShapeId, ShapeIdentity};
use crate::math::{Transform, Vec3};
use crate::shape::{ConvexHull, GeometryHandle, ShapeKind};
use std::sync::Arc;

pub use self::rapier::{ActorKind, RapierScene, ShapeContact, ShapeDesc, ShapeRecord};

/// How many results a query wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// Stop at the first blocking result
    Any,
    /// Nearest blocking result only
    Single,
    /// Touches plus the nearest block
    Multi,
}

/// Filtering and buffering options handed to a backend query
#[derive(Debug, Clone)]
pub struct QueryRequest<'a> {
    pub filter: FilterData,
    pub callback: QueryFilterCallback<'a>,
    pub mode: QueryMode,
    /// Capacity of the result buffer
    pub buffer_size: usize,
    /// Run `QueryFilterCallback::post_filter` on sweep hits
    pub post_filter: bool,
    /// Compute penetration normal and depth for sweeps that start overlapped
    pub compute_mtd: bool,
}

impl<'a> QueryRequest<'a> {
    pub fn new(filter: FilterData, callback: QueryFilterCallback<'a>, mode: QueryMode, buffer_size: usize) -> Self {
        Self {
            filter,
            callback,
            mode,
            buffer_size,
            post_filter: false,
            compute_mtd: false,
        }
    }
}

/// One backend hit, in backend terms
#[derive(Debug, Clone, PartialEq)]
pub struct RawHit {
    pub shape: ShapeId,
    /// Distance along the trace direction
    pub distance: f32,
    /// Contact point on the hit shape
    pub position: Vec3,
    /// Hit shape's surface normal, facing the query
    pub normal: Vec3,
    pub face_index: Option<u32>,
    /// The query started inside the shape
    pub initial_overlap: bool,
    /// Penetration depth reported with an initial overlap, if computed
    pub penetration_depth: f32,
    /// Filter outcome; the converters recompute the final blocking state
    pub hit_type: HitType,
}

/// One backend overlap
#[derive(Debug, Clone, PartialEq)]
pub struct RawOverlap {
    pub shape: ShapeId,
    pub hit_type: HitType,
}

/// Hits of one scene: touches plus the nearest block
#[derive(Debug, Clone, Default)]
pub struct RawHits {
    pub touches: Vec<RawHit>,
    pub block: Option<RawHit>,
    /// More results existed than the buffer could hold
    pub overflowed: bool,
}

impl RawHits {
    pub fn is_empty(&self) -> bool {
        self.touches.is_empty() && self.block.is_none()
    }

    pub fn has_block(&self) -> bool {
        self.block.is_some()
    }

    /// Touches followed by the block
    pub fn iter(&self) -> impl Iterator<Item = &RawHit> {
        self.touches.iter().chain(self.block.iter())
    }
}

/// Overlaps of one scene
#[derive(Debug, Clone, Default)]
pub struct RawOverlaps {
    pub overlaps: Vec<RawOverlap>,
    pub overflowed: bool,
}

impl RawOverlaps {
    pub fn is_empty(&self) -> bool {
        self.overlaps.is_empty()
    }
}

/// Mesh data a shape was built from, for face normal lookups
#[derive(Debug, Clone)]
pub enum ShapeMesh {
    None,
    Convex { hull: Arc<ConvexHull>, scale: Vec3 },
    TriMesh {
        mesh: Arc<TriMeshData>,
        scale: Vec3,
        double_sided: bool,
    },
}

/// Everything the converters need to know about a hit shape
#[derive(Debug, Clone)]
pub struct ShapeData {
    pub identity: ShapeIdentity,
    pub query_filter: FilterData,
    pub kind: ShapeKind,
    /// World pose of the shape; scale is the mesh scale for convex and triangle meshes
    pub pose: Transform,
    pub mesh: ShapeMesh,
}

/// Minimum translation to separate a query geometry from a shape
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Penetration {
    /// Direction to push the query geometry out of the shape
    pub normal: Vec3,
    pub depth: f32,
}

/// World-space triangle
pub type Triangle3 = [Vec3; 3];

/// One logical simulation scene as seen by the query layer
pub trait SceneBackend: Send + Sync {
    /// Cast a ray along unit direction `dir`
    fn raycast(&self, origin: &Vec3, dir: &Vec3, max_distance: f32, request: &QueryRequest<'_>) -> RawHits;

    /// Sweep `geometry` from `origin` along unit direction `dir`
    fn sweep(
        &self,
        geometry: &GeometryHandle,
        origin: &Vec3,
        dir: &Vec3,
        max_distance: f32,
        request: &QueryRequest<'_>,
    ) -> RawHits;

    /// Shapes overlapping `geometry` centred at `position`
    fn overlap(&self, geometry: &GeometryHandle, position: &Vec3, request: &QueryRequest<'_>) -> RawOverlaps;

    /// Identity, filter and mesh data of a shape
    fn shape_data(&self, shape: ShapeId) -> Option<ShapeData>;

    /// Minimum translation pushing `geometry` at `position` out of `shape`
    fn penetration(&self, shape: ShapeId, geometry: &GeometryHandle, position: &Vec3) -> Option<Penetration>;

    /// Up to `max` triangles of a mesh or height field overlapping `geometry`
    fn overlapping_triangles(
        &self,
        shape: ShapeId,
        geometry: &GeometryHandle,
        position: &Vec3,
        max: usize,
    ) -> Vec<Triangle3>;

    /// Closest point on `shape` to `point`; `point` itself when inside
    fn closest_point(&self, shape: ShapeId, point: &Vec3) -> Option<Vec3>;

    /// Center of the shape's world bounds
    fn bounds_center(&self, shape: ShapeId) -> Option<Vec3>;

    /// Geometric normal of height field triangle `face_index`; the triangle
    /// under `near` when the index names none
    fn height_field_face_normal(&self, shape: ShapeId, face_index: u32, near: &Vec3) -> Option<Vec3>;
}

/// Collects filtered hits according to a `QueryMode`
#[derive(Debug)]
pub struct HitCollector {
    mode: QueryMode,
    capacity: usize,
    touches: Vec<RawHit>,
    block: Option<RawHit>,
}

impl HitCollector {
    pub fn new(mode: QueryMode, capacity: usize) -> Self {
        Self {
            mode,
            capacity: capacity.max(1),
            touches: Vec::new(),
            block: None,
        }
    }

    /// Offer a candidate; returns false once the query can stop
    pub fn push(&mut self, hit: RawHit) -> bool {
        match hit.hit_type {
            HitType::Ignore => true,
            HitType::Block => {
                if self.block.as_ref().map_or(true, |b| hit.distance < b.distance) {
                    self.block = Some(hit);
                }
                self.mode != QueryMode::Any
            }
            HitType::Touch => {
                if self.mode == QueryMode::Multi {
                    self.touches.push(hit);
                }
                true
            }
        }
    }

    /// Nearest touches that fit the buffer, dropping touches behind the block
    pub fn finish(mut self) -> RawHits {
        if let Some(block) = &self.block {
            let limit = block.distance;
            self.touches.retain(|t| t.distance <= limit);
        }
        self.touches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        let room = if self.block.is_some() {
            self.capacity.saturating_sub(1)
        } else {
            self.capacity
        };
        let overflowed = self.touches.len() > room;
        self.touches.truncate(room);
        RawHits {
            touches: self.touches,
            block: self.block,
            overflowed,
        }
    }
}

/// Collects filtered overlaps according to a `QueryMode`
#[derive(Debug)]
pub struct OverlapCollector {
    mode: QueryMode,
    capacity: usize,
    overlaps: Vec<RawOverlap>,
    overflowed: bool,
}

impl OverlapCollector {
    pub fn new(mode: QueryMode, capacity: usize) -> Self {
        Self {
            mode,
            capacity: capacity.max(1),
            overlaps: Vec::new(),
            overflowed: false,
        }
    }

    /// Offer a candidate; returns false once the query can stop
    pub fn push(&mut self, overlap: RawOverlap) -> bool {
        if overlap.hit_type == HitType::Ignore {
            return true;
        }
        if self.overlaps.len() >= self.capacity {
            self.overflowed = true;
            return false;
        }
        self.overlaps.push(overlap);
        self.mode == QueryMode::Multi
    }

    pub fn finish(self) -> RawOverlaps {
        RawOverlaps {
            overlaps: self.overlaps,
            overflowed: self.overflowed,
        }
    }
}
