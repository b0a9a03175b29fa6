//! Scripted scene backend for exercising dispatch and conversion

use super::{
    HitCollector, OverlapCollector, Penetration, QueryRequest, RawHit, RawHits, RawOverlap, RawOverlaps,
    SceneBackend, ShapeData, ShapeMesh, Triangle3,
};
use crate::filter::{CollisionChannel, FilterData, FilterFlags, HitType, ResponseContainer};
use crate::identity::{ActorId, ComponentId, ShapeId, ShapeIdentity};
use crate::math::{Transform, Vec3};
use crate::shape::{GeometryHandle, ShapeKind};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Backend answering every query from a fixed script
#[derive(Default)]
pub struct ScriptedScene {
    pub hits: Vec<RawHit>,
    pub overlaps: Vec<RawOverlap>,
    pub shapes: HashMap<ShapeId, ShapeData>,
    pub penetrations: HashMap<ShapeId, Penetration>,
    /// Smallest inflation at which `penetrations` starts answering
    pub penetration_min_inflation: f32,
    pub triangles: HashMap<ShapeId, Vec<Triangle3>>,
    pub closest: HashMap<ShapeId, Vec3>,
    pub bounds: HashMap<ShapeId, Vec3>,
    pub height_field_normals: HashMap<ShapeId, Vec3>,
    /// Max distance of every raycast and sweep received
    pub queried_lengths: Mutex<Vec<f32>>,
}

impl ScriptedScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a blocking world-static shape owned by `component`
    pub fn with_shape(mut self, shape: u64, kind: ShapeKind, component: u64) -> Self {
        self.shapes.insert(ShapeId(shape), shape_data(kind, component));
        self
    }

    pub fn with_hit(mut self, shape: u64, distance: f32, hit_type: HitType) -> Self {
        self.hits.push(raw_hit(shape, distance, hit_type));
        self
    }

    pub fn with_overlap(mut self, shape: u64, hit_type: HitType) -> Self {
        self.overlaps.push(RawOverlap {
            shape: ShapeId(shape),
            hit_type,
        });
        self
    }

    fn scripted_hits(&self, max_distance: f32, request: &QueryRequest<'_>) -> RawHits {
        self.queried_lengths.lock().push(max_distance);
        let mut collector = HitCollector::new(request.mode, request.buffer_size);
        for hit in self.hits.iter().filter(|h| h.distance <= max_distance) {
            let mut hit = hit.clone();
            if request.callback.ignore_touches && hit.hit_type == HitType::Touch {
                continue;
            }
            if request.post_filter {
                hit.hit_type = request.callback.post_filter(hit.hit_type, hit.initial_overlap);
            }
            if !collector.push(hit) {
                break;
            }
        }
        collector.finish()
    }

    fn inflation_of(geometry: &GeometryHandle) -> f32 {
        match geometry.geometry() {
            crate::shape::QueryGeometry::Sphere { radius } => *radius,
            crate::shape::QueryGeometry::Capsule { radius, .. } => *radius,
            crate::shape::QueryGeometry::Box { half_extents } => half_extents.min(),
            crate::shape::QueryGeometry::Convex { .. } => f32::MAX,
        }
    }
}

/// Raw hit on `shape` at `distance` with an upward normal
pub fn raw_hit(shape: u64, distance: f32, hit_type: HitType) -> RawHit {
    RawHit {
        shape: ShapeId(shape),
        distance,
        position: Vec3::new(0.0, 0.0, distance),
        normal: Vec3::z(),
        face_index: None,
        initial_overlap: false,
        penetration_depth: 0.0,
        hit_type,
    }
}

/// Shape data for a blocking world-static shape
pub fn shape_data(kind: ShapeKind, component: u64) -> ShapeData {
    ShapeData {
        identity: ShapeIdentity {
            actor: ActorId(component),
            component: ComponentId(component),
            ..Default::default()
        },
        query_filter: FilterData::shape(
            CollisionChannel::WorldStatic,
            &ResponseContainer::default(),
            0,
            FilterFlags::SIMPLE_COLLISION,
        ),
        kind,
        pose: Transform::identity(),
        mesh: ShapeMesh::None,
    }
}

impl SceneBackend for ScriptedScene {
    fn raycast(&self, _origin: &Vec3, _dir: &Vec3, max_distance: f32, request: &QueryRequest<'_>) -> RawHits {
        self.scripted_hits(max_distance, request)
    }

    fn sweep(
        &self,
        _geometry: &GeometryHandle,
        _origin: &Vec3,
        _dir: &Vec3,
        max_distance: f32,
        request: &QueryRequest<'_>,
    ) -> RawHits {
        self.scripted_hits(max_distance, request)
    }

    fn overlap(&self, _geometry: &GeometryHandle, _position: &Vec3, request: &QueryRequest<'_>) -> RawOverlaps {
        let mut collector = OverlapCollector::new(request.mode, request.buffer_size);
        for overlap in &self.overlaps {
            if request.callback.ignore_touches && overlap.hit_type == HitType::Touch {
                continue;
            }
            if !collector.push(overlap.clone()) {
                break;
            }
        }
        collector.finish()
    }

    fn shape_data(&self, shape: ShapeId) -> Option<ShapeData> {
        self.shapes.get(&shape).cloned()
    }

    fn penetration(&self, shape: ShapeId, geometry: &GeometryHandle, _position: &Vec3) -> Option<Penetration> {
        if Self::inflation_of(geometry) < self.penetration_min_inflation {
            return None;
        }
        self.penetrations.get(&shape).copied()
    }

    fn overlapping_triangles(
        &self,
        shape: ShapeId,
        _geometry: &GeometryHandle,
        _position: &Vec3,
        max: usize,
    ) -> Vec<Triangle3> {
        self.triangles
            .get(&shape)
            .map(|t| t.iter().take(max).copied().collect())
            .unwrap_or_default()
    }

    fn closest_point(&self, shape: ShapeId, _point: &Vec3) -> Option<Vec3> {
        self.closest.get(&shape).copied()
    }

    fn bounds_center(&self, shape: ShapeId) -> Option<Vec3> {
        self.bounds.get(&shape).copied()
    }

    fn height_field_face_normal(&self, shape: ShapeId, _face_index: u32, _near: &Vec3) -> Option<Vec3> {
        self.height_field_normals.get(&shape).copied()
    }
}
