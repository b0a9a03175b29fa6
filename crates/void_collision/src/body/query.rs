//! Queries against the shapes of one body
//!
//! These bypass the scene's filtering: every shape the body created takes
//! part, selected only by the simple/complex flag of the trace.

use super::BodyShape;
use crate::convert::{convert_hit, HitContext};
use crate::error::Result;
use crate::filter::{CollisionChannel, FilterData, FilterFlags, ResponseContainer};
use crate::hit::{HitResult, OverlapResult, QueryOverlaps};
use crate::identity::BodyId;
use crate::math::{safe_normal, Quat, Vec3};
use crate::params::CollisionQuery;
use crate::scene::PhysScene;
use crate::shape::{adapt_shape, CollisionShape, GeometryHandle, ShapeKind};
use rapier3d::na::{Isometry3, Translation3};

impl PhysScene {
    /// Shapes created by `id`, taken from a single scene
    fn own_shapes(&self, id: BodyId) -> Result<Vec<BodyShape>> {
        self.initialized(id)?;
        let (root, _) = self.weld_root_of(id)?;
        let root_body = self.instance(root)?;
        let Some(scene) = root_body.actors.first().map(|a| a.scene) else {
            return Ok(Vec::new());
        };
        Ok(root_body
            .shapes
            .iter()
            .filter(|s| s.origin == id && s.scene == scene)
            .copied()
            .collect())
    }

    /// Closest hit of a line trace against this body only
    pub fn line_trace_body(&self, id: BodyId, start: &Vec3, end: &Vec3, trace_complex: bool) -> Result<Option<HitResult>> {
        let shapes = self.own_shapes(id)?;
        let delta = end - start;
        let Some(dir) = safe_normal(&delta) else {
            return Ok(None);
        };
        let length = delta.norm();
        let Some(first) = shapes.first() else {
            return Ok(None);
        };
        let wanted = FilterFlags::for_trace_complex(trace_complex);

        let scene = self.scenes.scene(first.scene)?.read();
        let closest = shapes
            .iter()
            .filter(|s| {
                scene
                    .shape_record(s.shape)
                    .map_or(false, |r| r.query_filter.flags().intersects(wanted))
            })
            .filter_map(|s| scene.raycast_shape(s.shape, start, &dir, length))
            .min_by(|a, b| a.distance.total_cmp(&b.distance));
        let Some(raw) = closest else {
            return Ok(None);
        };

        let filter = FilterData::trace_query(CollisionChannel::default(), &ResponseContainer::default(), 0, trace_complex);
        let ctx = HitContext {
            trace_start: *start,
            trace_end: *end,
            check_length: length,
            query_filter: &filter,
            sweep_geometry: None,
            return_face_index: true,
            return_physical_material: true,
            config: &self.config,
        };
        Ok(finish_body_hit(convert_hit(&*scene, &raw, &ctx).ok()))
    }

    /// Closest hit of a shape sweep against this body only.
    ///
    /// Nearly-zero shapes are traced as lines.
    pub fn sweep_body(
        &self,
        id: BodyId,
        start: &Vec3,
        end: &Vec3,
        rotation: &Quat,
        shape: &CollisionShape,
        trace_complex: bool,
    ) -> Result<Option<HitResult>> {
        if shape.is_nearly_zero() {
            return self.line_trace_body(id, start, end, trace_complex);
        }
        let shapes = self.own_shapes(id)?;
        let Some(first) = shapes.first() else {
            return Ok(None);
        };
        let delta = end - start;
        let (dir, length) = match safe_normal(&delta) {
            Some(dir) => (dir, delta.norm()),
            None => (Vec3::x(), 0.0),
        };
        let geometry = adapt_shape(rotation, shape);
        let wanted = FilterFlags::for_trace_complex(trace_complex);

        let scene = self.scenes.scene(first.scene)?.read();
        let closest = shapes
            .iter()
            .filter(|s| {
                scene
                    .shape_record(s.shape)
                    .map_or(false, |r| r.query_filter.flags().intersects(wanted))
            })
            .filter_map(|s| scene.sweep_shape(s.shape, &geometry, start, &dir, length, true))
            .min_by(|a, b| a.distance.total_cmp(&b.distance));
        let Some(raw) = closest else {
            return Ok(None);
        };

        let filter = FilterData::trace_query(CollisionChannel::default(), &ResponseContainer::default(), 0, trace_complex);
        let ctx = HitContext {
            trace_start: *start,
            trace_end: *end,
            check_length: length,
            query_filter: &filter,
            sweep_geometry: Some(&geometry),
            return_face_index: true,
            return_physical_material: true,
            config: &self.config,
        };
        Ok(finish_body_hit(convert_hit(&*scene, &raw, &ctx).ok()))
    }

    /// Whether `shape` at `position` touches any shape of this body
    pub fn overlap_test_body(
        &self,
        id: BodyId,
        position: &Vec3,
        rotation: &Quat,
        shape: &CollisionShape,
    ) -> Result<bool> {
        let shapes = self.own_shapes(id)?;
        let Some(first) = shapes.first() else {
            return Ok(false);
        };
        let geometry = adapt_shape(rotation, shape);
        let scene = self.scenes.scene(first.scene)?.read();
        Ok(shapes
            .iter()
            .any(|s| scene.overlap_shape(s.shape, &geometry, position)))
    }

    /// Overlaps of the world with this body's shapes, as if the body were at
    /// `position`/`rotation`.
    ///
    /// The body's own component is never reported. Results from several
    /// shapes are merged per (component, item), blocking entries winning.
    pub fn overlap_multi_body(
        &self,
        id: BodyId,
        position: &Vec3,
        rotation: &Quat,
        query: &CollisionQuery,
    ) -> Result<QueryOverlaps> {
        let shapes = self.own_shapes(id)?;
        let mut query = query.clone();
        if let Some(owner) = self.instance(id)?.owner.as_ref() {
            query.params.add_ignored_component(owner.component);
        }
        let (_, relative) = self.weld_root_of(id)?;
        let body_pose = Isometry3::from_parts(Translation3::from(*position), *rotation);
        let root_to_body = relative.to_isometry().inverse();

        let mut overlaps: Vec<OverlapResult> = Vec::new();
        for shape in &shapes {
            if matches!(shape.kind, ShapeKind::TriMesh | ShapeKind::HeightField) {
                continue;
            }
            let Some((geometry, _)) = self.geometry_from_shape(shape.scene, shape.shape) else {
                continue;
            };
            let Some(local) = self
                .scenes
                .get(shape.scene)
                .and_then(|s| s.read().shape_local_pose(shape.shape))
            else {
                continue;
            };
            let pose = body_pose * root_to_body * local;
            let Some(placed) = GeometryHandle::new(geometry.geometry().clone(), pose.rotation) else {
                continue;
            };

            let found = self
                .query()
                .overlap_geometry_multi(&placed, &pose.translation.vector, &query);
            for overlap in found.overlaps {
                match overlaps.iter_mut().find(|o| o.key() == overlap.key()) {
                    Some(existing) => existing.blocking_hit |= overlap.blocking_hit,
                    None => overlaps.push(overlap),
                }
            }
        }

        Ok(QueryOverlaps {
            blocking_hit: overlaps.iter().any(|o| o.blocking_hit),
            overlaps,
        })
    }

    /// Distance from `point` to the closest shape of this body and the point
    /// on that shape; `None` when the body has no usable shape. Triangle
    /// meshes are skipped.
    pub fn distance_to_body(&self, id: BodyId, point: &Vec3) -> Result<Option<(f32, Vec3)>> {
        let shapes = self.own_shapes(id)?;
        let Some(first) = shapes.first() else {
            return Ok(None);
        };
        let scene = self.scenes.scene(first.scene)?.read();
        let mut best: Option<(f32, Vec3)> = None;
        for shape in shapes.iter().filter(|s| s.kind != ShapeKind::TriMesh) {
            let Some((distance, closest)) = scene.shape_distance(shape.shape, point) else {
                continue;
            };
            if best.map_or(true, |(d, _)| distance < d) {
                best = Some((distance, closest));
            }
            if distance <= 0.0 {
                break;
            }
        }
        Ok(best)
    }
}

/// Body traces always block
fn finish_body_hit(hit: Option<HitResult>) -> Option<HitResult> {
    hit.map(|mut hit| {
        hit.blocking_hit = true;
        hit
    })
}
