//! Raw backend hits to engine hit and overlap results
//!
//! A raw hit knows its shape, distance, position and the hit shape's normal.
//! Conversion resolves identity through the backend's identity table,
//! recomputes blocking from the final filter pass, derives time and safe
//! location, and recovers a usable normal when the sweep started inside the
//! hit shape.

use crate::backend::{RawHit, RawHits, RawOverlaps, SceneBackend, ShapeData, ShapeMesh};
use crate::config::CollisionConfig;
use crate::filter::{classify, FilterData, HitType};
use crate::hit::{sort_hits, HitResult, OverlapResult};
use crate::math::{is_finite, safe_normal, Vec3, KINDA_SMALL_NUMBER};
use crate::shape::{GeometryHandle, QueryGeometry, ShapeKind};
use std::collections::HashMap;
use thiserror::Error;

/// Conversion failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConvertError {
    /// The converted hit contains NaN or infinite values
    #[error("hit result contains non-finite values")]
    NonFinite,
}

/// Outcome of converting a batch of hits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionStatus {
    Ok,
    /// At least one hit was dropped because it did not convert
    Invalid,
}

/// Per-query inputs shared by every hit conversion
#[derive(Debug, Clone, Copy)]
pub struct HitContext<'a> {
    pub trace_start: Vec3,
    pub trace_end: Vec3,
    /// Full trace length; `time` is relative to it in every scene
    pub check_length: f32,
    pub query_filter: &'a FilterData,
    /// Geometry of a sweep; `None` for raycasts
    pub sweep_geometry: Option<&'a GeometryHandle>,
    pub return_face_index: bool,
    pub return_physical_material: bool,
    pub config: &'a CollisionConfig,
}

impl<'a> HitContext<'a> {
    fn direction(&self) -> Vec3 {
        safe_normal(&(self.trace_end - self.trace_start)).unwrap_or_else(Vec3::zeros)
    }
}

/// Convert one raw hit.
pub fn convert_hit<B: SceneBackend + ?Sized>(
    backend: &B,
    raw: &RawHit,
    ctx: &HitContext<'_>,
) -> Result<HitResult, ConvertError> {
    let data = backend.shape_data(raw.shape);
    let dir = ctx.direction();
    let mut hit = HitResult::new(ctx.trace_start, ctx.trace_end);

    match &data {
        Some(data) => {
            let identity = &data.identity;
            hit.actor = Some(identity.actor);
            hit.component = Some(identity.component);
            hit.body = identity.body;
            hit.bone_name = identity.bone.clone();
            hit.item = identity.item;
            hit.blocking_hit = classify(ctx.query_filter, &data.query_filter, false) == HitType::Block;
            if ctx.return_physical_material {
                hit.phys_material = identity.material_for_face(raw.face_index);
            }
            if ctx.return_face_index && data.kind == ShapeKind::TriMesh {
                hit.face_index = raw.face_index;
            }
        }
        None => {
            log::debug!("Hit on unregistered shape {:?}", raw.shape);
            hit.blocking_hit = raw.hit_type == HitType::Block;
        }
    }

    match (raw.initial_overlap, ctx.sweep_geometry) {
        (true, Some(geometry)) => overlap_to_impact(backend, raw, data.as_ref(), geometry, ctx, &dir, &mut hit),
        _ => {
            hit.time = if ctx.check_length > 0.0 {
                (raw.distance / ctx.check_length).clamp(0.0, 1.0)
            } else {
                0.0
            };
            hit.distance = raw.distance;
            hit.location = ctx.trace_start + (ctx.trace_end - ctx.trace_start) * hit.time;
            hit.impact_point = raw.position;
            hit.start_penetrating = raw.initial_overlap;

            let normal = safe_normal(&raw.normal).unwrap_or(-dir);
            hit.normal = normal;
            hit.impact_normal = normal;

            let rounded_sweep = ctx
                .sweep_geometry
                .map_or(false, |g| matches!(g.geometry(), QueryGeometry::Sphere { .. } | QueryGeometry::Capsule { .. }));
            if rounded_sweep {
                if let Some(opposing) = data
                    .as_ref()
                    .and_then(|d| opposing_normal(backend, d, raw, &dir))
                {
                    hit.impact_normal = opposing;
                }
            }
        }
    }

    if hit.is_finite() {
        Ok(hit)
    } else {
        Err(ConvertError::NonFinite)
    }
}

/// Fill a hit for a sweep that started inside the hit shape
fn overlap_to_impact<B: SceneBackend + ?Sized>(
    backend: &B,
    raw: &RawHit,
    data: Option<&ShapeData>,
    geometry: &GeometryHandle,
    ctx: &HitContext<'_>,
    dir: &Vec3,
    hit: &mut HitResult,
) {
    let center = ctx.trace_start;
    hit.time = 0.0;
    hit.distance = 0.0;
    hit.start_penetrating = true;
    hit.location = center;
    hit.impact_point = if is_finite(&raw.position) { raw.position } else { center };

    let recovered = backend_normal(raw)
        .or_else(|| inflated_mtd(backend, raw, geometry, &center, dir, ctx.config))
        .or_else(|| {
            data.filter(|d| matches!(d.kind, ShapeKind::TriMesh | ShapeKind::HeightField))
                .and_then(|_| best_triangle_normal(backend, raw, geometry, &center, ctx.config))
                .map(|normal| (normal, 0.0))
        })
        .or_else(|| point_distance_normal(backend, raw, &center).map(|normal| (normal, 0.0)));

    let (normal, depth) = recovered.unwrap_or_else(|| {
        log::warn!(
            "Could not recover a penetration normal for shape {:?} at {:?}; using +Z",
            raw.shape,
            center
        );
        (Vec3::z(), 0.0)
    });
    hit.normal = normal;
    hit.impact_normal = normal;
    hit.penetration_depth = depth;
}

fn backend_normal(raw: &RawHit) -> Option<(Vec3, f32)> {
    if raw.penetration_depth > 0.0 && is_finite(&raw.normal) {
        safe_normal(&raw.normal).map(|n| (n, raw.penetration_depth))
    } else {
        None
    }
}

/// Penetration of an inflated (or, for convex geometry, jittered) query
fn inflated_mtd<B: SceneBackend + ?Sized>(
    backend: &B,
    raw: &RawHit,
    geometry: &GeometryHandle,
    center: &Vec3,
    dir: &Vec3,
    config: &CollisionConfig,
) -> Option<(Vec3, f32)> {
    for inflation in [config.small_mtd_inflation, config.large_mtd_inflation] {
        let found = if geometry.kind().can_inflate() {
            geometry
                .inflated(inflation)
                .and_then(|inflated| backend.penetration(raw.shape, &inflated, center))
                .filter(|p| is_finite(&p.normal))
        } else {
            let jitter = [*dir, -dir, -Vec3::z(), Vec3::z(), -Vec3::x(), Vec3::x(), -Vec3::y(), Vec3::y()];
            jitter.iter().find_map(|offset| {
                backend
                    .penetration(raw.shape, geometry, &(center + offset * inflation))
                    .filter(|p| is_finite(&p.normal))
            })
        };
        if let Some(penetration) = found {
            if let Some(normal) = safe_normal(&penetration.normal) {
                let depth = (penetration.depth.abs() - inflation).max(0.0) + KINDA_SMALL_NUMBER;
                return Some((normal, depth));
            }
        }
    }
    None
}

/// Normal of the overlapping triangle whose plane lies furthest behind the query center
fn best_triangle_normal<B: SceneBackend + ?Sized>(
    backend: &B,
    raw: &RawHit,
    geometry: &GeometryHandle,
    center: &Vec3,
    config: &CollisionConfig,
) -> Option<Vec3> {
    let triangles = backend.overlapping_triangles(raw.shape, geometry, center, config.max_overlapped_triangles);
    triangles
        .iter()
        .filter_map(|[a, b, c]| {
            let normal = safe_normal(&(b - a).cross(&(c - a)))?;
            let separation = normal.dot(&(center - a));
            Some(if separation < 0.0 {
                (-normal, -separation)
            } else {
                (normal, separation)
            })
        })
        .max_by(|x, y| x.1.total_cmp(&y.1))
        .map(|(normal, _)| normal)
}

/// Direction from the hit shape's closest point (or bounds center) to the query center
fn point_distance_normal<B: SceneBackend + ?Sized>(backend: &B, raw: &RawHit, center: &Vec3) -> Option<Vec3> {
    let closest = backend.closest_point(raw.shape, center)?;
    let away = center - closest;
    if away.norm() > KINDA_SMALL_NUMBER {
        return safe_normal(&away);
    }
    let bounds = backend.bounds_center(raw.shape)?;
    safe_normal(&(center - bounds))
}

/// Normal of the hit face facing against the sweep, by hit shape kind.
///
/// `None` when the face cannot be determined; the caller keeps its normal.
pub fn opposing_normal<B: SceneBackend + ?Sized>(
    backend: &B,
    data: &ShapeData,
    raw: &RawHit,
    dir: &Vec3,
) -> Option<Vec3> {
    match data.kind {
        ShapeKind::Sphere | ShapeKind::Box | ShapeKind::Capsule => Some(safe_normal(&raw.normal).unwrap_or(-dir)),
        ShapeKind::Convex => {
            let ShapeMesh::Convex { hull, scale } = &data.mesh else {
                return None;
            };
            let local_point = data
                .pose
                .inverse_transform_point_no_scale(&raw.position)
                .component_div(scale);
            let local_dir = (data.pose.rotation.inverse() * dir).component_div(scale);
            let face = hull.find_face_index(&local_point, &local_dir)?;
            let plane = hull.planes().get(face)?;
            // inverse transpose of the mesh scale
            let normal = safe_normal(&plane.normal.component_div(scale))?;
            Some(data.pose.rotation * normal)
        }
        ShapeKind::TriMesh => {
            let ShapeMesh::TriMesh {
                mesh,
                scale,
                double_sided,
            } = &data.mesh
            else {
                return None;
            };
            let [a, b, c] = mesh.triangle_vertices(raw.face_index? as usize)?;
            let (a, b, c) = (a.component_mul(scale), b.component_mul(scale), c.component_mul(scale));
            let normal = data.pose.rotation * safe_normal(&(b - a).cross(&(c - a)))?;
            if *double_sided && normal.dot(dir) > 0.0 {
                Some(-normal)
            } else {
                Some(normal)
            }
        }
        ShapeKind::HeightField => backend.height_field_face_normal(raw.shape, raw.face_index?, &raw.position),
    }
}

/// Convert touches and block of a raycast, sorted with the block last
pub fn convert_raycast_results<B: SceneBackend + ?Sized>(
    backend: &B,
    raws: &RawHits,
    ctx: &HitContext<'_>,
) -> (Vec<HitResult>, ConversionStatus) {
    let mut hits = Vec::with_capacity(raws.touches.len() + 1);
    let status = convert_into(backend, raws.iter(), ctx, &mut hits);
    sort_hits(&mut hits);
    (hits, status)
}

/// Add a scene's sweep hits to `hits`.
///
/// Hits beyond the nearest blocking distance (including blocks already in
/// `hits`) are dropped, the result is sorted and only the nearest block is kept.
pub fn add_sweep_results<B: SceneBackend + ?Sized>(
    backend: &B,
    raws: &RawHits,
    ctx: &HitContext<'_>,
    hits: &mut Vec<HitResult>,
) -> ConversionStatus {
    let existing_block = hits
        .iter()
        .filter(|h| h.blocking_hit)
        .map(|h| h.distance)
        .fold(f32::MAX, f32::min);
    let block_distance = raws
        .block
        .as_ref()
        .map_or(existing_block, |b| b.distance.min(existing_block));

    let status = convert_into(
        backend,
        raws.iter().filter(|raw| raw.distance <= block_distance),
        ctx,
        hits,
    );
    hits.retain(|h| h.distance <= block_distance);
    sort_hits(hits);
    if let Some(first_block) = hits.iter().position(|h| h.blocking_hit) {
        hits.truncate(first_block + 1);
    }
    status
}

fn convert_into<'r, B: SceneBackend + ?Sized>(
    backend: &B,
    raws: impl Iterator<Item = &'r RawHit>,
    ctx: &HitContext<'_>,
    hits: &mut Vec<HitResult>,
) -> ConversionStatus {
    let mut status = ConversionStatus::Ok;
    for raw in raws {
        match convert_hit(backend, raw, ctx) {
            Ok(hit) => hits.push(hit),
            Err(ConvertError::NonFinite) => status = ConversionStatus::Invalid,
        }
    }
    status
}

/// Convert overlaps into `out`, keeping one entry per (component, item); a
/// blocking entry replaces a non-blocking one.
pub fn convert_overlap_results<B: SceneBackend + ?Sized>(
    backend: &B,
    raws: &RawOverlaps,
    query_filter: &FilterData,
    out: &mut Vec<OverlapResult>,
) {
    let mut seen: HashMap<_, usize> = out.iter().enumerate().map(|(i, o)| (o.key(), i)).collect();
    for raw in &raws.overlaps {
        let result = match backend.shape_data(raw.shape) {
            Some(data) => OverlapResult {
                actor: Some(data.identity.actor),
                component: Some(data.identity.component),
                body: data.identity.body,
                item: data.identity.item,
                blocking_hit: classify(query_filter, &data.query_filter, false) == HitType::Block,
            },
            None => continue,
        };
        add_overlap(result, out, &mut seen);
    }
}

fn add_overlap(
    result: OverlapResult,
    out: &mut Vec<OverlapResult>,
    seen: &mut HashMap<(Option<crate::identity::ComponentId>, Option<i32>), usize>,
) {
    match seen.get(&result.key()) {
        Some(&index) => {
            if result.blocking_hit && !out[index].blocking_hit {
                out[index] = result;
            }
        }
        None => {
            seen.insert(result.key(), out.len());
            out.push(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{raw_hit, shape_data, ScriptedScene};
    use crate::backend::Penetration;
    use crate::body_setup::{MeshIndices, TriMeshData};
    use crate::filter::{CollisionChannel, ResponseContainer};
    use crate::identity::{ComponentId, ShapeId};
    use crate::math::{Quat, Transform};
    use crate::shape::{adapt_shape, CollisionShape, ConvexHull};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn query() -> FilterData {
        FilterData::trace_query(CollisionChannel::Visibility, &ResponseContainer::default(), 0, false)
    }

    fn ctx<'a>(
        filter: &'a FilterData,
        config: &'a CollisionConfig,
        geometry: Option<&'a GeometryHandle>,
    ) -> HitContext<'a> {
        HitContext {
            trace_start: Vec3::new(0.0, 0.0, 100.0),
            trace_end: Vec3::new(0.0, 0.0, -100.0),
            check_length: 200.0,
            query_filter: filter,
            sweep_geometry: geometry,
            return_face_index: true,
            return_physical_material: false,
            config,
        }
    }

    #[test]
    fn test_time_and_location_from_distance() {
        let scene = ScriptedScene::new().with_shape(1, ShapeKind::Box, 11);
        let filter = query();
        let config = CollisionConfig::default();
        let raw = raw_hit(1, 50.0, HitType::Block);
        let hit = convert_hit(&scene, &raw, &ctx(&filter, &config, None)).unwrap();
        assert_relative_eq!(hit.time, 0.25);
        assert_relative_eq!(hit.location, Vec3::new(0.0, 0.0, 50.0));
        assert!(hit.blocking_hit);
        assert_eq!(hit.component, Some(ComponentId(11)));
    }

    #[test]
    fn test_blocking_comes_from_final_classification() {
        let mut scene = ScriptedScene::new().with_shape(1, ShapeKind::Box, 11);
        if let Some(data) = scene.shapes.get_mut(&ShapeId(1)) {
            data.query_filter = FilterData::shape(
                CollisionChannel::WorldStatic,
                &ResponseContainer::all(crate::filter::CollisionResponse::Overlap),
                0,
                crate::filter::FilterFlags::SIMPLE_COLLISION,
            );
        }
        let filter = query();
        let config = CollisionConfig::default();
        // backend claims block, the shape only overlaps
        let hit = convert_hit(&scene, &raw_hit(1, 10.0, HitType::Block), &ctx(&filter, &config, None)).unwrap();
        assert!(!hit.blocking_hit);
    }

    #[test]
    fn test_initial_overlap_uses_inflated_mtd() {
        let mut scene = ScriptedScene::new().with_shape(1, ShapeKind::Box, 11);
        scene.penetrations.insert(
            ShapeId(1),
            Penetration {
                normal: Vec3::new(0.0, 2.0, 0.0),
                depth: 1.0,
            },
        );
        let filter = query();
        let config = CollisionConfig::default();
        let geometry = adapt_shape(&Quat::identity(), &CollisionShape::sphere(5.0));
        let mut raw = raw_hit(1, 0.0, HitType::Block);
        raw.initial_overlap = true;
        raw.normal = Vec3::zeros();
        let hit = convert_hit(&scene, &raw, &ctx(&filter, &config, Some(&geometry))).unwrap();
        assert!(hit.start_penetrating);
        assert_eq!(hit.time, 0.0);
        assert_eq!(hit.location, Vec3::new(0.0, 0.0, 100.0));
        assert_relative_eq!(hit.normal, Vec3::y());
        assert_relative_eq!(hit.penetration_depth, 0.75 + KINDA_SMALL_NUMBER, epsilon = 1e-6);
    }

    #[test]
    fn test_backend_mtd_wins_when_present() {
        let scene = ScriptedScene::new().with_shape(1, ShapeKind::Box, 11);
        let filter = query();
        let config = CollisionConfig::default();
        let geometry = adapt_shape(&Quat::identity(), &CollisionShape::sphere(5.0));
        let mut raw = raw_hit(1, 0.0, HitType::Block);
        raw.initial_overlap = true;
        raw.normal = Vec3::new(3.0, 0.0, 0.0);
        raw.penetration_depth = 2.0;
        let hit = convert_hit(&scene, &raw, &ctx(&filter, &config, Some(&geometry))).unwrap();
        assert_relative_eq!(hit.normal, Vec3::x());
        assert_relative_eq!(hit.penetration_depth, 2.0);
    }

    #[test]
    fn test_mesh_recovery_picks_most_separated_triangle() {
        let mut scene = ScriptedScene::new().with_shape(1, ShapeKind::TriMesh, 11);
        scene.triangles.insert(
            ShapeId(1),
            vec![
                // floor just below the center
                [Vec3::new(-10.0, -10.0, 99.0), Vec3::new(10.0, -10.0, 99.0), Vec3::new(0.0, 10.0, 99.0)],
                // wall further away
                [Vec3::new(-5.0, -10.0, 90.0), Vec3::new(-5.0, 10.0, 90.0), Vec3::new(-5.0, 0.0, 110.0)],
            ],
        );
        let filter = query();
        let config = CollisionConfig::default();
        let geometry = adapt_shape(&Quat::identity(), &CollisionShape::sphere(10.0));
        let mut raw = raw_hit(1, 0.0, HitType::Block);
        raw.initial_overlap = true;
        let hit = convert_hit(&scene, &raw, &ctx(&filter, &config, Some(&geometry))).unwrap();
        assert_relative_eq!(hit.normal, Vec3::x(), epsilon = 1e-5);
    }

    #[test]
    fn test_point_distance_then_bounds_fallback() {
        let mut scene = ScriptedScene::new().with_shape(1, ShapeKind::Convex, 11);
        scene.closest.insert(ShapeId(1), Vec3::new(0.0, 0.0, 100.0));
        scene.bounds.insert(ShapeId(1), Vec3::new(0.0, -10.0, 100.0));
        let filter = query();
        let config = CollisionConfig::default();
        let geometry = adapt_shape(&Quat::identity(), &CollisionShape::cuboid(1.0, 1.0, 1.0));
        let mut raw = raw_hit(1, 0.0, HitType::Block);
        raw.initial_overlap = true;
        let hit = convert_hit(&scene, &raw, &ctx(&filter, &config, Some(&geometry))).unwrap();
        // center coincides with the closest point, so the bounds center decides
        assert_relative_eq!(hit.normal, Vec3::y(), epsilon = 1e-5);
    }

    #[test]
    fn test_unrecoverable_normal_defaults_to_up() {
        let scene = ScriptedScene::new().with_shape(1, ShapeKind::Box, 11);
        let filter = query();
        let config = CollisionConfig::default();
        let geometry = adapt_shape(&Quat::identity(), &CollisionShape::sphere(1.0));
        let mut raw = raw_hit(1, 0.0, HitType::Block);
        raw.initial_overlap = true;
        let hit = convert_hit(&scene, &raw, &ctx(&filter, &config, Some(&geometry))).unwrap();
        assert_eq!(hit.normal, Vec3::z());
        assert!(hit.is_finite());
    }

    #[test]
    fn test_non_finite_hit_is_rejected() {
        let scene = ScriptedScene::new().with_shape(1, ShapeKind::Box, 11);
        let filter = query();
        let config = CollisionConfig::default();
        let mut raw = raw_hit(1, 10.0, HitType::Block);
        raw.position = Vec3::new(f32::NAN, 0.0, 0.0);
        assert_eq!(
            convert_hit(&scene, &raw, &ctx(&filter, &config, None)),
            Err(ConvertError::NonFinite)
        );

        let raws = RawHits {
            touches: vec![raw_hit(1, 5.0, HitType::Touch)],
            block: Some(raw),
            overflowed: false,
        };
        let (hits, status) = convert_raycast_results(&scene, &raws, &ctx(&filter, &config, None));
        assert_eq!(status, ConversionStatus::Invalid);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_sweep_results_drop_hits_behind_block() {
        let scene = ScriptedScene::new()
            .with_shape(1, ShapeKind::Box, 11)
            .with_shape(2, ShapeKind::Box, 12)
            .with_shape(3, ShapeKind::Box, 13);
        let filter = query();
        let config = CollisionConfig::default();
        let raws = RawHits {
            touches: vec![raw_hit(1, 5.0, HitType::Touch), raw_hit(3, 40.0, HitType::Touch)],
            block: Some(raw_hit(2, 20.0, HitType::Block)),
            overflowed: false,
        };
        let mut hits = Vec::new();
        let status = add_sweep_results(&scene, &raws, &ctx(&filter, &config, None), &mut hits);
        assert_eq!(status, ConversionStatus::Ok);
        // every shape blocks in the final pass, so only the nearest survives as the block
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].component, Some(ComponentId(11)));
        assert!(hits[0].blocking_hit);
    }

    #[test]
    fn test_convex_opposing_normal_respects_scale() {
        let mut pts = Vec::new();
        for x in [-1.0, 1.0] {
            for y in [-1.0, 1.0] {
                for z in [-1.0, 1.0] {
                    pts.push(Vec3::new(x, y, z));
                }
            }
        }
        let hull = Arc::new(ConvexHull::from_points(&pts).unwrap());
        let mut data = shape_data(ShapeKind::Convex, 1);
        data.mesh = ShapeMesh::Convex {
            hull,
            scale: Vec3::new(2.0, 2.0, 4.0),
        };
        data.pose = Transform::from_translation(Vec3::new(0.0, 0.0, 10.0));
        let scene = ScriptedScene::new();
        let mut raw = raw_hit(1, 5.0, HitType::Block);
        raw.position = Vec3::new(0.5, 0.0, 14.0);
        let normal = opposing_normal(&scene, &data, &raw, &-Vec3::z()).unwrap();
        assert_relative_eq!(normal, Vec3::z(), epsilon = 1e-5);
    }

    #[test]
    fn test_trimesh_opposing_normal_double_sided() {
        let mesh = TriMeshData::new(
            vec![Vec3::zeros(), Vec3::x(), Vec3::y()],
            MeshIndices::U32(vec![[0, 1, 2]]),
        );
        let mut data = shape_data(ShapeKind::TriMesh, 1);
        data.mesh = ShapeMesh::TriMesh {
            mesh: Arc::new(mesh),
            scale: Vec3::repeat(1.0),
            double_sided: true,
        };
        let scene = ScriptedScene::new();
        let mut raw = raw_hit(1, 5.0, HitType::Block);
        raw.face_index = Some(0);
        // coming from below, the double-sided face turns to face the sweep
        let normal = opposing_normal(&scene, &data, &raw, &Vec3::z()).unwrap();
        assert_relative_eq!(normal, -Vec3::z(), epsilon = 1e-6);
        raw.face_index = Some(9);
        assert!(opposing_normal(&scene, &data, &raw, &Vec3::z()).is_none());
    }

    #[test]
    fn test_overlap_dedup_prefers_blocking() {
        let mut scene = ScriptedScene::new()
            .with_shape(1, ShapeKind::Box, 11)
            .with_shape(2, ShapeKind::Sphere, 11)
            .with_overlap(1, HitType::Touch)
            .with_overlap(2, HitType::Block);
        if let Some(data) = scene.shapes.get_mut(&ShapeId(1)) {
            data.query_filter = FilterData::shape(
                CollisionChannel::WorldStatic,
                &ResponseContainer::all(crate::filter::CollisionResponse::Overlap),
                0,
                crate::filter::FilterFlags::SIMPLE_COLLISION,
            );
        }
        let filter = query();
        let mut out = Vec::new();
        let raws = RawOverlaps {
            overlaps: scene.overlaps.clone(),
            overflowed: false,
        };
        convert_overlap_results(&scene, &raws, &filter, &mut out);
        assert_eq!(out.len(), 1);
        assert!(out[0].blocking_hit);

        // converting the same overlaps again changes nothing
        convert_overlap_results(&scene, &raws, &filter, &mut out);
        assert_eq!(out.len(), 1);
        assert!(out[0].blocking_hit);
    }
}
