//! Shape instantiation from a body template, and rescaling live bodies

use super::BodyShape;
use crate::backend::ShapeMesh;
use crate::body_setup::{BodySetup, CollisionTraceFlag};
use crate::error::{CollisionError, Result};
use crate::identity::BodyId;
use crate::math::{is_finite, is_nearly_zero, Quat, Transform, Vec3, KINDA_SMALL_NUMBER};
use crate::scene::PhysScene;
use crate::shape::{to_backend_capsule_rotation, ShapeKind};
use rapier3d::prelude::SharedShape;
use std::f32::consts::FRAC_PI_2;
use std::sync::Arc;

/// Smallest radius, half extent or half height a scaled primitive keeps
const MIN_PRIMITIVE_SIZE: f32 = 0.1;

/// How a body's scale is constrained by the shapes it hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleMode {
    Free,
    /// X and Y share one factor (capsules)
    LockedXY,
    /// One factor for all axes (spheres)
    LockedXYZ,
}

impl ScaleMode {
    pub fn for_kinds(kinds: &[ShapeKind]) -> Self {
        if kinds.contains(&ShapeKind::Sphere) {
            Self::LockedXYZ
        } else if kinds.contains(&ShapeKind::Capsule) {
            Self::LockedXY
        } else {
            Self::Free
        }
    }

    /// Constrain `scale` to this mode, keeping sign where all constrained axes are negative
    pub fn apply(self, scale: &Vec3) -> Vec3 {
        match self {
            Self::Free => *scale,
            Self::LockedXYZ => {
                let uniform = scale.abs().min();
                if scale.max() < 0.0 {
                    Vec3::repeat(-uniform)
                } else {
                    Vec3::repeat(uniform)
                }
            }
            Self::LockedXY => {
                let xy = scale.x.abs().max(scale.y.abs());
                let xy = if scale.x.max(scale.y) < 0.0 { -xy } else { xy };
                Vec3::new(xy, xy, scale.z)
            }
        }
    }
}

/// Push a scale component that shrank or grew into (-threshold, threshold)
/// out to the threshold, on the side it was heading towards.
pub fn adjust_for_small_threshold(new: f32, old: f32, threshold: f32) -> f32 {
    let delta = new - old;
    if new.abs() >= threshold {
        new
    } else if delta < 0.0 {
        -threshold
    } else if delta > 0.0 {
        threshold
    } else {
        new
    }
}

/// Derived quantities shared by every primitive of one scale
struct NonUniform {
    scale: Vec3,
    abs: Vec3,
    min_abs: f32,
}

impl NonUniform {
    fn new(scale: &Vec3) -> Self {
        let scale = if is_nearly_zero(scale, KINDA_SMALL_NUMBER) {
            Vec3::repeat(MIN_PRIMITIVE_SIZE)
        } else {
            *scale
        };
        let abs = scale.abs();
        let mut min_abs = abs.min();
        if min_abs.abs() <= KINDA_SMALL_NUMBER {
            min_abs = MIN_PRIMITIVE_SIZE;
        }
        Self { scale, abs, min_abs }
    }
}

/// One template element instantiated at a scale
#[derive(Debug, Clone)]
pub(crate) struct ScaledShape {
    pub shape: SharedShape,
    /// Rigid pose relative to the body
    pub local: Transform,
    pub kind: ShapeKind,
    pub mesh: ShapeMesh,
}

/// Mesh-level scale for a mirrored variant; the variant already carries the X flip
fn mirrored_mesh_scale(scale: &Vec3) -> Vec3 {
    Vec3::new(-scale.x, scale.y, scale.z)
}

/// Instantiate every element of `setup` at `scale`
pub(crate) fn instantiate_shapes(setup: &BodySetup, scale: &Vec3) -> Vec<ScaledShape> {
    let s = NonUniform::new(scale);
    let determinant = s.scale.x * s.scale.y * s.scale.z;
    let mut scaled = Vec::new();

    for sphere in &setup.agg_geom.spheres {
        let radius = (sphere.radius * s.min_abs).max(MIN_PRIMITIVE_SIZE);
        scaled.push(ScaledShape {
            shape: SharedShape::ball(radius),
            local: Transform::from_translation(sphere.center.component_mul(&s.scale)),
            kind: ShapeKind::Sphere,
            mesh: ShapeMesh::None,
        });
    }

    for elem in &setup.agg_geom.boxes {
        let half = elem.half_extents.component_mul(&s.abs).map(|e| e.max(MIN_PRIMITIVE_SIZE));
        scaled.push(ScaledShape {
            shape: SharedShape::cuboid(half.x, half.y, half.z),
            local: Transform::from_translation_rotation(elem.center.component_mul(&s.scale), elem.rotation),
            kind: ShapeKind::Box,
            mesh: ShapeMesh::None,
        });
    }

    for capsule in &setup.agg_geom.capsules {
        let radius_scale = s.abs.x.max(s.abs.y);
        let half_length = (capsule.length + capsule.radius * 2.0) * s.abs.z * 0.5;
        let radius = (capsule.radius * radius_scale)
            .max(MIN_PRIMITIVE_SIZE)
            .min(half_length.max(MIN_PRIMITIVE_SIZE));
        let half_height = (half_length - radius).max(MIN_PRIMITIVE_SIZE);
        scaled.push(ScaledShape {
            shape: SharedShape::capsule_y(half_height, radius),
            local: Transform::from_translation_rotation(
                capsule.center.component_mul(&s.scale),
                to_backend_capsule_rotation(&capsule.rotation),
            ),
            kind: ShapeKind::Capsule,
            mesh: ShapeMesh::None,
        });
    }

    for convex in &setup.agg_geom.convexes {
        let Some(hull) = convex.hull_for(determinant) else {
            log::warn!("Convex element has no mirrored variant; skipped for mirrored scale {:?}", s.scale);
            continue;
        };
        let mesh_scale = if determinant < 0.0 {
            mirrored_mesh_scale(&s.scale)
        } else {
            s.scale
        };
        let Some(shape) = hull.scaled_shape(&mesh_scale) else {
            log::warn!("Failed to build convex shape at scale {:?}", mesh_scale);
            continue;
        };
        scaled.push(ScaledShape {
            shape,
            local: Transform::from_translation_rotation(convex.center.component_mul(&s.scale), convex.rotation),
            kind: ShapeKind::Convex,
            mesh: ShapeMesh::Convex {
                hull: Arc::clone(hull),
                scale: mesh_scale,
            },
        });
    }

    if setup.collision_trace_flag != CollisionTraceFlag::UseSimpleAsComplex && setup.tri_mesh.is_some() {
        match setup.tri_mesh_for(determinant) {
            Some(mesh) => {
                let mesh_scale = if determinant < 0.0 {
                    mirrored_mesh_scale(&s.scale)
                } else {
                    s.scale
                };
                match mesh.to_shared_shape(&mesh_scale) {
                    Some(shape) => scaled.push(ScaledShape {
                        shape,
                        local: Transform::identity(),
                        kind: ShapeKind::TriMesh,
                        mesh: ShapeMesh::TriMesh {
                            mesh: Arc::clone(mesh),
                            scale: mesh_scale,
                            double_sided: setup.double_sided_geometry,
                        },
                    }),
                    None => log::warn!("Triangle mesh has no triangles; skipped"),
                }
            }
            None => log::warn!("Missing mirrored triangle mesh for scale {:?}", s.scale),
        }
    }

    if let Some(field) = &setup.height_field {
        match field.to_shared_shape() {
            // backend height fields are Y up
            Some(shape) => scaled.push(ScaledShape {
                shape,
                local: Transform::from_translation_rotation(
                    Vec3::zeros(),
                    Quat::from_axis_angle(&Vec3::x_axis(), FRAC_PI_2),
                ),
                kind: ShapeKind::HeightField,
                mesh: ShapeMesh::None,
            }),
            None => log::warn!("Height field {}x{} is malformed; skipped", field.rows, field.columns),
        }
    }

    scaled
}

impl PhysScene {
    /// Rebuild a body's shapes at a new scale.
    ///
    /// Returns `Ok(false)` when the scale is unchanged or nothing could be
    /// instantiated; the body keeps its previous shapes in that case.
    pub fn update_body_scale(&mut self, id: BodyId, scale: &Vec3, force_mass_update: bool) -> Result<bool> {
        if !is_finite(scale) {
            log::error!("update_body_scale: non-finite scale {:?} for body {:?}", scale, id);
            return Err(CollisionError::InvalidScale(format!("{:?}", scale)));
        }
        let body = self.initialized(id)?;
        let Some(setup) = body.setup.clone() else {
            return Err(CollisionError::NoTemplate(id));
        };
        let old = body.scale;
        if (scale - old).abs().max() <= KINDA_SMALL_NUMBER {
            return Ok(false);
        }

        let threshold = self.config.scale_small_threshold;
        let adjusted = Vec3::new(
            adjust_for_small_threshold(scale.x, old.x, threshold),
            adjust_for_small_threshold(scale.y, old.y, threshold),
            adjust_for_small_threshold(scale.z, old.z, threshold),
        );
        let new_scale = ScaleMode::for_kinds(&setup.shape_kinds()).apply(&adjusted);
        let determinant = new_scale.x * new_scale.y * new_scale.z;
        if !setup.supports_determinant(determinant) {
            log::warn!(
                "update_body_scale: body {:?} cannot represent scale {:?} (mirroring not supported)",
                id,
                new_scale
            );
            return Err(CollisionError::InvalidTransform(format!("mirrored scale {:?}", new_scale)));
        }

        let scaled = instantiate_shapes(&setup, &new_scale);
        if scaled.is_empty() {
            log::warn!("update_body_scale: body {:?} produced no shapes at {:?}", id, new_scale);
            return Ok(false);
        }

        let (root, relative) = self.weld_root_of(id)?;
        let is_static = self.instance(root)?.is_static();
        let descs = self.shape_descs(id, is_static, &relative, scaled)?;

        let pending = !self.instance(root)?.pending.is_empty();
        if pending {
            let root_body = self.instance_mut(root)?;
            root_body.pending.retain(|p| p.origin != id);
            root_body.pending.extend(descs);
        } else {
            self.detach_origin_shapes(root, id)?;
            self.attach_descs(root, descs)?;
        }
        self.instance_mut(id)?.scale = new_scale;
        log::debug!("Body {:?} rescaled {:?} -> {:?}", id, old, new_scale);

        if force_mass_update {
            self.update_mass_properties(root)?;
        }
        Ok(true)
    }

    /// Remove every shape on `root`'s actors that `origin` created
    pub(crate) fn detach_origin_shapes(&mut self, root: BodyId, origin: BodyId) -> Result<usize> {
        let shapes: Vec<BodyShape> = self
            .instance(root)?
            .shapes
            .iter()
            .filter(|s| s.origin == origin)
            .copied()
            .collect();
        for shape in &shapes {
            self.scenes.scene(shape.scene)?.write().detach_shape(shape.shape);
        }
        self.instance_mut(root)?.shapes.retain(|s| s.origin != origin);
        Ok(shapes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{BodyInstance, BodyOwner};
    use crate::body_setup::{AggregateGeom, ConvexElem, MeshIndices, TriMeshData};
    use crate::config::CollisionConfig;
    use crate::identity::ComponentId;
    use approx::assert_relative_eq;

    fn cube_points() -> Vec<Vec3> {
        let mut points = Vec::new();
        for x in [0.0, 2.0] {
            for y in [-1.0, 1.0] {
                for z in [-1.0, 1.0] {
                    points.push(Vec3::new(x, y, z));
                }
            }
        }
        points
    }

    #[test]
    fn test_small_threshold_follows_direction() {
        assert_relative_eq!(adjust_for_small_threshold(0.05, 1.0, 0.1), -0.1);
        assert_relative_eq!(adjust_for_small_threshold(0.05, -1.0, 0.1), 0.1);
        assert_relative_eq!(adjust_for_small_threshold(0.5, 1.0, 0.1), 0.5);
        assert_relative_eq!(adjust_for_small_threshold(0.05, 0.05, 0.1), 0.05);
    }

    #[test]
    fn test_scale_modes() {
        assert_eq!(ScaleMode::for_kinds(&[ShapeKind::Box, ShapeKind::Sphere]), ScaleMode::LockedXYZ);
        assert_eq!(ScaleMode::for_kinds(&[ShapeKind::Capsule]), ScaleMode::LockedXY);
        assert_eq!(ScaleMode::for_kinds(&[ShapeKind::Convex]), ScaleMode::Free);

        let xyz = ScaleMode::LockedXYZ.apply(&Vec3::new(2.0, -3.0, 4.0));
        assert_relative_eq!(xyz, Vec3::repeat(2.0));
        let negative = ScaleMode::LockedXYZ.apply(&Vec3::new(-2.0, -3.0, -4.0));
        assert_relative_eq!(negative, Vec3::repeat(-2.0));

        let xy = ScaleMode::LockedXY.apply(&Vec3::new(1.0, -3.0, 5.0));
        assert_relative_eq!(xy, Vec3::new(3.0, 3.0, 5.0));
    }

    #[test]
    fn test_capsule_radius_bounded_by_half_length() {
        let setup = BodySetup::from_geom(AggregateGeom::default().with_capsule(Vec3::zeros(), 10.0, 20.0));
        let scaled = instantiate_shapes(&setup, &Vec3::new(4.0, 4.0, 0.5));
        let capsule = scaled[0].shape.as_capsule().unwrap();
        // half length (20 + 20) * 0.5 * 0.5 = 10 caps the radius of 40
        assert_relative_eq!(capsule.radius, 10.0);
        assert_relative_eq!(capsule.half_height(), MIN_PRIMITIVE_SIZE);
    }

    #[test]
    fn test_primitives_keep_minimum_size() {
        let setup = BodySetup::from_geom(
            AggregateGeom::default()
                .with_sphere(Vec3::new(1.0, 0.0, 0.0), 1.0)
                .with_box(Vec3::zeros(), Vec3::new(1.0, 1.0, 1.0)),
        );
        let scaled = instantiate_shapes(&setup, &Vec3::new(0.01, 2.0, 2.0));
        assert_relative_eq!(scaled[0].shape.as_ball().unwrap().radius, MIN_PRIMITIVE_SIZE);
        assert_relative_eq!(scaled[0].local.translation, Vec3::new(0.01, 0.0, 0.0));
        let half = scaled[1].shape.as_cuboid().unwrap().half_extents;
        assert_relative_eq!(half, Vec3::new(MIN_PRIMITIVE_SIZE, 2.0, 2.0));
    }

    #[test]
    fn test_mirrored_convex_uses_variant() {
        let elem = ConvexElem::from_points(&cube_points(), true).unwrap();
        let setup = BodySetup::from_geom(AggregateGeom::default().with_convex(elem));
        let scaled = instantiate_shapes(&setup, &Vec3::new(-1.0, 1.0, 1.0));
        assert_eq!(scaled.len(), 1);
        match &scaled[0].mesh {
            ShapeMesh::Convex { scale, .. } => assert_relative_eq!(*scale, Vec3::new(1.0, 1.0, 1.0)),
            other => panic!("unexpected mesh {:?}", other),
        }
        // mirrored hull spans x in [-2, 0]
        let aabb = scaled[0].shape.compute_local_aabb();
        assert_relative_eq!(aabb.mins.x, -2.0, epsilon = 1e-4);
    }

    #[test]
    fn test_missing_mirrored_mesh_skipped() {
        let mut setup = BodySetup::default();
        setup.generate_mirrored_collision = false;
        let setup = setup.with_tri_mesh(TriMeshData::new(
            vec![Vec3::zeros(), Vec3::x(), Vec3::y()],
            MeshIndices::U16(vec![[0, 1, 2]]),
        ));
        assert!(instantiate_shapes(&setup, &Vec3::new(-1.0, 1.0, 1.0)).is_empty());
        assert_eq!(instantiate_shapes(&setup, &Vec3::repeat(1.0)).len(), 1);
    }

    #[test]
    fn test_update_body_scale_rebuilds_sphere() {
        let mut phys = PhysScene::new(CollisionConfig::default()).unwrap();
        let id = phys.create_body(BodyInstance::default());
        let setup = Arc::new(BodySetup::from_geom(
            AggregateGeom::default().with_sphere(Vec3::zeros(), 10.0),
        ));
        phys.init_body(id, setup, &Transform::identity(), BodyOwner::new(ComponentId(3)))
            .unwrap();

        assert!(!phys.update_body_scale(id, &Vec3::repeat(1.0), false).unwrap());
        assert!(phys.update_body_scale(id, &Vec3::new(2.0, 3.0, 4.0), false).unwrap());
        assert_relative_eq!(phys.body(id).unwrap().scale(), Vec3::repeat(2.0));

        let shapes = phys.body(id).unwrap().shapes().to_vec();
        assert_eq!(shapes.len(), 1);
        let scene = phys.scenes().get(0).unwrap().read();
        let (shape, _) = scene.shape_geometry(shapes[0].shape).unwrap();
        assert_relative_eq!(shape.as_ball().unwrap().radius, 20.0);
        assert_eq!(scene.identity(shapes[0].shape).unwrap().component, ComponentId(3));
    }

    #[test]
    fn test_update_body_scale_uninitialized() {
        let mut phys = PhysScene::new(CollisionConfig::default()).unwrap();
        let id = phys.create_body(BodyInstance::default());
        assert!(matches!(
            phys.update_body_scale(id, &Vec3::repeat(2.0), false),
            Err(CollisionError::BodyNotInitialized(_))
        ));
    }
}
