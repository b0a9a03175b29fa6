//! Physics scene: the logical scenes, the body registry and stepping
//!
//! A `PhysScene` owns one `RapierScene` per logical scene ("sync" plus an
//! optional "async" scene), each behind its own `RwLock` so queries from
//! background trace workers can run while the game thread only reads.

use crate::backend::{RapierScene, ShapeMesh};
use crate::body::BodyInstance;
use crate::config::CollisionConfig;
use crate::dispatch::SceneQuery;
use crate::error::{CollisionError, Result};
use crate::identity::{BodyId, ShapeId};
use crate::material::MaterialLibrary;
use crate::math::{Quat, Transform, Vec3};
use crate::observer::{CollisionObserver, NoopObserver};
use crate::shape::{GeometryHandle, QueryGeometry, ShapeKind};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// The logical scenes of a world, indexed 0 (sync) .. N
pub struct SceneSet {
    scenes: Vec<RwLock<RapierScene>>,
}

impl SceneSet {
    pub fn new(count: usize, timestep: f32) -> Self {
        Self {
            scenes: (0..count.max(1))
                .map(|index| RwLock::new(RapierScene::new(index, timestep)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RwLock<RapierScene>> {
        self.scenes.get(index)
    }

    pub fn as_slice(&self) -> &[RwLock<RapierScene>] {
        &self.scenes
    }

    pub(crate) fn scene(&self, index: usize) -> Result<&RwLock<RapierScene>> {
        self.scenes.get(index).ok_or(CollisionError::SceneNotFound(index))
    }
}

/// Contact start/stop between two bodies that asked for notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollisionNotify {
    pub body0: BodyId,
    pub body1: BodyId,
    pub started: bool,
}

/// World-level physics state
pub struct PhysScene {
    pub(crate) config: CollisionConfig,
    pub(crate) scenes: Arc<SceneSet>,
    pub(crate) bodies: HashMap<BodyId, BodyInstance>,
    pub(crate) materials: MaterialLibrary,
    observer: Arc<dyn CollisionObserver>,
    notify_tx: Sender<CollisionNotify>,
    notify_rx: Receiver<CollisionNotify>,
    kinematic_targets: HashMap<BodyId, Transform>,
    static_loading: bool,
    pub(crate) deferred: Vec<BodyId>,
    next_body: u64,
}

impl PhysScene {
    /// Create the scenes described by `config`
    pub fn new(config: CollisionConfig) -> Result<Self> {
        config.validate()?;
        let scenes = Arc::new(SceneSet::new(config.scene_count(), config.timestep));
        let (notify_tx, notify_rx) = crossbeam_channel::unbounded();
        log::debug!("Created physics scene with {} logical scene(s)", scenes.len());

        Ok(Self {
            config,
            scenes,
            bodies: HashMap::new(),
            materials: MaterialLibrary::new(),
            observer: Arc::new(NoopObserver),
            notify_tx,
            notify_rx,
            kinematic_targets: HashMap::new(),
            static_loading: false,
            deferred: Vec::new(),
            next_body: 1,
        })
    }

    /// Replace the observer that receives every converted query result
    pub fn with_observer(mut self, observer: Arc<dyn CollisionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &CollisionConfig {
        &self.config
    }

    pub fn has_async_scene(&self) -> bool {
        self.scenes.len() > 1
    }

    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    /// Shared handle to the scenes, for background query workers
    pub fn scenes(&self) -> &Arc<SceneSet> {
        &self.scenes
    }

    pub fn observer(&self) -> &Arc<dyn CollisionObserver> {
        &self.observer
    }

    /// Query front end over every scene
    pub fn query(&self) -> SceneQuery<'_> {
        SceneQuery::new(self.scenes.as_slice(), &self.config, self.observer.as_ref())
    }

    pub fn materials(&self) -> &MaterialLibrary {
        &self.materials
    }

    pub fn materials_mut(&mut self) -> &mut MaterialLibrary {
        &mut self.materials
    }

    // ==================== Body registry ====================

    /// Register a body; it has no physics state until `init_body`
    pub fn create_body(&mut self, instance: BodyInstance) -> BodyId {
        let id = BodyId::from_raw(self.next_body);
        self.next_body += 1;
        self.bodies.insert(id, instance);
        id
    }

    pub fn body(&self, id: BodyId) -> Option<&BodyInstance> {
        self.bodies.get(&id)
    }

    /// Mutable access to a body's settings; changes to an initialized body
    /// take effect through the matching update call
    pub fn body_mut(&mut self, id: BodyId) -> Option<&mut BodyInstance> {
        self.bodies.get_mut(&id)
    }

    /// Terminate and unregister a body
    pub fn remove_body(&mut self, id: BodyId) -> Option<BodyInstance> {
        if self.bodies.contains_key(&id) {
            self.term_body(id);
        }
        self.kinematic_targets.remove(&id);
        self.bodies.remove(&id)
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub(crate) fn instance(&self, id: BodyId) -> Result<&BodyInstance> {
        self.bodies.get(&id).ok_or(CollisionError::BodyNotFound(id))
    }

    pub(crate) fn instance_mut(&mut self, id: BodyId) -> Result<&mut BodyInstance> {
        self.bodies.get_mut(&id).ok_or(CollisionError::BodyNotFound(id))
    }

    // ==================== Simulation ====================

    /// Advance every scene by `dt` (clamped to the max physics delta time)
    pub fn step(&mut self, dt: f32) {
        let dt = dt.min(self.config.max_physics_delta_time);
        if dt <= 0.0 {
            return;
        }
        let gravity = Vec3::from(self.config.gravity);
        let scenes = Arc::clone(&self.scenes);

        for scene in scenes.as_slice() {
            let mut scene = scene.write();
            let contacts = scene.step(dt, &gravity);

            for contact in contacts {
                let body_of = |shape: ShapeId| scene.identity(shape).and_then(|i| i.body);
                if let (Some(body0), Some(body1)) = (body_of(contact.shape0), body_of(contact.shape1)) {
                    if body0 != body1 {
                        let _ = self.notify_tx.send(CollisionNotify {
                            body0,
                            body1,
                            started: contact.started,
                        });
                    }
                }
            }

            for actor in scene.active_actors() {
                let Some(raw) = scene.body(actor).map(|b| b.user_data as u64) else {
                    continue;
                };
                let Some(body) = self.bodies.get_mut(&BodyId::from_raw(raw)) else {
                    continue;
                };
                if let Some(max_deg) = body.max_angular_velocity {
                    let max_rad = max_deg.to_radians();
                    if let Some(rb) = scene.body_mut(actor) {
                        let angvel = *rb.angvel();
                        let speed = angvel.norm();
                        if speed > max_rad {
                            rb.set_angvel(angvel * (max_rad / speed), false);
                        }
                    }
                }
                if let Some(pose) = scene.actor_pose(actor) {
                    body.transform = Transform::from_isometry(&pose, body.scale);
                }
            }
        }

        // kinematic targets are consumed by the step
        for (id, target) in self.kinematic_targets.drain() {
            if let Some(body) = self.bodies.get_mut(&id) {
                body.transform = target;
            }
        }
    }

    /// Move a kinematic body to `target` over the next step
    pub fn set_kinematic_target(&mut self, id: BodyId, target: &Transform) -> Result<()> {
        if target.contains_nan() {
            log::error!("set_kinematic_target: non-finite target {:?} for body {:?}", target, id);
            return Err(CollisionError::InvalidTransform(format!("{:?}", target)));
        }
        let actors = self.initialized(id)?.actors.clone();
        let pose = target.to_isometry();
        for actor in &actors {
            let mut scene = self.scenes.scene(actor.scene)?.write();
            scene.set_kinematic_target(actor.handle, &pose);
        }
        self.kinematic_targets.insert(id, *target);
        Ok(())
    }

    /// Pending kinematic target of a body, until the next step consumes it
    pub fn kinematic_target(&self, id: BodyId) -> Option<Transform> {
        self.kinematic_targets.get(&id).copied()
    }

    /// Shift the whole world by `offset`
    pub fn apply_world_offset(&mut self, offset: &Vec3) {
        for scene in self.scenes.as_slice() {
            scene.write().apply_world_offset(offset);
        }
        for body in self.bodies.values_mut() {
            body.transform.translation += offset;
        }
        for target in self.kinematic_targets.values_mut() {
            target.translation += offset;
        }
        log::debug!("Applied world offset {:?}", offset);
    }

    /// While loading, shapes of new bodies are held back until the flush
    pub fn set_static_loading(&mut self, loading: bool) {
        self.static_loading = loading;
        if !loading {
            self.flush_deferred_actors();
        }
    }

    pub fn is_static_loading(&self) -> bool {
        self.static_loading
    }

    /// Drain contact notifications collected by previous steps
    pub fn take_collision_notifies(&self) -> Vec<CollisionNotify> {
        self.notify_rx.try_iter().collect()
    }

    // ==================== Geometry ====================

    /// Query geometry matching one shape of a body, with the shape's world position.
    /// Triangle meshes and height fields have no query geometry.
    pub fn geometry_from_shape(&self, scene: usize, shape: ShapeId) -> Option<(GeometryHandle, Vec3)> {
        let scene = self.scenes.get(scene)?.read();
        let record = scene.shape_record(shape)?;
        let (backend, pose) = scene.shape_geometry(shape)?;
        let rotation: Quat = pose.rotation;
        let geometry = match record.kind {
            ShapeKind::Sphere => QueryGeometry::Sphere {
                radius: backend.as_ball()?.radius,
            },
            ShapeKind::Box => QueryGeometry::Box {
                half_extents: backend.as_cuboid()?.half_extents,
            },
            ShapeKind::Capsule => {
                let capsule = backend.as_capsule()?;
                QueryGeometry::Capsule {
                    radius: capsule.radius,
                    half_axis: capsule.half_height(),
                }
            }
            ShapeKind::Convex => match &record.mesh {
                ShapeMesh::Convex { hull, scale } => QueryGeometry::Convex {
                    hull: Arc::clone(hull),
                    scale: *scale,
                },
                _ => return None,
            },
            ShapeKind::TriMesh | ShapeKind::HeightField => return None,
        };
        let handle = GeometryHandle::new(geometry, rotation)?;
        Some((handle, pose.translation.vector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{BodyInstance, BodyOwner};
    use crate::body_setup::{AggregateGeom, BodySetup};
    use crate::identity::ComponentId;
    use approx::assert_relative_eq;

    fn sphere_setup(radius: f32) -> Arc<BodySetup> {
        Arc::new(BodySetup::from_geom(
            AggregateGeom::default().with_sphere(Vec3::zeros(), radius),
        ))
    }

    #[test]
    fn test_scene_count_follows_config() {
        let phys = PhysScene::new(CollisionConfig::default()).unwrap();
        assert!(!phys.has_async_scene());
        assert_eq!(phys.scene_count(), 1);

        let phys = PhysScene::new(CollisionConfig::with_async_scene()).unwrap();
        assert!(phys.has_async_scene());
        assert_eq!(phys.scenes().len(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CollisionConfig::default().with_buffer_sizes(0, 0);
        assert!(matches!(PhysScene::new(config), Err(CollisionError::InvalidConfig(_))));
    }

    #[test]
    fn test_step_moves_simulated_body() {
        let mut phys = PhysScene::new(CollisionConfig::default()).unwrap();
        let id = phys.create_body(BodyInstance::dynamic());
        let tm = Transform::from_translation(Vec3::new(0.0, 0.0, 500.0));
        phys.init_body(id, sphere_setup(10.0), &tm, BodyOwner::new(ComponentId(1)))
            .unwrap();

        for _ in 0..10 {
            phys.step(1.0 / 60.0);
        }
        let moved = phys.world_transform(id).unwrap();
        assert!(moved.translation.z < 500.0);
        assert_relative_eq!(phys.body(id).unwrap().transform.translation, moved.translation, epsilon = 1e-3);
    }

    #[test]
    fn test_kinematic_target_consumed_by_step() {
        let mut phys = PhysScene::new(CollisionConfig::default()).unwrap();
        let id = phys.create_body(BodyInstance::kinematic());
        phys.init_body(id, sphere_setup(10.0), &Transform::identity(), BodyOwner::new(ComponentId(1)))
            .unwrap();

        let target = Transform::from_translation(Vec3::new(100.0, 0.0, 0.0));
        phys.set_kinematic_target(id, &target).unwrap();
        assert_eq!(phys.kinematic_target(id), Some(target));

        phys.step(1.0 / 60.0);
        assert!(phys.kinematic_target(id).is_none());
        let reached = phys.world_transform(id).unwrap();
        assert_relative_eq!(reached.translation, target.translation, epsilon = 1e-3);
    }

    #[test]
    fn test_kinematic_target_rejects_nan() {
        let mut phys = PhysScene::new(CollisionConfig::default()).unwrap();
        let id = phys.create_body(BodyInstance::kinematic());
        phys.init_body(id, sphere_setup(10.0), &Transform::identity(), BodyOwner::new(ComponentId(1)))
            .unwrap();
        let bad = Transform::from_translation(Vec3::new(f32::NAN, 0.0, 0.0));
        assert!(matches!(
            phys.set_kinematic_target(id, &bad),
            Err(CollisionError::InvalidTransform(_))
        ));
    }

    #[test]
    fn test_world_offset_shifts_bodies() {
        let mut phys = PhysScene::new(CollisionConfig::default()).unwrap();
        let id = phys.create_body(BodyInstance::default());
        phys.init_body(id, sphere_setup(10.0), &Transform::identity(), BodyOwner::new(ComponentId(1)))
            .unwrap();
        phys.apply_world_offset(&Vec3::new(0.0, 50.0, 0.0));
        let tm = phys.world_transform(id).unwrap();
        assert_relative_eq!(tm.translation, Vec3::new(0.0, 50.0, 0.0), epsilon = 1e-4);
    }

    #[test]
    fn test_contact_notifications() {
        let mut phys = PhysScene::new(CollisionConfig::default()).unwrap();
        let ground = phys.create_body(BodyInstance::default().with_notify_rigid_body_collision(true));
        phys.init_body(
            ground,
            Arc::new(BodySetup::from_geom(
                AggregateGeom::default().with_box(Vec3::zeros(), Vec3::new(500.0, 500.0, 10.0)),
            )),
            &Transform::identity(),
            BodyOwner::new(ComponentId(1)),
        )
        .unwrap();
        let ball = phys.create_body(BodyInstance::dynamic().with_notify_rigid_body_collision(true));
        phys.init_body(
            ball,
            sphere_setup(10.0),
            &Transform::from_translation(Vec3::new(0.0, 0.0, 25.0)),
            BodyOwner::new(ComponentId(2)),
        )
        .unwrap();

        let mut notifies = Vec::new();
        for _ in 0..60 {
            phys.step(1.0 / 60.0);
            notifies.extend(phys.take_collision_notifies());
        }
        let started = notifies
            .iter()
            .find(|n| n.started)
            .expect("ball reaches the ground");
        let pair = [started.body0, started.body1];
        assert!(pair.contains(&ground) && pair.contains(&ball));
    }

    #[test]
    fn test_geometry_from_sphere_shape() {
        let mut phys = PhysScene::new(CollisionConfig::default()).unwrap();
        let id = phys.create_body(BodyInstance::default());
        let tm = Transform::from_translation(Vec3::new(10.0, 0.0, 0.0));
        phys.init_body(id, sphere_setup(25.0), &tm, BodyOwner::new(ComponentId(1)))
            .unwrap();
        let shape = phys.body(id).unwrap().shapes()[0];
        let (geometry, position) = phys.geometry_from_shape(shape.scene, shape.shape).unwrap();
        assert_eq!(geometry.kind(), ShapeKind::Sphere);
        assert_relative_eq!(position, Vec3::new(10.0, 0.0, 0.0), epsilon = 1e-4);
        match geometry.geometry() {
            QueryGeometry::Sphere { radius } => assert_relative_eq!(*radius, 25.0),
            other => panic!("unexpected geometry {:?}", other),
        }
    }
}
