//! rapier3d scene backend
//!
//! One `RapierScene` is one logical simulation scene. Shapes are rapier
//! colliders whose `user_data` carries the scene-local `ShapeId`; the
//! engine-side record of each shape (filters, kind, mesh data) and its
//! identity live next to the rapier sets.

use super::{
    HitCollector, OverlapCollector, Penetration, QueryRequest, RawHit, RawHits, RawOverlap, RawOverlaps,
    SceneBackend, ShapeData, ShapeMesh, Triangle3,
};
use crate::filter::{FilterData, FilterFlags, HitType};
use crate::identity::{ShapeId, ShapeIdentity, ShapeIdentityTable};
use crate::material::CombineRule;
use crate::math::{to_point, Transform, Vec3};
use crate::shape::{GeometryHandle, ShapeKind};
use rapier3d::na::Isometry3;
use rapier3d::parry::bounding_volume::{Aabb, BoundingVolume};
use rapier3d::parry::mass_properties::MassProperties;
use rapier3d::parry::query::{self as parry_query, PointQuery, RayCast, ShapeCastOptions, ShapeCastStatus};
use rapier3d::parry::shape::{FeatureId, Shape, Triangle};
use rapier3d::prelude as rapier;
use std::collections::HashMap;

/// How an actor moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorKind {
    Static,
    Dynamic,
    Kinematic,
}

impl From<ActorKind> for rapier::RigidBodyType {
    fn from(kind: ActorKind) -> Self {
        match kind {
            ActorKind::Static => rapier::RigidBodyType::Fixed,
            ActorKind::Dynamic => rapier::RigidBodyType::Dynamic,
            ActorKind::Kinematic => rapier::RigidBodyType::KinematicPositionBased,
        }
    }
}

/// Description of a shape to attach to an actor
#[derive(Debug, Clone)]
pub struct ShapeDesc {
    /// Backend shape with any scale already applied
    pub shape: rapier::SharedShape,
    /// Pose relative to the actor
    pub local_pose: Isometry3<f32>,
    pub kind: ShapeKind,
    pub mesh: ShapeMesh,
    pub identity: ShapeIdentity,
    pub query_filter: FilterData,
    pub sim_filter: FilterData,
    pub query_enabled: bool,
    pub sim_enabled: bool,
    pub friction: f32,
    pub restitution: f32,
    pub friction_combine: CombineRule,
    pub restitution_combine: CombineRule,
}

impl ShapeDesc {
    pub fn new(shape: rapier::SharedShape, kind: ShapeKind) -> Self {
        Self {
            shape,
            local_pose: Isometry3::identity(),
            kind,
            mesh: ShapeMesh::None,
            identity: ShapeIdentity::default(),
            query_filter: FilterData::default(),
            sim_filter: FilterData::default(),
            query_enabled: true,
            sim_enabled: true,
            friction: 0.7,
            restitution: 0.3,
            friction_combine: CombineRule::Average,
            restitution_combine: CombineRule::Average,
        }
    }

    pub fn with_local_pose(mut self, pose: Isometry3<f32>) -> Self {
        self.local_pose = pose;
        self
    }

    pub fn with_filters(mut self, query: FilterData, sim: FilterData) -> Self {
        self.query_filter = query;
        self.sim_filter = sim;
        self
    }

    pub fn with_identity(mut self, identity: ShapeIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_mesh(mut self, mesh: ShapeMesh) -> Self {
        self.mesh = mesh;
        self
    }
}

/// Engine-side bookkeeping for one collider
#[derive(Debug, Clone)]
pub struct ShapeRecord {
    pub actor: rapier::RigidBodyHandle,
    pub kind: ShapeKind,
    pub mesh: ShapeMesh,
    pub query_filter: FilterData,
    pub sim_filter: FilterData,
    pub query_enabled: bool,
    pub sim_enabled: bool,
}

/// Contact start/stop between two notifying shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeContact {
    pub shape0: ShapeId,
    pub shape1: ShapeId,
    pub started: bool,
}

/// Simulation groups derived from a shape's sim filter: members of their
/// object type, colliding with the channels they block.
fn sim_groups(sim_filter: &FilterData, enabled: bool) -> rapier::InteractionGroups {
    if !enabled {
        return rapier::InteractionGroups::none();
    }
    let membership = sim_filter
        .channel()
        .map(|c| c.bit())
        .unwrap_or(0);
    rapier::InteractionGroups::new(
        rapier::Group::from_bits_truncate(membership),
        rapier::Group::from_bits_truncate(sim_filter.word1),
    )
}

fn active_events(sim_filter: &FilterData) -> rapier::ActiveEvents {
    if sim_filter.flags().contains(FilterFlags::CONTACT_NOTIFY) {
        rapier::ActiveEvents::COLLISION_EVENTS
    } else {
        rapier::ActiveEvents::empty()
    }
}

/// One logical simulation scene backed by rapier3d
pub struct RapierScene {
    index: usize,
    pipeline: rapier::PhysicsPipeline,
    integration_params: rapier::IntegrationParameters,
    islands: rapier::IslandManager,
    broad_phase: rapier::DefaultBroadPhase,
    narrow_phase: rapier::NarrowPhase,
    impulse_joints: rapier::ImpulseJointSet,
    multibody_joints: rapier::MultibodyJointSet,
    ccd_solver: rapier::CCDSolver,
    query_pipeline: rapier::QueryPipeline,
    bodies: rapier::RigidBodySet,
    colliders: rapier::ColliderSet,
    records: HashMap<ShapeId, ShapeRecord>,
    handles: HashMap<ShapeId, rapier::ColliderHandle>,
    identities: ShapeIdentityTable,
    next_shape: u64,
}

impl RapierScene {
    /// Create an empty scene
    pub fn new(index: usize, timestep: f32) -> Self {
        let mut integration_params = rapier::IntegrationParameters::default();
        integration_params.dt = timestep;

        Self {
            index,
            pipeline: rapier::PhysicsPipeline::new(),
            integration_params,
            islands: rapier::IslandManager::new(),
            broad_phase: rapier::DefaultBroadPhase::new(),
            narrow_phase: rapier::NarrowPhase::new(),
            impulse_joints: rapier::ImpulseJointSet::new(),
            multibody_joints: rapier::MultibodyJointSet::new(),
            ccd_solver: rapier::CCDSolver::new(),
            query_pipeline: rapier::QueryPipeline::new(),
            bodies: rapier::RigidBodySet::new(),
            colliders: rapier::ColliderSet::new(),
            records: HashMap::new(),
            handles: HashMap::new(),
            identities: ShapeIdentityTable::new(),
            next_shape: 1,
        }
    }

    /// Position of this scene in its scene set (0 = sync)
    pub fn index(&self) -> usize {
        self.index
    }

    // ==================== Actors ====================

    /// Create an actor; `user_data` is the owning body's raw id
    pub fn create_actor(&mut self, kind: ActorKind, pose: &Transform, user_data: u64) -> rapier::RigidBodyHandle {
        let builder = rapier::RigidBodyBuilder::new(kind.into())
            .position(pose.to_isometry())
            .user_data(user_data as u128);
        self.bodies.insert(builder)
    }

    /// Remove an actor and every shape on it; returns the removed shapes
    pub fn remove_actor(&mut self, actor: rapier::RigidBodyHandle) -> Vec<ShapeId> {
        let shapes = self.actor_shapes(actor);
        for shape in &shapes {
            self.forget_shape(*shape);
        }
        self.bodies.remove(
            actor,
            &mut self.islands,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );
        self.sync_query_pipeline();
        shapes
    }

    pub fn has_actor(&self, actor: rapier::RigidBodyHandle) -> bool {
        self.bodies.contains(actor)
    }

    pub fn actor_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn body(&self, actor: rapier::RigidBodyHandle) -> Option<&rapier::RigidBody> {
        self.bodies.get(actor)
    }

    pub fn body_mut(&mut self, actor: rapier::RigidBodyHandle) -> Option<&mut rapier::RigidBody> {
        self.bodies.get_mut(actor)
    }

    /// Change how an actor moves
    pub fn set_actor_kind(&mut self, actor: rapier::RigidBodyHandle, kind: ActorKind) {
        if let Some(body) = self.bodies.get_mut(actor) {
            body.set_body_type(kind.into(), true);
        }
    }

    /// World pose of an actor
    pub fn actor_pose(&self, actor: rapier::RigidBodyHandle) -> Option<Isometry3<f32>> {
        self.bodies.get(actor).map(|b| *b.position())
    }

    /// Teleport an actor, moving its shapes with it
    pub fn set_actor_pose(&mut self, actor: rapier::RigidBodyHandle, pose: &Isometry3<f32>) {
        let Some(body) = self.bodies.get_mut(actor) else {
            return;
        };
        body.set_position(*pose, true);
        let colliders: Vec<rapier::ColliderHandle> = body.colliders().to_vec();
        for handle in colliders {
            if let Some(collider) = self.colliders.get_mut(handle) {
                let local = collider.position_wrt_parent().copied().unwrap_or_else(Isometry3::identity);
                collider.set_position(pose * local);
            }
        }
        self.sync_query_pipeline();
    }

    /// Target pose for a kinematic actor, reached on the next step
    pub fn set_kinematic_target(&mut self, actor: rapier::RigidBodyHandle, pose: &Isometry3<f32>) {
        if let Some(body) = self.bodies.get_mut(actor) {
            body.set_next_kinematic_position(*pose);
        }
    }

    /// Shift every actor by `offset`
    pub fn apply_world_offset(&mut self, offset: &Vec3) {
        let actors: Vec<rapier::RigidBodyHandle> = self.bodies.iter().map(|(h, _)| h).collect();
        for actor in actors {
            if let Some(mut pose) = self.actor_pose(actor) {
                pose.translation.vector += offset;
                self.set_actor_pose(actor, &pose);
            }
        }
    }

    // ==================== Shapes ====================

    /// Attach a shape to an actor and register its identity
    pub fn attach_shape(&mut self, actor: rapier::RigidBodyHandle, desc: ShapeDesc) -> Option<ShapeId> {
        if !self.bodies.contains(actor) {
            return None;
        }
        let id = ShapeId(self.next_shape);
        self.next_shape += 1;

        let groups = sim_groups(&desc.sim_filter, desc.sim_enabled);
        let collider = rapier::ColliderBuilder::new(desc.shape)
            .position(desc.local_pose)
            .density(0.0)
            .friction(desc.friction)
            .restitution(desc.restitution)
            .friction_combine_rule(desc.friction_combine.to_rapier())
            .restitution_combine_rule(desc.restitution_combine.to_rapier())
            .collision_groups(groups)
            .solver_groups(groups)
            .active_events(active_events(&desc.sim_filter))
            .user_data(id.0 as u128)
            .build();
        let handle = self.colliders.insert_with_parent(collider, actor, &mut self.bodies);

        self.handles.insert(id, handle);
        self.records.insert(
            id,
            ShapeRecord {
                actor,
                kind: desc.kind,
                mesh: desc.mesh,
                query_filter: desc.query_filter,
                sim_filter: desc.sim_filter,
                query_enabled: desc.query_enabled,
                sim_enabled: desc.sim_enabled,
            },
        );
        self.identities.insert(id, desc.identity);
        self.sync_query_pipeline();
        Some(id)
    }

    /// Remove one shape
    pub fn detach_shape(&mut self, shape: ShapeId) -> Option<ShapeRecord> {
        let handle = self.handles.get(&shape).copied()?;
        let record = self.forget_shape(shape);
        self.colliders.remove(handle, &mut self.islands, &mut self.bodies, true);
        self.sync_query_pipeline();
        record
    }

    fn forget_shape(&mut self, shape: ShapeId) -> Option<ShapeRecord> {
        self.handles.remove(&shape);
        self.identities.remove(shape);
        self.records.remove(&shape)
    }

    /// Shapes attached to an actor, in attachment order
    pub fn actor_shapes(&self, actor: rapier::RigidBodyHandle) -> Vec<ShapeId> {
        self.bodies
            .get(actor)
            .map(|body| {
                body.colliders()
                    .iter()
                    .filter_map(|h| self.colliders.get(*h))
                    .map(|c| ShapeId(c.user_data as u64))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn shape_record(&self, shape: ShapeId) -> Option<&ShapeRecord> {
        self.records.get(&shape)
    }

    pub fn identity(&self, shape: ShapeId) -> Option<&ShapeIdentity> {
        self.identities.get(shape)
    }

    pub fn identity_mut(&mut self, shape: ShapeId) -> Option<&mut ShapeIdentity> {
        self.identities.get_mut(shape)
    }

    pub fn shape_count(&self) -> usize {
        self.records.len()
    }

    /// Backend shape and world pose of a shape
    pub fn shape_geometry(&self, shape: ShapeId) -> Option<(&rapier::SharedShape, Isometry3<f32>)> {
        let collider = self.collider(shape)?;
        Some((collider.shared_shape(), *collider.position()))
    }

    /// Pose of a shape relative to its actor
    pub fn shape_local_pose(&self, shape: ShapeId) -> Option<Isometry3<f32>> {
        self.collider(shape)?.position_wrt_parent().copied()
    }

    /// Replace query and simulation filters of a shape
    pub fn set_shape_filters(
        &mut self,
        shape: ShapeId,
        query_filter: FilterData,
        sim_filter: FilterData,
        query_enabled: bool,
        sim_enabled: bool,
    ) -> bool {
        let Some(handle) = self.handles.get(&shape).copied() else {
            return false;
        };
        let Some(record) = self.records.get_mut(&shape) else {
            return false;
        };
        record.query_filter = query_filter;
        record.sim_filter = sim_filter;
        record.query_enabled = query_enabled;
        record.sim_enabled = sim_enabled;
        if let Some(collider) = self.colliders.get_mut(handle) {
            let groups = sim_groups(&sim_filter, sim_enabled);
            collider.set_collision_groups(groups);
            collider.set_solver_groups(groups);
            collider.set_active_events(active_events(&sim_filter));
        }
        true
    }

    /// Update the surface properties of a shape
    pub fn set_shape_surface(
        &mut self,
        shape: ShapeId,
        friction: f32,
        restitution: f32,
        friction_combine: CombineRule,
        restitution_combine: CombineRule,
    ) {
        if let Some(collider) = self.collider_mut(shape) {
            collider.set_friction(friction);
            collider.set_restitution(restitution);
            collider.set_friction_combine_rule(friction_combine.to_rapier());
            collider.set_restitution_combine_rule(restitution_combine.to_rapier());
        }
    }

    fn collider(&self, shape: ShapeId) -> Option<&rapier::Collider> {
        self.handles.get(&shape).and_then(|h| self.colliders.get(*h))
    }

    fn collider_mut(&mut self, shape: ShapeId) -> Option<&mut rapier::Collider> {
        let handle = *self.handles.get(&shape)?;
        self.colliders.get_mut(handle)
    }

    fn record_for(&self, handle: rapier::ColliderHandle) -> Option<(ShapeId, &ShapeRecord)> {
        let collider = self.colliders.get(handle)?;
        let id = ShapeId(collider.user_data as u64);
        self.records.get(&id).map(|r| (id, r))
    }

    fn prefilter(&self, shape: ShapeId, record: &ShapeRecord, request: &QueryRequest<'_>) -> HitType {
        if !record.query_enabled {
            return HitType::Ignore;
        }
        request
            .callback
            .pre_filter(&request.filter, &record.query_filter, self.identities.get(shape))
    }

    // ==================== Simulation ====================

    /// Rebuild the query acceleration structure from current collider poses
    pub fn sync_query_pipeline(&mut self) {
        self.query_pipeline.update(&self.colliders);
    }

    /// Advance the simulation by `dt` and report contacts between notifying shapes
    pub fn step(&mut self, dt: f32, gravity: &Vec3) -> Vec<ShapeContact> {
        self.integration_params.dt = dt;

        let (collision_send, collision_recv) = crossbeam_channel::unbounded();
        let event_handler = ChannelEventCollector {
            collision_events: collision_send,
        };

        self.pipeline.step(
            gravity,
            &self.integration_params,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            None,
            &(),
            &event_handler,
        );
        self.sync_query_pipeline();

        let mut contacts = Vec::new();
        while let Ok(event) = collision_recv.try_recv() {
            let (h1, h2, started) = match event {
                rapier::CollisionEvent::Started(h1, h2, _) => (h1, h2, true),
                rapier::CollisionEvent::Stopped(h1, h2, _) => (h1, h2, false),
            };
            // stopped events may name colliders removed during the step
            let shape_of = |h| self.colliders.get(h).map(|c: &rapier::Collider| ShapeId(c.user_data as u64));
            if let (Some(shape0), Some(shape1)) = (shape_of(h1), shape_of(h2)) {
                contacts.push(ShapeContact {
                    shape0,
                    shape1,
                    started,
                });
            }
        }
        contacts
    }

    /// Dynamic actors that are awake
    pub fn active_actors(&self) -> Vec<rapier::RigidBodyHandle> {
        self.islands.active_dynamic_bodies().to_vec()
    }

    // ==================== Per-shape queries ====================

    /// Ray against a single shape
    pub fn raycast_shape(&self, shape: ShapeId, origin: &Vec3, dir: &Vec3, max_distance: f32) -> Option<RawHit> {
        let collider = self.collider(shape)?;
        let record = self.records.get(&shape)?;
        let ray = rapier::Ray::new(to_point(origin), *dir);
        let hit = collider
            .shape()
            .cast_ray_and_get_normal(collider.position(), &ray, max_distance, true)?;
        Some(self.ray_hit(shape, record, &ray, hit, HitType::Block))
    }

    /// Sweep against a single shape
    pub fn sweep_shape(
        &self,
        shape: ShapeId,
        geometry: &GeometryHandle,
        origin: &Vec3,
        dir: &Vec3,
        max_distance: f32,
        compute_mtd: bool,
    ) -> Option<RawHit> {
        let collider = self.collider(shape)?;
        let record = self.records.get(&shape)?;
        let pose = geometry.pose_at(origin);
        self.cast_against(collider, shape, record, geometry, &pose, dir, max_distance, compute_mtd, HitType::Block)
    }

    /// Whether `geometry` at `position` overlaps a single shape
    pub fn overlap_shape(&self, shape: ShapeId, geometry: &GeometryHandle, position: &Vec3) -> bool {
        let Some(collider) = self.collider(shape) else {
            return false;
        };
        parry_query::intersection_test(
            collider.position(),
            collider.shape(),
            &geometry.pose_at(position),
            geometry.shape().as_ref(),
        )
        .unwrap_or(false)
    }

    /// Distance from `point` to a shape and the closest point on it
    pub fn shape_distance(&self, shape: ShapeId, point: &Vec3) -> Option<(f32, Vec3)> {
        let collider = self.collider(shape)?;
        let projection = collider
            .shape()
            .project_point(collider.position(), &to_point(point), true);
        if projection.is_inside {
            return Some((0.0, *point));
        }
        let closest = projection.point.coords;
        Some(((closest - point).norm(), closest))
    }

    /// Mass properties of a shape at `density`, in its actor's frame
    pub fn shape_mass_properties(&self, shape: ShapeId, density: f32) -> Option<MassProperties> {
        let collider = self.collider(shape)?;
        let local = collider.position_wrt_parent().copied().unwrap_or_else(Isometry3::identity);
        Some(collider.shape().mass_properties(density).transform_by(&local))
    }

    /// Replace the mass properties of an actor
    pub fn set_mass_properties(&mut self, actor: rapier::RigidBodyHandle, props: MassProperties) {
        if let Some(body) = self.bodies.get_mut(actor) {
            body.set_additional_mass_properties(props, true);
            body.recompute_mass_properties_from_colliders(&self.colliders);
        }
    }

    fn ray_hit(
        &self,
        shape: ShapeId,
        record: &ShapeRecord,
        ray: &rapier::Ray,
        hit: rapier::RayIntersection,
        hit_type: HitType,
    ) -> RawHit {
        let face_index = match record.kind {
            ShapeKind::TriMesh | ShapeKind::HeightField => self.mesh_face(shape, hit.feature),
            _ => None,
        };
        RawHit {
            shape,
            distance: hit.time_of_impact,
            position: ray.point_at(hit.time_of_impact).coords,
            normal: hit.normal,
            face_index,
            initial_overlap: hit.time_of_impact <= 0.0,
            penetration_depth: 0.0,
            hit_type,
        }
    }

    /// Triangle index of a mesh feature; back-face ids fold onto the front face
    fn mesh_face(&self, shape: ShapeId, feature: FeatureId) -> Option<u32> {
        let FeatureId::Face(id) = feature else {
            return None;
        };
        let collider = self.collider(shape)?;
        match collider.shape().as_trimesh() {
            Some(mesh) => {
                let count = mesh.indices().len() as u32;
                (count > 0).then(|| id % count)
            }
            None => Some(id),
        }
    }

    fn starts_inside(&self, collider: &rapier::Collider, geometry: &GeometryHandle, pose: &Isometry3<f32>) -> bool {
        parry_query::intersection_test(collider.position(), collider.shape(), pose, geometry.shape().as_ref())
            .unwrap_or(false)
    }

    #[allow(clippy::too_many_arguments)]
    fn cast_against(
        &self,
        collider: &rapier::Collider,
        shape: ShapeId,
        record: &ShapeRecord,
        geometry: &GeometryHandle,
        pose: &Isometry3<f32>,
        dir: &Vec3,
        max_distance: f32,
        compute_mtd: bool,
        hit_type: HitType,
    ) -> Option<RawHit> {
        let options = ShapeCastOptions {
            max_time_of_impact: max_distance,
            target_distance: 0.0,
            stop_at_penetration: true,
            compute_impact_geometry_on_penetration: compute_mtd,
        };
        let world = collider.position();
        let cast = match parry_query::cast_shapes(
            world,
            &Vec3::zeros(),
            collider.shape(),
            pose,
            dir,
            geometry.shape().as_ref(),
            options,
        ) {
            Ok(cast) => cast,
            Err(_) => {
                log::trace!("Scene {}: unsupported sweep pair for shape {:?}", self.index, shape);
                None
            }
        };

        let (initial_overlap, time_of_impact, witness, mut normal) = match cast {
            Some(cast) => (
                cast.status == ShapeCastStatus::PenetratingOrWithinTargetDist || cast.time_of_impact <= 0.0,
                cast.time_of_impact,
                cast.witness1,
                world * cast.normal1.into_inner(),
            ),
            // a start inside the shape moving outward never impacts
            None if self.starts_inside(collider, geometry, pose) => (
                true,
                0.0,
                world.inverse_transform_point(&to_point(&pose.translation.vector)),
                Vec3::zeros(),
            ),
            None => return None,
        };
        let mut position = (world * witness).coords;
        let mut penetration_depth = 0.0;

        if initial_overlap {
            let contact = if compute_mtd {
                parry_query::contact(world, collider.shape(), pose, geometry.shape().as_ref(), 0.0)
                    .ok()
                    .flatten()
            } else {
                None
            };
            match contact {
                Some(contact) if contact.dist < 0.0 => {
                    normal = contact.normal1.into_inner();
                    position = contact.point1.coords;
                    penetration_depth = -contact.dist;
                }
                _ => {
                    // unknown normal; the converters recover one
                    normal = Vec3::zeros();
                    position = pose.translation.vector;
                }
            }
        }

        let face_index = match record.kind {
            ShapeKind::TriMesh | ShapeKind::HeightField => {
                let (_, feature) = collider.shape().project_local_point_and_get_feature(&witness);
                self.mesh_face(shape, feature)
            }
            _ => None,
        };

        Some(RawHit {
            shape,
            distance: if initial_overlap { 0.0 } else { time_of_impact },
            position,
            normal,
            face_index,
            initial_overlap,
            penetration_depth,
            hit_type,
        })
    }
}

impl SceneBackend for RapierScene {
    fn raycast(&self, origin: &Vec3, dir: &Vec3, max_distance: f32, request: &QueryRequest<'_>) -> RawHits {
        let ray = rapier::Ray::new(to_point(origin), *dir);
        let mut collector = HitCollector::new(request.mode, request.buffer_size);
        self.query_pipeline.intersections_with_ray(
            &self.bodies,
            &self.colliders,
            &ray,
            max_distance,
            true,
            rapier::QueryFilter::default(),
            |handle, intersection| {
                let Some((shape, record)) = self.record_for(handle) else {
                    return true;
                };
                let hit_type = self.prefilter(shape, record, request);
                if hit_type == HitType::Ignore {
                    return true;
                }
                collector.push(self.ray_hit(shape, record, &ray, intersection, hit_type))
            },
        );
        collector.finish()
    }

    fn sweep(
        &self,
        geometry: &GeometryHandle,
        origin: &Vec3,
        dir: &Vec3,
        max_distance: f32,
        request: &QueryRequest<'_>,
    ) -> RawHits {
        let start = geometry.pose_at(origin);
        let end = geometry.pose_at(&(origin + dir * max_distance));
        let swept: Aabb = geometry
            .shape()
            .compute_aabb(&start)
            .merged(&geometry.shape().compute_aabb(&end));

        let mut candidates = Vec::new();
        self.query_pipeline
            .colliders_with_aabb_intersecting_aabb(&swept, |handle| {
                candidates.push(*handle);
                true
            });

        let mut collector = HitCollector::new(request.mode, request.buffer_size);
        for handle in candidates {
            let Some(collider) = self.colliders.get(handle) else {
                continue;
            };
            let Some((shape, record)) = self.record_for(handle) else {
                continue;
            };
            let prefilter = self.prefilter(shape, record, request);
            if prefilter == HitType::Ignore {
                continue;
            }
            let Some(mut hit) = self.cast_against(
                collider,
                shape,
                record,
                geometry,
                &start,
                dir,
                max_distance,
                request.compute_mtd,
                prefilter,
            ) else {
                continue;
            };
            if hit.initial_overlap && request.callback.discard_initial_overlaps {
                continue;
            }
            if request.post_filter {
                hit.hit_type = request.callback.post_filter(prefilter, hit.initial_overlap);
            }
            if !collector.push(hit) {
                break;
            }
        }
        collector.finish()
    }

    fn overlap(&self, geometry: &GeometryHandle, position: &Vec3, request: &QueryRequest<'_>) -> RawOverlaps {
        let pose = geometry.pose_at(position);
        let mut collector = OverlapCollector::new(request.mode, request.buffer_size);
        self.query_pipeline.intersections_with_shape(
            &self.bodies,
            &self.colliders,
            &pose,
            geometry.shape().as_ref(),
            rapier::QueryFilter::default(),
            |handle| {
                let Some((shape, record)) = self.record_for(handle) else {
                    return true;
                };
                let hit_type = self.prefilter(shape, record, request);
                if hit_type == HitType::Ignore {
                    return true;
                }
                collector.push(RawOverlap { shape, hit_type })
            },
        );
        collector.finish()
    }

    fn shape_data(&self, shape: ShapeId) -> Option<ShapeData> {
        let record = self.records.get(&shape)?;
        let collider = self.collider(shape)?;
        let scale = match &record.mesh {
            ShapeMesh::Convex { scale, .. } | ShapeMesh::TriMesh { scale, .. } => *scale,
            ShapeMesh::None => Vec3::repeat(1.0),
        };
        Some(ShapeData {
            identity: self.identities.get(shape).cloned().unwrap_or_default(),
            query_filter: record.query_filter,
            kind: record.kind,
            pose: Transform::from_isometry(collider.position(), scale),
            mesh: record.mesh.clone(),
        })
    }

    fn penetration(&self, shape: ShapeId, geometry: &GeometryHandle, position: &Vec3) -> Option<Penetration> {
        let collider = self.collider(shape)?;
        let contact = parry_query::contact(
            collider.position(),
            collider.shape(),
            &geometry.pose_at(position),
            geometry.shape().as_ref(),
            0.0,
        )
        .ok()
        .flatten()?;
        (contact.dist < 0.0).then(|| Penetration {
            normal: contact.normal1.into_inner(),
            depth: -contact.dist,
        })
    }

    fn overlapping_triangles(
        &self,
        shape: ShapeId,
        geometry: &GeometryHandle,
        position: &Vec3,
        max: usize,
    ) -> Vec<Triangle3> {
        let Some(collider) = self.collider(shape) else {
            return Vec::new();
        };
        let world = collider.position();
        let query_pose = geometry.pose_at(position);
        let local_query = world.inv_mul(&query_pose);
        let local_aabb = geometry.shape().compute_aabb(&local_query);
        let query_shape = geometry.shape().as_ref();

        let mut triangles = Vec::new();
        let mut accept = |tri: &Triangle| {
            if triangles.len() >= max || !tri.local_aabb().intersects(&local_aabb) {
                return;
            }
            let touching = parry_query::intersection_test(&Isometry3::identity(), tri, &local_query, query_shape)
                .unwrap_or(false);
            if touching {
                triangles.push([
                    (world * tri.a).coords,
                    (world * tri.b).coords,
                    (world * tri.c).coords,
                ]);
            }
        };

        if let Some(mesh) = collider.shape().as_trimesh() {
            for tri in mesh.triangles() {
                accept(&tri);
            }
        } else if let Some(field) = collider.shape().as_heightfield() {
            field.map_elements_in_local_aabb(&local_aabb, &mut |_, tri| accept(tri));
        }
        triangles
    }

    fn closest_point(&self, shape: ShapeId, point: &Vec3) -> Option<Vec3> {
        self.shape_distance(shape, point).map(|(_, p)| p)
    }

    fn bounds_center(&self, shape: ShapeId) -> Option<Vec3> {
        self.collider(shape).map(|c| c.compute_aabb().center().coords)
    }

    fn height_field_face_normal(&self, shape: ShapeId, face_index: u32, near: &Vec3) -> Option<Vec3> {
        let collider = self.collider(shape)?;
        let field = collider.shape().as_heightfield()?;
        let world = collider.position();
        let triangles = field.nrows() * field.ncols() * 2;
        let indexed = ((face_index as usize) < triangles)
            .then(|| field.triangle_at_id(face_index))
            .flatten();
        let triangle = match indexed {
            Some(triangle) => triangle,
            // unknown id: the triangle under the hit point
            None => {
                let local = world.inverse_transform_point(&to_point(near));
                let (i, j) = field.cell_at_point(&local)?;
                let (first, second) = field.triangles_at(i, j);
                [first, second].into_iter().flatten().min_by(|a, b| {
                    let da = a.distance_to_local_point(&local, true);
                    let db = b.distance_to_local_point(&local, true);
                    da.total_cmp(&db)
                })?
            }
        };
        let normal = triangle.normal()?.into_inner();
        // height field triangles face up in local space
        let normal = if normal.y < 0.0 { -normal } else { normal };
        Some(world * normal)
    }
}

/// Channel-based collision event collector for rapier
struct ChannelEventCollector {
    collision_events: crossbeam_channel::Sender<rapier::CollisionEvent>,
}

impl rapier::EventHandler for ChannelEventCollector {
    fn handle_collision_event(
        &self,
        _bodies: &rapier::RigidBodySet,
        _colliders: &rapier::ColliderSet,
        event: rapier::CollisionEvent,
        _contact_pair: Option<&rapier::ContactPair>,
    ) {
        let _ = self.collision_events.send(event);
    }

    fn handle_contact_force_event(
        &self,
        _dt: f32,
        _bodies: &rapier::RigidBodySet,
        _colliders: &rapier::ColliderSet,
        _contact_pair: &rapier::ContactPair,
        _total_force_magnitude: f32,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueryMode;
    use crate::filter::{CollisionChannel, QueryFilterCallback, ResponseContainer};
    use crate::shape::{adapt_shape, CollisionShape};
    use crate::math::Quat;
    use approx::assert_relative_eq;

    fn static_filter() -> FilterData {
        FilterData::shape(
            CollisionChannel::WorldStatic,
            &ResponseContainer::default(),
            0,
            FilterFlags::SIMPLE_COLLISION | FilterFlags::STATIC_SHAPE,
        )
    }

    fn scene_with_box() -> (RapierScene, ShapeId) {
        let mut scene = RapierScene::new(0, 1.0 / 60.0);
        let actor = scene.create_actor(ActorKind::Static, &Transform::identity(), 1);
        let desc = ShapeDesc::new(rapier::SharedShape::cuboid(50.0, 50.0, 50.0), ShapeKind::Box)
            .with_filters(static_filter(), static_filter());
        let shape = scene.attach_shape(actor, desc).unwrap();
        (scene, shape)
    }

    fn trace_request(mode: QueryMode) -> QueryRequest<'static> {
        let filter = FilterData::trace_query(CollisionChannel::Visibility, &ResponseContainer::default(), 0, false);
        QueryRequest::new(filter, QueryFilterCallback::default(), mode, 16)
    }

    #[test]
    fn test_raycast_hits_box_top() {
        let (scene, shape) = scene_with_box();
        let hits = scene.raycast(
            &Vec3::new(0.0, 0.0, 100.0),
            &Vec3::new(0.0, 0.0, -1.0),
            200.0,
            &trace_request(QueryMode::Single),
        );
        let block = hits.block.expect("blocking hit");
        assert_eq!(block.shape, shape);
        assert_relative_eq!(block.distance, 50.0, epsilon = 1e-3);
        assert_relative_eq!(block.normal, Vec3::z(), epsilon = 1e-4);
        assert!(!block.initial_overlap);
    }

    #[test]
    fn test_sweep_reports_initial_overlap() {
        let (scene, _) = scene_with_box();
        let geometry = adapt_shape(&Quat::identity(), &CollisionShape::sphere(5.0));
        let mut request = trace_request(QueryMode::Single);
        request.compute_mtd = true;
        let hits = scene.sweep(&geometry, &Vec3::new(0.0, 0.0, 48.0), &Vec3::x(), 10.0, &request);
        let block = hits.block.expect("overlapping hit");
        assert!(block.initial_overlap);
        assert_relative_eq!(block.distance, 0.0);
        assert!(block.penetration_depth > 0.0);
        assert_relative_eq!(block.normal, Vec3::z(), epsilon = 1e-3);
    }

    #[test]
    fn test_sweep_from_inside_moving_out() {
        let (scene, shape) = scene_with_box();
        let geometry = adapt_shape(&Quat::identity(), &CollisionShape::sphere(5.0));
        let request = trace_request(QueryMode::Single);
        // fully contained and leaving: no impact along the path, still an initial overlap
        let hits = scene.sweep(&geometry, &Vec3::zeros(), &Vec3::x(), 100.0, &request);
        let block = hits.block.expect("contained start");
        assert_eq!(block.shape, shape);
        assert!(block.initial_overlap);
        assert_eq!(block.distance, 0.0);
        assert_eq!(block.normal, Vec3::zeros());

        let direct = scene.sweep_shape(shape, &geometry, &Vec3::zeros(), &Vec3::x(), 100.0, true);
        let direct = direct.expect("contained start");
        assert!(direct.initial_overlap);
        assert!(direct.penetration_depth > 0.0);

        let clear = scene.sweep(&geometry, &Vec3::new(0.0, 0.0, 200.0), &Vec3::x(), 100.0, &request);
        assert!(clear.is_empty());
    }

    #[test]
    fn test_height_field_normal_by_face_index() {
        let mut scene = RapierScene::new(0, 1.0 / 60.0);
        let actor = scene.create_actor(ActorKind::Static, &Transform::identity(), 3);
        // one cell rising 10 along +X over a width of 20
        let heights = rapier3d::na::DMatrix::from_row_slice(2, 2, &[0.0, 10.0, 0.0, 10.0]);
        let field = rapier::SharedShape::heightfield(heights, Vec3::new(20.0, 1.0, 20.0));
        let shape = scene
            .attach_shape(
                actor,
                ShapeDesc::new(field, ShapeKind::HeightField).with_filters(static_filter(), static_filter()),
            )
            .unwrap();
        let expected = Vec3::new(-0.5, 1.0, 0.0).normalize();

        let far = Vec3::new(500.0, 500.0, 500.0);
        for face in 0..2 {
            let normal = scene.height_field_face_normal(shape, face, &far).expect("indexed face");
            assert_relative_eq!(normal, expected, epsilon = 1e-4);
        }
        let near = scene.height_field_face_normal(shape, 99, &Vec3::new(0.0, 5.0, 0.0));
        assert_relative_eq!(near.expect("point lookup"), expected, epsilon = 1e-4);
        assert!(scene.height_field_face_normal(shape, 99, &far).is_none());
    }

    #[test]
    fn test_overlap_and_detach() {
        let (mut scene, shape) = scene_with_box();
        let geometry = adapt_shape(&Quat::identity(), &CollisionShape::cuboid(5.0, 5.0, 5.0));
        let request = trace_request(QueryMode::Multi);
        let found = scene.overlap(&geometry, &Vec3::new(0.0, 0.0, 52.0), &request);
        assert_eq!(found.overlaps.len(), 1);
        assert!(scene.shape_data(shape).is_some());

        scene.detach_shape(shape);
        assert!(scene.overlap(&geometry, &Vec3::new(0.0, 0.0, 52.0), &request).is_empty());
        assert!(scene.identity(shape).is_none());
    }

    #[test]
    fn test_disabled_query_shape_is_invisible() {
        let (mut scene, shape) = scene_with_box();
        scene.set_shape_filters(shape, static_filter(), static_filter(), false, true);
        let hits = scene.raycast(
            &Vec3::new(0.0, 0.0, 100.0),
            &Vec3::new(0.0, 0.0, -1.0),
            200.0,
            &trace_request(QueryMode::Multi),
        );
        assert!(hits.is_empty());
    }

    #[test]
    fn test_teleport_moves_shapes() {
        let mut scene = RapierScene::new(0, 1.0 / 60.0);
        let actor = scene.create_actor(ActorKind::Dynamic, &Transform::identity(), 7);
        let shape = scene
            .attach_shape(
                actor,
                ShapeDesc::new(rapier::SharedShape::ball(1.0), ShapeKind::Sphere)
                    .with_filters(static_filter(), static_filter())
                    .with_local_pose(Isometry3::translation(0.0, 0.0, 2.0)),
            )
            .unwrap();
        scene.set_actor_pose(actor, &Isometry3::translation(10.0, 0.0, 0.0));
        let (_, pose) = scene.shape_geometry(shape).unwrap();
        assert_relative_eq!(pose.translation.vector, Vec3::new(10.0, 0.0, 2.0), epsilon = 1e-5);
        assert_eq!(scene.remove_actor(actor), vec![shape]);
        assert_eq!(scene.shape_count(), 0);
    }
}
