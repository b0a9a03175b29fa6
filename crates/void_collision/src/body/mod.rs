//! Body instances: per-component physics state bound to backend actors
//!
//! A `BodyInstance` is created through `PhysScene::create_body` and gets its
//! backend representation from `PhysScene::init_body`. Static bodies get one
//! actor in every scene; movable bodies get one actor in the scene they
//! prefer. Welded bodies keep their record but their shapes live on the weld
//! root's actors.
//!
//! ```text
//!  BodySetup ──(× scale)──► ScaledShape ──(filters, materials)──► ShapeDesc
//!                                                                  │
//!          BodyInstance ──► SceneActor (per scene) ◄── attach ─────┘
//! ```

mod dynamics;
mod filter;
mod mass;
mod query;
mod scale;

pub use dynamics::{RadialFalloff, SleepFamily};
pub use filter::CollisionEnabled;
pub use mass::scale_mass;
pub use scale::{adjust_for_small_threshold, ScaleMode};

use crate::backend::{ActorKind, ShapeDesc};
use crate::body_setup::BodySetup;
use crate::error::{CollisionError, Result};
use crate::filter::{CollisionChannel, ResponseContainer};
use crate::identity::{ActorId, BodyId, ComponentId, ShapeId, ShapeIdentity};
use crate::material::MaterialId;
use crate::math::{Transform, Vec3, KINDA_SMALL_NUMBER};
use crate::scene::PhysScene;
use crate::shape::ShapeKind;
use rapier3d::parry::mass_properties::MassProperties;
use rapier3d::prelude::RigidBodyHandle;
use scale::{instantiate_shapes, ScaledShape};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which engine component type owns a body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComponentKind {
    #[default]
    Primitive,
    StaticMesh,
    SkeletalMesh,
    Landscape,
}

/// Whether the owning component may move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mobility {
    Static,
    #[default]
    Movable,
}

/// The component a body belongs to, as far as physics needs to know
#[derive(Debug, Clone)]
pub struct BodyOwner {
    pub component: ComponentId,
    pub actor: ActorId,
    pub kind: ComponentKind,
    pub mobility: Mobility,
    /// Part of the level geometry; always static
    pub is_world_geometry: bool,
    /// Overlaps report `item` so several bodies of one component stay distinct
    pub multi_body_overlap: bool,
    pub item: i32,
    /// Actor-level collision switch
    pub actor_collision_enabled: bool,
    pub material_override: Option<MaterialId>,
    /// Physical materials derived from the render materials, one per slot
    pub render_materials: Vec<Option<MaterialId>>,
    /// Response table of the owning skeletal mesh; combined channel-wise with the body's
    pub skeletal_override: Option<ResponseContainer>,
    /// Body of the component this one is attached to
    pub attach_parent: Option<BodyId>,
}

impl BodyOwner {
    pub fn new(component: ComponentId) -> Self {
        Self {
            component,
            actor: ActorId(component.0),
            kind: ComponentKind::Primitive,
            mobility: Mobility::Movable,
            is_world_geometry: false,
            multi_body_overlap: false,
            item: 0,
            actor_collision_enabled: true,
            material_override: None,
            render_materials: Vec::new(),
            skeletal_override: None,
            attach_parent: None,
        }
    }

    pub fn with_actor(mut self, actor: ActorId) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_kind(mut self, kind: ComponentKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_static_mobility(mut self) -> Self {
        self.mobility = Mobility::Static;
        self
    }

    pub fn with_world_geometry(mut self) -> Self {
        self.is_world_geometry = true;
        self.mobility = Mobility::Static;
        self
    }

    pub fn with_multi_body_overlap(mut self, item: i32) -> Self {
        self.multi_body_overlap = true;
        self.item = item;
        self
    }

    pub fn with_actor_collision(mut self, enabled: bool) -> Self {
        self.actor_collision_enabled = enabled;
        self
    }

    pub fn with_material_override(mut self, material: MaterialId) -> Self {
        self.material_override = Some(material);
        self
    }

    pub fn with_render_materials(mut self, materials: Vec<Option<MaterialId>>) -> Self {
        self.render_materials = materials;
        self
    }

    pub fn with_skeletal_override(mut self, responses: ResponseContainer) -> Self {
        self.skeletal_override = Some(responses);
        self
    }

    pub fn with_attach_parent(mut self, parent: BodyId) -> Self {
        self.attach_parent = Some(parent);
        self
    }

    fn is_static(&self) -> bool {
        self.is_world_geometry || self.mobility == Mobility::Static
    }
}

/// A backend actor owned by a body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneActor {
    pub scene: usize,
    pub handle: RigidBodyHandle,
}

/// A backend shape hosted on a body's actors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyShape {
    pub scene: usize,
    pub shape: ShapeId,
    pub kind: ShapeKind,
    /// Body whose template produced the shape (differs from the host when welded)
    pub origin: BodyId,
}

/// A body welded onto a root, with its pose relative to the root
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeldedChild {
    pub body: BodyId,
    pub relative: Transform,
}

/// Shape built but not yet attached (static loading)
#[derive(Debug, Clone)]
pub(crate) struct PendingShape {
    pub origin: BodyId,
    pub desc: ShapeDesc,
}

/// Physics state of one body of a component
#[derive(Debug, Clone)]
pub struct BodyInstance {
    pub object_type: CollisionChannel,
    pub responses: ResponseContainer,
    pub collision_enabled: CollisionEnabled,
    pub mask_filter: u8,
    pub simulate_physics: bool,
    /// Prefer the async scene when one exists
    pub use_async_scene: bool,
    pub notify_rigid_body_collision: bool,
    pub use_ccd: bool,
    pub enable_gravity: bool,
    pub start_awake: bool,
    /// Weld to the owner's attach parent on init
    pub auto_weld: bool,
    pub mass_scale: f32,
    /// Mass in kg replacing the computed one
    pub mass_override: Option<f32>,
    pub com_nudge: Vec3,
    pub linear_damping: f32,
    pub angular_damping: f32,
    /// Degrees per second
    pub max_angular_velocity: Option<f32>,
    pub max_depenetration_velocity: Option<f32>,
    pub initial_linear_velocity: Option<Vec3>,
    pub sleep_family: SleepFamily,
    pub custom_sleep_threshold_multiplier: f32,
    pub position_solver_iterations: u32,
    pub phys_material_override: Option<MaterialId>,

    pub(crate) owner: Option<BodyOwner>,
    pub(crate) setup: Option<Arc<BodySetup>>,
    pub(crate) actor_kind: Option<ActorKind>,
    pub(crate) scale: Vec3,
    pub(crate) transform: Transform,
    pub(crate) actors: Vec<SceneActor>,
    pub(crate) shapes: Vec<BodyShape>,
    pub(crate) pending: Vec<PendingShape>,
    pub(crate) weld_parent: Option<BodyId>,
    pub(crate) welded: Vec<WeldedChild>,
    pub(crate) mass_properties: Option<MassProperties>,
}

impl Default for BodyInstance {
    fn default() -> Self {
        Self {
            object_type: CollisionChannel::WorldStatic,
            responses: ResponseContainer::default(),
            collision_enabled: CollisionEnabled::QueryAndPhysics,
            mask_filter: 0,
            simulate_physics: false,
            use_async_scene: false,
            notify_rigid_body_collision: false,
            use_ccd: false,
            enable_gravity: true,
            start_awake: true,
            auto_weld: true,
            mass_scale: 1.0,
            mass_override: None,
            com_nudge: Vec3::zeros(),
            linear_damping: 0.01,
            angular_damping: 0.0,
            max_angular_velocity: None,
            max_depenetration_velocity: None,
            initial_linear_velocity: None,
            sleep_family: SleepFamily::Normal,
            custom_sleep_threshold_multiplier: 1.0,
            position_solver_iterations: 8,
            phys_material_override: None,
            owner: None,
            setup: None,
            actor_kind: None,
            scale: Vec3::repeat(1.0),
            transform: Transform::identity(),
            actors: Vec::new(),
            shapes: Vec::new(),
            pending: Vec::new(),
            weld_parent: None,
            welded: Vec::new(),
            mass_properties: None,
        }
    }
}

impl BodyInstance {
    /// Simulated physics body
    pub fn dynamic() -> Self {
        Self {
            object_type: CollisionChannel::PhysicsBody,
            simulate_physics: true,
            ..Default::default()
        }
    }

    /// Movable body driven by its owner
    pub fn kinematic() -> Self {
        Self {
            object_type: CollisionChannel::WorldDynamic,
            ..Default::default()
        }
    }

    pub fn with_object_type(mut self, object_type: CollisionChannel) -> Self {
        self.object_type = object_type;
        self
    }

    pub fn with_responses(mut self, responses: ResponseContainer) -> Self {
        self.responses = responses;
        self
    }

    pub fn with_collision_enabled(mut self, enabled: CollisionEnabled) -> Self {
        self.collision_enabled = enabled;
        self
    }

    pub fn with_async_scene(mut self, use_async: bool) -> Self {
        self.use_async_scene = use_async;
        self
    }

    pub fn with_notify_rigid_body_collision(mut self, notify: bool) -> Self {
        self.notify_rigid_body_collision = notify;
        self
    }

    pub fn with_mass_override(mut self, mass: f32) -> Self {
        self.mass_override = Some(mass);
        self
    }

    pub fn with_auto_weld(mut self, auto_weld: bool) -> Self {
        self.auto_weld = auto_weld;
        self
    }

    pub fn with_initial_velocity(mut self, velocity: Vec3) -> Self {
        self.initial_linear_velocity = Some(velocity);
        self
    }

    /// Has a template (possibly welded onto another body)
    pub fn is_initialized(&self) -> bool {
        self.setup.is_some()
    }

    pub fn owner(&self) -> Option<&BodyOwner> {
        self.owner.as_ref()
    }

    pub fn setup(&self) -> Option<&Arc<BodySetup>> {
        self.setup.as_ref()
    }

    /// Effective scale the shapes were built with
    pub fn scale(&self) -> Vec3 {
        self.scale
    }

    /// Last known world transform
    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn actors(&self) -> &[SceneActor] {
        &self.actors
    }

    /// Shapes hosted on this body's actors, welded children included
    pub fn shapes(&self) -> &[BodyShape] {
        &self.shapes
    }

    pub fn weld_parent(&self) -> Option<BodyId> {
        self.weld_parent
    }

    pub fn welded_children(&self) -> &[WeldedChild] {
        &self.welded
    }

    pub fn actor_kind(&self) -> Option<ActorKind> {
        self.actor_kind
    }

    pub fn is_static(&self) -> bool {
        self.actor_kind == Some(ActorKind::Static)
    }

    pub fn is_dynamic(&self) -> bool {
        self.actor_kind == Some(ActorKind::Dynamic)
    }

    /// Owns an actor in some scene or hosts its shapes on a weld root
    pub fn has_backend_actor(&self) -> bool {
        !self.actors.is_empty() || self.weld_parent.is_some()
    }

    /// Whether shapes are still waiting for the static-loading flush
    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn trace_flag(&self) -> crate::body_setup::CollisionTraceFlag {
        self.setup
            .as_ref()
            .map(|s| s.collision_trace_flag)
            .unwrap_or_default()
    }
}

impl PhysScene {
    /// Body that exists and has been initialized
    pub(crate) fn initialized(&self, id: BodyId) -> Result<&BodyInstance> {
        let body = self.instance(id)?;
        if !body.is_initialized() {
            log::debug!("Body {:?} is not initialized; ignoring", id);
            return Err(CollisionError::BodyNotInitialized(id));
        }
        Ok(body)
    }

    /// Root hosting `id`'s shapes and `id`'s pose relative to it
    pub(crate) fn weld_root_of(&self, id: BodyId) -> Result<(BodyId, Transform)> {
        let body = self.instance(id)?;
        match body.weld_parent {
            Some(root) => {
                let relative = self
                    .instance(root)?
                    .welded
                    .iter()
                    .find(|c| c.body == id)
                    .map(|c| c.relative)
                    .unwrap_or_else(Transform::identity);
                Ok((root, relative))
            }
            None => Ok((id, Transform::identity())),
        }
    }

    /// Simple material of a body and the per-slot list used by complex shapes
    pub(crate) fn body_materials(&self, body: &BodyInstance, kind: ShapeKind) -> (MaterialId, Vec<MaterialId>) {
        let owner = body.owner.as_ref();
        let component_override = owner.and_then(|o| o.material_override);
        let render: &[Option<MaterialId>] = owner.map(|o| o.render_materials.as_slice()).unwrap_or(&[]);
        let template = body.setup.as_ref().and_then(|s| s.default_material);
        let simple = self.materials.resolve_simple(
            body.phys_material_override,
            component_override,
            template,
            render,
        );
        if kind != ShapeKind::TriMesh {
            return (simple, vec![simple]);
        }
        let complex = self
            .materials
            .resolve_complex(body.phys_material_override, component_override, render);
        if complex.is_empty() {
            log::debug!("No complex materials for triangle mesh; using simple material {:?}", simple);
            return (simple, vec![simple]);
        }
        (simple, complex)
    }

    /// Turn instantiated template elements of `origin` into attachable shapes.
    /// `relative` is `origin`'s pose relative to the actor that will host them.
    pub(crate) fn shape_descs(
        &self,
        origin: BodyId,
        host_static: bool,
        relative: &Transform,
        scaled: Vec<ScaledShape>,
    ) -> Result<Vec<PendingShape>> {
        let body = self.instance(origin)?;
        let owner = body.owner.as_ref();
        let bone = body.setup.as_ref().and_then(|s| s.bone_name.clone());

        Ok(scaled
            .into_iter()
            .map(|scaled_shape| {
                let filters = filter::shape_filters(body, scaled_shape.kind, host_static, &self.config);
                let (simple, materials) = self.body_materials(body, scaled_shape.kind);
                let surface = self.materials.get(simple);
                let face_materials = match &scaled_shape.mesh {
                    crate::backend::ShapeMesh::TriMesh { mesh, .. } => mesh.material_indices.clone(),
                    _ => None,
                };
                let identity = ShapeIdentity {
                    actor: owner.map(|o| o.actor).unwrap_or_default(),
                    component: owner.map(|o| o.component).unwrap_or_default(),
                    body: Some(origin),
                    item: owner.filter(|o| o.multi_body_overlap).map(|o| o.item),
                    bone: bone.clone(),
                    materials,
                    face_materials,
                };
                let local = relative.compose_rigid(&scaled_shape.local);
                let mut desc = ShapeDesc::new(scaled_shape.shape, scaled_shape.kind)
                    .with_local_pose(local.to_isometry())
                    .with_mesh(scaled_shape.mesh)
                    .with_identity(identity)
                    .with_filters(filters.query, filters.sim);
                desc.query_enabled = filters.query_enabled;
                desc.sim_enabled = filters.sim_enabled;
                desc.friction = surface.friction;
                desc.restitution = surface.restitution;
                desc.friction_combine = surface.friction_combine;
                desc.restitution_combine = surface.restitution_combine;
                PendingShape { origin, desc }
            })
            .collect())
    }

    /// Attach shapes to every actor of `root`
    pub(crate) fn attach_descs(&mut self, root: BodyId, descs: Vec<PendingShape>) -> Result<()> {
        let actors = self.instance(root)?.actors.clone();
        let mut attached = Vec::new();
        for actor in &actors {
            let mut scene = self.scenes.scene(actor.scene)?.write();
            for pending in &descs {
                match scene.attach_shape(actor.handle, pending.desc.clone()) {
                    Some(shape) => attached.push(BodyShape {
                        scene: actor.scene,
                        shape,
                        kind: pending.desc.kind,
                        origin: pending.origin,
                    }),
                    None => log::warn!("Failed to attach shape of body {:?} to scene {}", pending.origin, actor.scene),
                }
            }
        }
        self.instance_mut(root)?.shapes.extend(attached);
        Ok(())
    }

    /// Remove a body's actors (and every shape on them) from all scenes
    fn release_actors(&mut self, id: BodyId) -> Result<()> {
        let body = self.instance_mut(id)?;
        let mut actors = std::mem::take(&mut body.actors);
        body.shapes.clear();
        body.pending.clear();
        actors.sort_by_key(|a| a.scene);

        let scenes = Arc::clone(&self.scenes);
        // every scene involved stays locked until all actors are gone
        let mut guards = Vec::new();
        for actor in &actors {
            if guards.iter().all(|(index, _)| *index != actor.scene) {
                guards.push((actor.scene, scenes.scene(actor.scene)?.write()));
            }
        }
        for actor in &actors {
            if let Some((_, scene)) = guards.iter_mut().find(|(index, _)| *index == actor.scene) {
                scene.remove_actor(actor.handle);
            }
        }
        Ok(())
    }

    // ==================== Lifecycle ====================

    /// Create the backend representation of a body.
    ///
    /// Nearly-zero scales, scales whose mirroring the template cannot
    /// represent and non-finite transforms are rejected. A body that already
    /// has an actor, or is welded onto one, is left untouched. A body unwelded
    /// from its root gets actors of its own again.
    pub fn init_body(
        &mut self,
        id: BodyId,
        setup: Arc<BodySetup>,
        transform: &Transform,
        owner: BodyOwner,
    ) -> Result<()> {
        let body = self.instance_mut(id)?;
        if body.has_backend_actor() {
            log::debug!("Body {:?} already initialized", id);
            return Ok(());
        }
        if body.is_initialized() {
            // template left behind by an unweld
            body.owner = None;
            body.setup = None;
            body.shapes.clear();
        }
        if transform.contains_nan() {
            log::error!("init_body: non-finite transform {:?} for body {:?}", transform, id);
            return Err(CollisionError::InvalidTransform(format!("{:?}", transform)));
        }
        if transform.scale_is_nearly_zero(KINDA_SMALL_NUMBER) {
            log::warn!("init_body: body {:?} has nearly zero scale {:?}", id, transform.scale);
            return Err(CollisionError::InvalidScale(format!("{:?}", transform.scale)));
        }
        if !setup.supports_determinant(transform.determinant()) {
            log::warn!(
                "init_body: body {:?} template does not support scale {:?} (mirroring)",
                id,
                transform.scale
            );
            return Err(CollisionError::InvalidTransform(format!("mirrored scale {:?}", transform.scale)));
        }

        let scale = ScaleMode::for_kinds(&setup.shape_kinds()).apply(&transform.scale);
        let weld_target = owner.attach_parent;
        let actor_kind = {
            let body = self.instance_mut(id)?;
            let kind = if owner.is_static() {
                ActorKind::Static
            } else if body.simulate_physics {
                ActorKind::Dynamic
            } else {
                ActorKind::Kinematic
            };
            body.owner = Some(owner);
            body.setup = Some(Arc::clone(&setup));
            body.scale = scale;
            body.transform = Transform { scale, ..*transform };
            kind
        };

        let body = self.instance(id)?;
        if self.config.game_world && body.auto_weld && actor_kind == ActorKind::Kinematic {
            if let Some(parent) = weld_target {
                let parent_ready = self.bodies.get(&parent).map_or(false, |b| b.is_initialized());
                if parent_ready && self.weld(parent, id, transform) {
                    self.instance_mut(id)?.actor_kind = Some(actor_kind);
                    return Ok(());
                }
            }
        }

        let scaled = instantiate_shapes(&setup, &scale);
        if scaled.is_empty() {
            log::warn!("init_body: body {:?} produced no shapes", id);
            let body = self.instance_mut(id)?;
            body.owner = None;
            body.setup = None;
            return Err(CollisionError::ShapeCreationFailed(format!("no shapes for body {:?}", id)));
        }

        let scene_indices: Vec<usize> = if actor_kind == ActorKind::Static {
            (0..self.scenes.len()).collect()
        } else if self.instance(id)?.use_async_scene && self.has_async_scene() {
            vec![1]
        } else {
            vec![0]
        };

        let descs = self.shape_descs(id, actor_kind == ActorKind::Static, &Transform::identity(), scaled)?;

        let mut actors = Vec::with_capacity(scene_indices.len());
        for index in scene_indices {
            let handle = self
                .scenes
                .scene(index)?
                .write()
                .create_actor(actor_kind, transform, id.raw());
            actors.push(SceneActor { scene: index, handle });
        }
        {
            let body = self.instance_mut(id)?;
            body.actors = actors;
            body.actor_kind = Some(actor_kind);
        }

        if self.is_static_loading() {
            self.instance_mut(id)?.pending = descs;
            self.deferred.push(id);
            log::debug!("Body {:?} deferred until static loading ends", id);
            return Ok(());
        }

        self.attach_descs(id, descs)?;
        self.finish_body_setup(id)?;
        log::debug!("Initialized body {:?} as {:?}", id, actor_kind);
        Ok(())
    }

    /// Attach shapes held back during static loading
    pub fn flush_deferred_actors(&mut self) {
        for id in std::mem::take(&mut self.deferred) {
            let Some(body) = self.bodies.get_mut(&id) else {
                continue;
            };
            let pending = std::mem::take(&mut body.pending);
            if let Err(err) = self.attach_descs(id, pending).and_then(|_| self.finish_body_setup(id)) {
                log::warn!("Failed to add deferred body {:?}: {}", id, err);
            }
        }
    }

    /// Mass, damping, velocities and sleep state once shapes are attached
    fn finish_body_setup(&mut self, id: BodyId) -> Result<()> {
        let body = self.instance(id)?;
        if body.is_static() {
            return Ok(());
        }
        let (damping, gravity, ccd, iterations, velocity, awake) = (
            (body.linear_damping, body.angular_damping),
            body.enable_gravity,
            body.use_ccd,
            body.position_solver_iterations,
            body.initial_linear_velocity,
            body.start_awake,
        );
        self.update_mass_properties(id)?;
        self.set_damping(id, damping.0, damping.1)?;
        self.set_enable_gravity(id, gravity)?;
        self.set_use_ccd(id, ccd)?;
        self.set_solver_iterations(id, iterations)?;
        self.apply_sleep_threshold(id)?;
        if self.instance(id)?.is_dynamic() {
            if let Some(velocity) = velocity {
                self.set_linear_velocity(id, &velocity, false)?;
            }
            if !awake {
                self.put_to_sleep(id)?;
            }
        }
        Ok(())
    }

    /// Release a body's backend representation. Safe to call repeatedly.
    pub fn term_body(&mut self, id: BodyId) {
        let Some(body) = self.bodies.get(&id) else {
            return;
        };
        if !body.is_initialized() && body.actors.is_empty() {
            return;
        }
        if let Some(parent) = body.weld_parent {
            self.unweld(parent, id);
        }

        let children = self
            .bodies
            .get_mut(&id)
            .map(|b| std::mem::take(&mut b.welded))
            .unwrap_or_default();
        for child in children {
            // their shapes go away with our actors
            if let Some(child) = self.bodies.get_mut(&child.body) {
                child.weld_parent = None;
            }
        }

        if let Err(err) = self.release_actors(id) {
            log::warn!("term_body: failed to release actors of {:?}: {}", id, err);
        }
        self.deferred.retain(|b| *b != id);
        if let Some(body) = self.bodies.get_mut(&id) {
            body.owner = None;
            body.setup = None;
            body.actor_kind = None;
            body.mass_properties = None;
        }
        log::debug!("Terminated body {:?}", id);
    }

    // ==================== Welding ====================

    /// Move `child`'s shapes onto `parent`'s actors.
    ///
    /// Returns false when the child has no template, is already welded to
    /// the parent, or the parent has no actors to host the shapes.
    pub fn weld(&mut self, parent: BodyId, child: BodyId, child_world_tm: &Transform) -> bool {
        let Some(parent_body) = self.bodies.get(&parent) else {
            return false;
        };
        let root = parent_body.weld_parent.unwrap_or(parent);
        if root == child {
            return false;
        }
        let Some(child_body) = self.bodies.get(&child) else {
            return false;
        };
        let Some(setup) = child_body.setup.clone() else {
            return false;
        };
        if child_body.weld_parent == Some(root) {
            return false;
        }
        let previous = child_body.weld_parent;
        let child_scale = child_body.scale;
        let (root_static, root_has_actors) = match self.bodies.get(&root) {
            Some(b) => (b.is_static(), !b.actors.is_empty()),
            None => return false,
        };
        if !root_has_actors {
            return false;
        }
        let Ok(root_tm) = self.world_transform(root) else {
            return false;
        };

        if let Some(previous) = previous {
            self.unweld(previous, child);
        }
        let grandchildren = self
            .bodies
            .get_mut(&child)
            .map(|b| std::mem::take(&mut b.welded))
            .unwrap_or_default();
        if let Err(err) = self.release_actors(child) {
            log::warn!("weld: failed to release actors of {:?}: {}", child, err);
        }

        let relative = root_tm.relative_to(child_world_tm);
        let scaled = instantiate_shapes(&setup, &child_scale);
        let attached = self
            .shape_descs(child, root_static, &relative, scaled)
            .and_then(|descs| self.attach_descs(root, descs));
        if let Err(err) = attached {
            log::warn!("weld: failed to move shapes of {:?} onto {:?}: {}", child, root, err);
            return false;
        }

        if let Some(body) = self.bodies.get_mut(&child) {
            body.weld_parent = Some(root);
            body.transform = Transform {
                scale: child_scale,
                ..*child_world_tm
            };
        }
        if let Some(body) = self.bodies.get_mut(&root) {
            body.welded.push(WeldedChild { body: child, relative });
        }

        // bodies welded to the child go straight onto the root
        for grandchild in grandchildren {
            let world = child_world_tm.compose_rigid(&grandchild.relative);
            if let Some(body) = self.bodies.get_mut(&grandchild.body) {
                body.weld_parent = None;
            }
            self.weld(root, grandchild.body, &world);
        }

        self.refresh_after_shape_change(root);
        log::debug!("Welded body {:?} onto {:?}", child, root);
        true
    }

    /// Detach `child`'s shapes from its weld root. The child keeps its record
    /// but has no actors until it is initialized again.
    pub fn unweld(&mut self, parent: BodyId, child: BodyId) -> bool {
        let root = self
            .bodies
            .get(&parent)
            .and_then(|b| b.weld_parent)
            .unwrap_or(parent);
        let removed = self.detach_origin_shapes(root, child).unwrap_or(0);
        if let Some(body) = self.bodies.get_mut(&root) {
            body.welded.retain(|c| c.body != child);
        }
        if let Some(body) = self.bodies.get_mut(&child) {
            if body.weld_parent == Some(root) {
                body.weld_parent = None;
            }
        }
        if removed > 0 {
            self.refresh_after_shape_change(root);
        }
        removed > 0
    }

    fn refresh_after_shape_change(&mut self, id: BodyId) {
        let dynamic = self.bodies.get(&id).map_or(false, |b| b.is_dynamic());
        if dynamic {
            if let Err(err) = self.update_mass_properties(id) {
                log::debug!("Mass refresh of {:?} failed: {}", id, err);
            }
        }
    }

    // ==================== Transforms ====================

    /// Move a body; kinematic bodies get a target unless `teleport` is set
    pub fn set_body_transform(&mut self, id: BodyId, transform: &Transform, teleport: bool) -> Result<()> {
        if transform.contains_nan() {
            log::error!("set_body_transform: non-finite transform {:?} for body {:?}", transform, id);
            return Err(CollisionError::InvalidTransform(format!("{:?}", transform)));
        }
        let body = self.initialized(id)?;
        if body.weld_parent.is_some() {
            log::debug!("Body {:?} is welded; transform follows its root", id);
            return Ok(());
        }
        if body.actor_kind == Some(ActorKind::Kinematic) && !teleport {
            return self.set_kinematic_target(id, transform);
        }
        let actors = body.actors.clone();
        let pose = transform.to_isometry();
        for actor in &actors {
            self.scenes.scene(actor.scene)?.write().set_actor_pose(actor.handle, &pose);
        }
        let body = self.instance_mut(id)?;
        body.transform = Transform {
            scale: body.scale,
            ..*transform
        };
        Ok(())
    }

    /// Current world transform of a body (welded bodies follow their root)
    pub fn world_transform(&self, id: BodyId) -> Result<Transform> {
        let body = self.initialized(id)?;
        if body.weld_parent.is_some() {
            let (root, relative) = self.weld_root_of(id)?;
            let root_tm = self.world_transform(root)?;
            return Ok(root_tm.compose_rigid(&Transform { scale: body.scale, ..relative }));
        }
        let Some(actor) = body.actors.first() else {
            return Ok(body.transform);
        };
        let pose = self.scenes.scene(actor.scene)?.read().actor_pose(actor.handle);
        Ok(pose
            .map(|p| Transform::from_isometry(&p, body.scale))
            .unwrap_or(body.transform))
    }

    /// Switch a movable body between simulated and kinematic
    pub fn set_instance_simulate_physics(&mut self, id: BodyId, simulate: bool) -> Result<()> {
        let body = self.instance_mut(id)?;
        body.simulate_physics = simulate;
        if !body.is_initialized() {
            return Ok(());
        }
        if body.is_static() {
            log::warn!("Body {:?} is static and cannot simulate", id);
            return Ok(());
        }
        if body.weld_parent.is_some() {
            log::debug!("Body {:?} is welded; simulation follows its root", id);
            return Ok(());
        }
        let kind = if simulate { ActorKind::Dynamic } else { ActorKind::Kinematic };
        body.actor_kind = Some(kind);
        let actors = body.actors.clone();
        for actor in &actors {
            self.scenes.scene(actor.scene)?.write().set_actor_kind(actor.handle, kind);
        }
        if simulate {
            self.finish_body_setup(id)?;
            self.wake(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body_setup::AggregateGeom;
    use crate::config::CollisionConfig;
    use approx::assert_relative_eq;

    fn box_setup(half: f32) -> Arc<BodySetup> {
        Arc::new(BodySetup::from_geom(
            AggregateGeom::default().with_box(Vec3::zeros(), Vec3::repeat(half)),
        ))
    }

    fn phys() -> PhysScene {
        PhysScene::new(CollisionConfig::default()).unwrap()
    }

    #[test]
    fn test_init_registers_identity() {
        let mut phys = phys();
        let id = phys.create_body(BodyInstance::default());
        let owner = BodyOwner::new(ComponentId(9)).with_actor(ActorId(4)).with_static_mobility();
        phys.init_body(id, box_setup(10.0), &Transform::identity(), owner).unwrap();

        let body = phys.body(id).unwrap();
        assert!(body.is_static());
        assert_eq!(body.shapes().len(), 1);
        let scene = phys.scenes().get(0).unwrap().read();
        let identity = scene.identity(body.shapes()[0].shape).unwrap();
        assert_eq!(identity.component, ComponentId(9));
        assert_eq!(identity.actor, ActorId(4));
        assert_eq!(identity.body, Some(id));
        assert_eq!(identity.item, None);
    }

    #[test]
    fn test_static_body_in_every_scene() {
        let mut phys = PhysScene::new(CollisionConfig::with_async_scene()).unwrap();
        let id = phys.create_body(BodyInstance::default());
        let owner = BodyOwner::new(ComponentId(1)).with_world_geometry();
        phys.init_body(id, box_setup(10.0), &Transform::identity(), owner).unwrap();
        let scenes: Vec<usize> = phys.body(id).unwrap().actors().iter().map(|a| a.scene).collect();
        assert_eq!(scenes, vec![0, 1]);

        let mover = phys.create_body(BodyInstance::dynamic().with_async_scene(true));
        phys.init_body(mover, box_setup(5.0), &Transform::identity(), BodyOwner::new(ComponentId(2)))
            .unwrap();
        assert_eq!(phys.body(mover).unwrap().actors()[0].scene, 1);
    }

    #[test]
    fn test_init_rejects_bad_transforms() {
        let mut phys = phys();
        let id = phys.create_body(BodyInstance::default());
        let zero = Transform::identity().with_scale(Vec3::zeros());
        assert!(matches!(
            phys.init_body(id, box_setup(1.0), &zero, BodyOwner::new(ComponentId(1))),
            Err(CollisionError::InvalidScale(_))
        ));
        let nan = Transform::from_translation(Vec3::new(f32::NAN, 0.0, 0.0));
        assert!(matches!(
            phys.init_body(id, box_setup(1.0), &nan, BodyOwner::new(ComponentId(1))),
            Err(CollisionError::InvalidTransform(_))
        ));
        let mut no_mirror = BodySetup::from_geom(AggregateGeom::default().with_box(Vec3::zeros(), Vec3::repeat(1.0)));
        no_mirror.generate_mirrored_collision = false;
        let mirrored = Transform::identity().with_scale(Vec3::new(-1.0, 1.0, 1.0));
        assert!(matches!(
            phys.init_body(id, Arc::new(no_mirror), &mirrored, BodyOwner::new(ComponentId(1))),
            Err(CollisionError::InvalidTransform(_))
        ));
        assert!(!phys.body(id).unwrap().is_initialized());
    }

    #[test]
    fn test_empty_template_clears_owner() {
        let mut phys = phys();
        let id = phys.create_body(BodyInstance::default());
        let result = phys.init_body(
            id,
            Arc::new(BodySetup::default()),
            &Transform::identity(),
            BodyOwner::new(ComponentId(1)),
        );
        assert!(matches!(result, Err(CollisionError::ShapeCreationFailed(_))));
        let body = phys.body(id).unwrap();
        assert!(body.owner().is_none());
        assert!(!body.is_initialized());
    }

    #[test]
    fn test_term_body_is_idempotent() {
        let mut phys = phys();
        let id = phys.create_body(BodyInstance::default());
        phys.init_body(id, box_setup(10.0), &Transform::identity(), BodyOwner::new(ComponentId(1)))
            .unwrap();
        let shape = phys.body(id).unwrap().shapes()[0].shape;

        phys.term_body(id);
        phys.term_body(id);
        let body = phys.body(id).unwrap();
        assert!(!body.is_initialized());
        assert!(body.actors().is_empty());
        let scene = phys.scenes().get(0).unwrap().read();
        assert!(scene.identity(shape).is_none());
        assert_eq!(scene.actor_count(), 0);
    }

    #[test]
    fn test_weld_moves_shapes_to_root() {
        let mut phys = phys();
        let root = phys.create_body(BodyInstance::default());
        phys.init_body(root, box_setup(10.0), &Transform::identity(), BodyOwner::new(ComponentId(1)))
            .unwrap();
        let child = phys.create_body(BodyInstance::default().with_auto_weld(false));
        let child_tm = Transform::from_translation(Vec3::new(30.0, 0.0, 0.0));
        phys.init_body(child, box_setup(5.0), &child_tm, BodyOwner::new(ComponentId(2)))
            .unwrap();

        assert!(phys.weld(root, child, &child_tm));
        assert!(!phys.weld(root, child, &child_tm));

        let root_body = phys.body(root).unwrap();
        assert_eq!(root_body.shapes().len(), 2);
        assert_eq!(root_body.welded_children()[0].body, child);
        assert_relative_eq!(
            root_body.welded_children()[0].relative.translation,
            Vec3::new(30.0, 0.0, 0.0),
            epsilon = 1e-4
        );
        let child_body = phys.body(child).unwrap();
        assert_eq!(child_body.weld_parent(), Some(root));
        assert!(child_body.actors().is_empty());

        let welded_shape = root_body.shapes().iter().find(|s| s.origin == child).unwrap();
        let scene = phys.scenes().get(0).unwrap().read();
        assert_eq!(scene.identity(welded_shape.shape).unwrap().component, ComponentId(2));
        let (_, pose) = scene.shape_geometry(welded_shape.shape).unwrap();
        assert_relative_eq!(pose.translation.vector, Vec3::new(30.0, 0.0, 0.0), epsilon = 1e-4);
        drop(scene);

        let tm = phys.world_transform(child).unwrap();
        assert_relative_eq!(tm.translation, Vec3::new(30.0, 0.0, 0.0), epsilon = 1e-4);
    }

    #[test]
    fn test_weld_flattens_grandchildren() {
        let mut phys = phys();
        let owner = |c| BodyOwner::new(ComponentId(c));
        let a = phys.create_body(BodyInstance::default());
        let b = phys.create_body(BodyInstance::default().with_auto_weld(false));
        let c = phys.create_body(BodyInstance::default().with_auto_weld(false));
        let tm_b = Transform::from_translation(Vec3::new(10.0, 0.0, 0.0));
        let tm_c = Transform::from_translation(Vec3::new(20.0, 0.0, 0.0));
        phys.init_body(a, box_setup(1.0), &Transform::identity(), owner(1)).unwrap();
        phys.init_body(b, box_setup(1.0), &tm_b, owner(2)).unwrap();
        phys.init_body(c, box_setup(1.0), &tm_c, owner(3)).unwrap();

        assert!(phys.weld(b, c, &tm_c));
        assert!(phys.weld(a, b, &tm_b));

        let root = phys.body(a).unwrap();
        let children: Vec<BodyId> = root.welded_children().iter().map(|w| w.body).collect();
        assert!(children.contains(&b) && children.contains(&c));
        assert_eq!(root.shapes().len(), 3);
        assert_eq!(phys.body(c).unwrap().weld_parent(), Some(a));
        assert!(phys.body(b).unwrap().welded_children().is_empty());
    }

    #[test]
    fn test_unweld_detaches_only_child_shapes() {
        let mut phys = phys();
        let root = phys.create_body(BodyInstance::default());
        let child = phys.create_body(BodyInstance::default().with_auto_weld(false));
        phys.init_body(root, box_setup(10.0), &Transform::identity(), BodyOwner::new(ComponentId(1)))
            .unwrap();
        phys.init_body(child, box_setup(5.0), &Transform::identity(), BodyOwner::new(ComponentId(2)))
            .unwrap();
        assert!(phys.weld(root, child, &Transform::identity()));

        assert!(phys.unweld(root, child));
        let root_body = phys.body(root).unwrap();
        assert_eq!(root_body.shapes().len(), 1);
        assert_eq!(root_body.shapes()[0].origin, root);
        assert!(phys.body(child).unwrap().weld_parent().is_none());
        assert!(!phys.unweld(root, child));
    }

    #[test]
    fn test_init_after_unweld_recreates_actor() {
        let mut phys = phys();
        let root = phys.create_body(BodyInstance::default());
        let child = phys.create_body(BodyInstance::default().with_auto_weld(false));
        let child_tm = Transform::from_translation(Vec3::new(40.0, 0.0, 0.0));
        phys.init_body(root, box_setup(10.0), &Transform::identity(), BodyOwner::new(ComponentId(1)))
            .unwrap();
        phys.init_body(child, box_setup(5.0), &child_tm, BodyOwner::new(ComponentId(2)))
            .unwrap();
        assert!(phys.weld(root, child, &child_tm));

        // still welded: nothing to do
        phys.init_body(child, box_setup(5.0), &child_tm, BodyOwner::new(ComponentId(2)))
            .unwrap();
        assert!(phys.body(child).unwrap().actors().is_empty());

        assert!(phys.unweld(root, child));
        assert!(!phys.body(child).unwrap().has_backend_actor());
        phys.init_body(child, box_setup(5.0), &child_tm, BodyOwner::new(ComponentId(2)))
            .unwrap();

        let body = phys.body(child).unwrap();
        assert_eq!(body.actors().len(), 1);
        assert_eq!(body.shapes().len(), 1);
        assert_eq!(body.shapes()[0].origin, child);
        let shape = body.shapes()[0].shape;
        let scene = phys.scenes().get(0).unwrap().read();
        assert_eq!(scene.identity(shape).unwrap().component, ComponentId(2));
        drop(scene);

        let hit = phys
            .line_trace_body(child, &Vec3::new(40.0, 0.0, 100.0), &Vec3::new(40.0, 0.0, -100.0), false)
            .unwrap();
        assert!(hit.is_some());
    }

    #[test]
    fn test_auto_weld_to_attach_parent() {
        let mut phys = phys();
        let parent = phys.create_body(BodyInstance::default());
        phys.init_body(parent, box_setup(10.0), &Transform::identity(), BodyOwner::new(ComponentId(1)))
            .unwrap();
        let child = phys.create_body(BodyInstance::default());
        let owner = BodyOwner::new(ComponentId(2)).with_attach_parent(parent);
        phys.init_body(child, box_setup(2.0), &Transform::identity(), owner).unwrap();
        assert_eq!(phys.body(child).unwrap().weld_parent(), Some(parent));

        // editor worlds never auto-weld
        let mut editor = PhysScene::new(CollisionConfig::editor()).unwrap();
        let parent = editor.create_body(BodyInstance::default());
        editor
            .init_body(parent, box_setup(10.0), &Transform::identity(), BodyOwner::new(ComponentId(1)))
            .unwrap();
        let child = editor.create_body(BodyInstance::default());
        let owner = BodyOwner::new(ComponentId(2)).with_attach_parent(parent);
        editor.init_body(child, box_setup(2.0), &Transform::identity(), owner).unwrap();
        assert!(editor.body(child).unwrap().weld_parent().is_none());
    }

    #[test]
    fn test_term_root_releases_welded_children() {
        let mut phys = phys();
        let root = phys.create_body(BodyInstance::default());
        let child = phys.create_body(BodyInstance::default().with_auto_weld(false));
        phys.init_body(root, box_setup(10.0), &Transform::identity(), BodyOwner::new(ComponentId(1)))
            .unwrap();
        phys.init_body(child, box_setup(5.0), &Transform::identity(), BodyOwner::new(ComponentId(2)))
            .unwrap();
        assert!(phys.weld(root, child, &Transform::identity()));

        phys.term_body(root);
        assert!(phys.body(child).unwrap().weld_parent().is_none());
        assert_eq!(phys.scenes().get(0).unwrap().read().shape_count(), 0);
    }

    #[test]
    fn test_static_loading_defers_shapes() {
        let mut phys = phys();
        phys.set_static_loading(true);
        let id = phys.create_body(BodyInstance::default());
        phys.init_body(id, box_setup(10.0), &Transform::identity(), BodyOwner::new(ComponentId(1)))
            .unwrap();
        assert!(phys.body(id).unwrap().is_pending());
        assert_eq!(phys.scenes().get(0).unwrap().read().shape_count(), 0);

        phys.set_static_loading(false);
        assert!(!phys.body(id).unwrap().is_pending());
        assert_eq!(phys.body(id).unwrap().shapes().len(), 1);
    }

    #[test]
    fn test_teleport_and_kinematic_target() {
        let mut phys = phys();
        let id = phys.create_body(BodyInstance::kinematic());
        phys.init_body(id, box_setup(10.0), &Transform::identity(), BodyOwner::new(ComponentId(1)))
            .unwrap();

        let teleport = Transform::from_translation(Vec3::new(0.0, 100.0, 0.0));
        phys.set_body_transform(id, &teleport, true).unwrap();
        assert_relative_eq!(phys.world_transform(id).unwrap().translation, teleport.translation, epsilon = 1e-4);
        assert!(phys.kinematic_target(id).is_none());

        let target = Transform::from_translation(Vec3::new(0.0, 200.0, 0.0));
        phys.set_body_transform(id, &target, false).unwrap();
        assert_eq!(phys.kinematic_target(id), Some(target));
    }

    #[test]
    fn test_simulate_toggle() {
        let mut phys = phys();
        let id = phys.create_body(BodyInstance::kinematic());
        phys.init_body(id, box_setup(10.0), &Transform::identity(), BodyOwner::new(ComponentId(1)))
            .unwrap();
        assert_eq!(phys.body(id).unwrap().actor_kind(), Some(ActorKind::Kinematic));
        phys.set_instance_simulate_physics(id, true).unwrap();
        assert!(phys.body(id).unwrap().is_dynamic());
        assert!(phys.body_mass(id).unwrap() > 0.0);
    }
}
