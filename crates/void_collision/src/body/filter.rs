//! Per-shape filter data of body instances

use super::{BodyInstance, ComponentKind};
use crate::body_setup::CollisionTraceFlag;
use crate::config::CollisionConfig;
use crate::error::Result;
use crate::filter::{CollisionChannel, CollisionResponse, FilterData, FilterFlags, ResponseContainer};
use crate::identity::BodyId;
use crate::scene::PhysScene;
use crate::shape::ShapeKind;
use serde::{Deserialize, Serialize};

/// Which kinds of collision a body takes part in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CollisionEnabled {
    NoCollision,
    QueryOnly,
    PhysicsOnly,
    #[default]
    QueryAndPhysics,
}

impl CollisionEnabled {
    pub fn has_query(self) -> bool {
        matches!(self, Self::QueryOnly | Self::QueryAndPhysics)
    }

    pub fn has_physics(self) -> bool {
        matches!(self, Self::PhysicsOnly | Self::QueryAndPhysics)
    }
}

/// Filter words and enable flags for one shape
#[derive(Debug, Clone, Copy)]
pub(crate) struct ShapeFilters {
    pub query: FilterData,
    pub sim: FilterData,
    pub query_enabled: bool,
    pub sim_enabled: bool,
}

/// Filters a shape of `kind` created by `body` gets on a host actor
pub(crate) fn shape_filters(
    body: &BodyInstance,
    kind: ShapeKind,
    host_static: bool,
    config: &CollisionConfig,
) -> ShapeFilters {
    let owner = body.owner.as_ref();
    let collision = if owner.map_or(true, |o| o.actor_collision_enabled) {
        body.collision_enabled
    } else {
        CollisionEnabled::NoCollision
    };

    let responses = match owner {
        Some(o) if o.kind == ComponentKind::SkeletalMesh => match &o.skeletal_override {
            Some(skeletal) => ResponseContainer::min(&body.responses, skeletal),
            None => body.responses,
        },
        _ => body.responses,
    };

    // (answers simple queries, answers complex queries, simulates)
    let (simple, complex, simulates) = match (kind, body.trace_flag()) {
        (ShapeKind::HeightField, _) => (true, true, true),
        (ShapeKind::TriMesh, CollisionTraceFlag::UseComplexAsSimple) => (true, true, true),
        (ShapeKind::TriMesh, _) => (false, true, false),
        (_, CollisionTraceFlag::UseComplexAsSimple) => (false, false, false),
        (_, CollisionTraceFlag::UseSimpleAsComplex) => (true, true, true),
        _ => (true, false, true),
    };

    let mut flags = FilterFlags::NONE;
    flags.set(FilterFlags::SIMPLE_COLLISION, simple);
    flags.set(FilterFlags::COMPLEX_COLLISION, complex);
    flags.set(FilterFlags::STATIC_SHAPE, host_static);
    flags.set(FilterFlags::CONTACT_NOTIFY, body.notify_rigid_body_collision);
    flags.set(FilterFlags::CCD, body.use_ccd);
    let filter = FilterData::shape(body.object_type, &responses, body.mask_filter, flags);

    let queryable = simple || complex;
    let (query_enabled, sim_enabled) = if config.editor_trace_collision && collision == CollisionEnabled::NoCollision {
        // editor picking still needs to see the shape
        (queryable, false)
    } else {
        (collision.has_query() && queryable, collision.has_physics() && simulates)
    };

    ShapeFilters {
        query: filter,
        sim: filter,
        query_enabled,
        sim_enabled,
    }
}

impl PhysScene {
    /// Recompute the filter data of every shape a body hosts.
    ///
    /// Welded bodies update their root. Mass is recomputed when any shape's
    /// simulation flag changed.
    pub fn update_physics_filter_data(&mut self, id: BodyId) -> Result<()> {
        self.initialized(id)?;
        let (root, _) = self.weld_root_of(id)?;
        let root_body = self.instance(root)?;
        let host_static = root_body.is_static();
        let shapes = root_body.shapes.clone();

        let mut sim_changed = false;
        for shape in &shapes {
            let Some(origin) = self.bodies.get(&shape.origin) else {
                continue;
            };
            let filters = shape_filters(origin, shape.kind, host_static, &self.config);
            let mut scene = self.scenes.scene(shape.scene)?.write();
            let before = scene.shape_record(shape.shape).map(|r| r.sim_enabled);
            scene.set_shape_filters(
                shape.shape,
                filters.query,
                filters.sim,
                filters.query_enabled,
                filters.sim_enabled,
            );
            sim_changed |= before != Some(filters.sim_enabled);
        }

        let mut pending = std::mem::take(&mut self.instance_mut(root)?.pending);
        for shape in &mut pending {
            if let Some(origin) = self.bodies.get(&shape.origin) {
                let filters = shape_filters(origin, shape.desc.kind, host_static, &self.config);
                shape.desc.query_filter = filters.query;
                shape.desc.sim_filter = filters.sim;
                shape.desc.query_enabled = filters.query_enabled;
                shape.desc.sim_enabled = filters.sim_enabled;
            }
        }
        self.instance_mut(root)?.pending = pending;

        if sim_changed && self.instance(root)?.is_dynamic() {
            self.update_mass_properties(root)?;
        }
        Ok(())
    }

    pub fn set_collision_enabled(&mut self, id: BodyId, enabled: CollisionEnabled) -> Result<()> {
        let body = self.instance_mut(id)?;
        if body.collision_enabled == enabled {
            return Ok(());
        }
        body.collision_enabled = enabled;
        self.refresh_filters(id)
    }

    pub fn set_response_to_channel(
        &mut self,
        id: BodyId,
        channel: CollisionChannel,
        response: CollisionResponse,
    ) -> Result<()> {
        if self.instance_mut(id)?.responses.set_response(channel, response) {
            self.refresh_filters(id)?;
        }
        Ok(())
    }

    pub fn set_response_to_all_channels(&mut self, id: BodyId, response: CollisionResponse) -> Result<()> {
        if self.instance_mut(id)?.responses.set_all(response) {
            self.refresh_filters(id)?;
        }
        Ok(())
    }

    pub fn set_object_type(&mut self, id: BodyId, object_type: CollisionChannel) -> Result<()> {
        self.instance_mut(id)?.object_type = object_type;
        self.refresh_filters(id)
    }

    /// Report contacts of this body through `take_collision_notifies`
    pub fn set_instance_notify_rb_collision(&mut self, id: BodyId, notify: bool) -> Result<()> {
        self.instance_mut(id)?.notify_rigid_body_collision = notify;
        self.refresh_filters(id)
    }

    pub fn set_mask_filter(&mut self, id: BodyId, mask_filter: u8) -> Result<()> {
        self.instance_mut(id)?.mask_filter = mask_filter;
        self.refresh_filters(id)
    }

    /// Settings-only change on an uninitialized body, filter rebuild otherwise
    fn refresh_filters(&mut self, id: BodyId) -> Result<()> {
        if self.instance(id)?.is_initialized() {
            self.update_physics_filter_data(id)
        } else {
            Ok(())
        }
    }
}
