//! Query parameters

use crate::filter::{CollisionChannel, FilterData, QueryMobility, ResponseContainer};
use crate::identity::{ActorId, ComponentId};
use serde::{Deserialize, Serialize};

/// Options shared by every scene query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollisionQueryParams {
    /// Tag for diagnostics
    pub trace_tag: String,
    /// Trace against complex (triangle mesh) collision instead of simple shapes
    pub trace_complex: bool,
    /// Report sweeps that start in penetration
    pub find_initial_overlaps: bool,
    /// Fill `HitResult::face_index`
    pub return_face_index: bool,
    /// Fill `HitResult::phys_material`
    pub return_physical_material: bool,
    /// Also query scenes past the first one
    pub trace_async_scene: bool,
    /// Mask filter bits; shapes sharing any bit are ignored
    pub ignore_mask: u8,
    pub mobility: QueryMobility,
    ignore_components: Vec<ComponentId>,
    ignore_actors: Vec<ActorId>,
}

impl Default for CollisionQueryParams {
    fn default() -> Self {
        Self {
            trace_tag: String::new(),
            trace_complex: false,
            find_initial_overlaps: true,
            return_face_index: false,
            return_physical_material: false,
            trace_async_scene: false,
            ignore_mask: 0,
            mobility: QueryMobility::Any,
            ignore_components: Vec::new(),
            ignore_actors: Vec::new(),
        }
    }
}

impl CollisionQueryParams {
    /// Params with a diagnostic tag
    pub fn new(tag: impl Into<String>, trace_complex: bool) -> Self {
        Self {
            trace_tag: tag.into(),
            trace_complex,
            ..Default::default()
        }
    }

    pub fn with_async_scene(mut self, trace_async: bool) -> Self {
        self.trace_async_scene = trace_async;
        self
    }

    pub fn with_face_index(mut self, return_face_index: bool) -> Self {
        self.return_face_index = return_face_index;
        self
    }

    pub fn with_physical_material(mut self, return_material: bool) -> Self {
        self.return_physical_material = return_material;
        self
    }

    pub fn with_mobility(mut self, mobility: QueryMobility) -> Self {
        self.mobility = mobility;
        self
    }

    pub fn add_ignored_actor(&mut self, actor: ActorId) {
        if !self.ignore_actors.contains(&actor) {
            self.ignore_actors.push(actor);
        }
    }

    pub fn add_ignored_component(&mut self, component: ComponentId) {
        if !self.ignore_components.contains(&component) {
            self.ignore_components.push(component);
        }
    }

    pub fn ignored_actors(&self) -> &[ActorId] {
        &self.ignore_actors
    }

    pub fn ignored_components(&self) -> &[ComponentId] {
        &self.ignore_components
    }

    pub fn clear_ignored(&mut self) {
        self.ignore_actors.clear();
        self.ignore_components.clear();
    }
}

/// Object-type query description
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectQueryParams {
    /// Mask of requested object types
    pub object_types: u32,
    pub ignore_mask: u8,
}

impl ObjectQueryParams {
    pub fn new(types: &[CollisionChannel]) -> Self {
        let mut params = Self::default();
        for channel in types {
            params.add_object_type(*channel);
        }
        params
    }

    /// Every static world object
    pub fn all_static() -> Self {
        Self::new(&[CollisionChannel::WorldStatic])
    }

    /// Every non-static object type
    pub fn all_dynamic() -> Self {
        Self::new(&[
            CollisionChannel::WorldDynamic,
            CollisionChannel::Pawn,
            CollisionChannel::PhysicsBody,
            CollisionChannel::Vehicle,
            CollisionChannel::Destructible,
        ])
    }

    /// Every object type
    pub fn all_objects() -> Self {
        Self {
            object_types: u32::MAX,
            ignore_mask: 0,
        }
    }

    pub fn add_object_type(&mut self, channel: CollisionChannel) {
        self.object_types |= channel.bit();
    }

    pub fn is_valid(&self) -> bool {
        self.object_types != 0
    }
}

/// Channel, params, responses and optional object types of one query
#[derive(Debug, Clone, Default)]
pub struct CollisionQuery {
    pub channel: CollisionChannel,
    pub params: CollisionQueryParams,
    pub responses: ResponseContainer,
    pub object_params: Option<ObjectQueryParams>,
}

impl CollisionQuery {
    /// Trace-channel query with default responses
    pub fn channel(channel: CollisionChannel) -> Self {
        Self {
            channel,
            ..Default::default()
        }
    }

    /// Object-type query
    pub fn objects(object_params: ObjectQueryParams) -> Self {
        Self {
            channel: CollisionChannel::WorldStatic,
            object_params: Some(object_params),
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: CollisionQueryParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_responses(mut self, responses: ResponseContainer) -> Self {
        self.responses = responses;
        self
    }

    /// Object params when they request at least one object type
    pub fn valid_object_params(&self) -> Option<&ObjectQueryParams> {
        self.object_params.as_ref().filter(|p| p.is_valid())
    }

    /// Build the backend query filter; `multi` selects the object-query multi flag
    pub fn filter_data(&self, multi: bool) -> FilterData {
        match self.valid_object_params() {
            Some(object) => FilterData::object_query(
                object.object_types,
                multi,
                self.params.ignore_mask | object.ignore_mask,
                self.params.trace_complex,
            ),
            None => FilterData::trace_query(
                self.channel,
                &self.responses,
                self.params.ignore_mask,
                self.params.trace_complex,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterFlags, QueryKind};

    #[test]
    fn test_object_params_select_object_filter() {
        let query = CollisionQuery::objects(ObjectQueryParams::new(&[CollisionChannel::Pawn]));
        let filter = query.filter_data(true);
        assert_eq!(filter.query_kind(), QueryKind::ObjectQuery);
        assert_eq!(filter.word1, CollisionChannel::Pawn.bit());
        assert!(filter.is_multi_object_query());
        assert!(!query.filter_data(false).is_multi_object_query());
    }

    #[test]
    fn test_empty_object_params_fall_back_to_channel() {
        let mut query = CollisionQuery::channel(CollisionChannel::Camera);
        query.object_params = Some(ObjectQueryParams::default());
        let filter = query.filter_data(false);
        assert_eq!(filter.query_kind(), QueryKind::TraceQuery);
        assert_eq!(filter.channel(), Some(CollisionChannel::Camera));
    }

    #[test]
    fn test_trace_complex_sets_flag() {
        let query = CollisionQuery::channel(CollisionChannel::Visibility)
            .with_params(CollisionQueryParams::new("complex", true));
        assert_eq!(query.filter_data(false).flags(), FilterFlags::COMPLEX_COLLISION);
    }

    #[test]
    fn test_ignore_lists_dedup() {
        let mut params = CollisionQueryParams::default();
        params.add_ignored_actor(ActorId(1));
        params.add_ignored_actor(ActorId(1));
        params.add_ignored_component(ComponentId(2));
        assert_eq!(params.ignored_actors().len(), 1);
        assert_eq!(params.ignored_components(), &[ComponentId(2)]);
    }
}
