//! Collision channels, responses and query filter resolution
//!
//! Both queries and shapes carry a four-word `FilterData`. For a query,
//! word0 selects the interpretation:
//!
//! ```text
//! word0  ObjectQuery (0) | TraceQuery (1)
//! word1  trace: channels that block      object: requested object types
//! word2  trace: channels that touch      object: unused
//! word3  [31..24] channel (object query: 1 = multi, 0 = single)
//!        [23..16] mask filter
//!        [15..0]  FilterFlags
//! ```
//!
//! A shape's words use the trace layout with its object type as the channel.

use crate::identity::{ActorId, ComponentId, ShapeIdentity};
use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitOr};

/// Collision channel. Object types and trace channels share this numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum CollisionChannel {
    WorldStatic = 0,
    WorldDynamic = 1,
    Pawn = 2,
    Visibility = 3,
    Camera = 4,
    PhysicsBody = 5,
    Vehicle = 6,
    Destructible = 7,
    EngineTraceChannel1 = 8,
    EngineTraceChannel2 = 9,
    EngineTraceChannel3 = 10,
    EngineTraceChannel4 = 11,
    EngineTraceChannel5 = 12,
    EngineTraceChannel6 = 13,
    GameTraceChannel1 = 14,
    GameTraceChannel2 = 15,
    GameTraceChannel3 = 16,
    GameTraceChannel4 = 17,
    GameTraceChannel5 = 18,
    GameTraceChannel6 = 19,
    GameTraceChannel7 = 20,
    GameTraceChannel8 = 21,
    GameTraceChannel9 = 22,
    GameTraceChannel10 = 23,
    GameTraceChannel11 = 24,
    GameTraceChannel12 = 25,
    GameTraceChannel13 = 26,
    GameTraceChannel14 = 27,
    GameTraceChannel15 = 28,
    GameTraceChannel16 = 29,
    GameTraceChannel17 = 30,
    GameTraceChannel18 = 31,
    /// Legacy channel: every shape reports a touch, nothing blocks
    OverlapAllDeprecated = 32,
}

impl Default for CollisionChannel {
    fn default() -> Self {
        Self::Visibility
    }
}

impl CollisionChannel {
    /// Number of channels stored in a response table
    pub const COUNT: usize = 32;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit for this channel in a channel mask; zero for channels past the mask width
    #[inline]
    pub fn bit(self) -> u32 {
        bit_for_index(self as u8)
    }

    /// Channel from its numeric value
    pub fn from_index(index: u8) -> Option<Self> {
        use CollisionChannel::*;
        const ALL: [CollisionChannel; 33] = [
            WorldStatic,
            WorldDynamic,
            Pawn,
            Visibility,
            Camera,
            PhysicsBody,
            Vehicle,
            Destructible,
            EngineTraceChannel1,
            EngineTraceChannel2,
            EngineTraceChannel3,
            EngineTraceChannel4,
            EngineTraceChannel5,
            EngineTraceChannel6,
            GameTraceChannel1,
            GameTraceChannel2,
            GameTraceChannel3,
            GameTraceChannel4,
            GameTraceChannel5,
            GameTraceChannel6,
            GameTraceChannel7,
            GameTraceChannel8,
            GameTraceChannel9,
            GameTraceChannel10,
            GameTraceChannel11,
            GameTraceChannel12,
            GameTraceChannel13,
            GameTraceChannel14,
            GameTraceChannel15,
            GameTraceChannel16,
            GameTraceChannel17,
            GameTraceChannel18,
            OverlapAllDeprecated,
        ];
        ALL.get(index as usize).copied()
    }
}

#[inline]
fn bit_for_index(index: u8) -> u32 {
    if (index as usize) < CollisionChannel::COUNT {
        1u32 << index
    } else {
        0
    }
}

/// How a shape responds to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum CollisionResponse {
    Ignore,
    Overlap,
    #[default]
    Block,
}

/// Per-channel response table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseContainer {
    responses: [CollisionResponse; CollisionChannel::COUNT],
}

impl Default for ResponseContainer {
    fn default() -> Self {
        Self::all(CollisionResponse::Block)
    }
}

impl ResponseContainer {
    /// Table with every channel set to `response`
    pub fn all(response: CollisionResponse) -> Self {
        Self {
            responses: [response; CollisionChannel::COUNT],
        }
    }

    pub fn response(&self, channel: CollisionChannel) -> CollisionResponse {
        self.responses
            .get(channel.index())
            .copied()
            .unwrap_or(CollisionResponse::Ignore)
    }

    /// Set one channel; returns true if the table changed
    pub fn set_response(&mut self, channel: CollisionChannel, response: CollisionResponse) -> bool {
        match self.responses.get_mut(channel.index()) {
            Some(slot) if *slot != response => {
                *slot = response;
                true
            }
            _ => false,
        }
    }

    /// Set every channel; returns true if the table changed
    pub fn set_all(&mut self, response: CollisionResponse) -> bool {
        let changed = self.responses.iter().any(|r| *r != response);
        self.responses = [response; CollisionChannel::COUNT];
        changed
    }

    /// Builder variant of `set_response`
    pub fn with_response(mut self, channel: CollisionChannel, response: CollisionResponse) -> Self {
        self.set_response(channel, response);
        self
    }

    /// Channel-wise minimum of two tables
    pub fn min(a: &Self, b: &Self) -> Self {
        let mut out = *a;
        for (slot, other) in out.responses.iter_mut().zip(b.responses.iter()) {
            *slot = (*slot).min(*other);
        }
        out
    }

    /// Mask of channels that block
    pub fn block_mask(&self) -> u32 {
        self.mask_of(CollisionResponse::Block)
    }

    /// Mask of channels that overlap
    pub fn touch_mask(&self) -> u32 {
        self.mask_of(CollisionResponse::Overlap)
    }

    fn mask_of(&self, wanted: CollisionResponse) -> u32 {
        self.responses
            .iter()
            .enumerate()
            .filter(|(_, r)| **r == wanted)
            .fold(0u32, |acc, (i, _)| acc | bit_for_index(i as u8))
    }
}

/// Shape and query flags stored in the low bits of word3
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FilterFlags(pub u16);

impl FilterFlags {
    pub const NONE: Self = Self(0);
    /// Shape is simple collision / query wants simple collision
    pub const SIMPLE_COLLISION: Self = Self(1 << 0);
    /// Shape is complex collision / query wants complex collision
    pub const COMPLEX_COLLISION: Self = Self(1 << 1);
    pub const CCD: Self = Self(1 << 2);
    pub const CONTACT_NOTIFY: Self = Self(1 << 3);
    pub const STATIC_SHAPE: Self = Self(1 << 4);
    pub const MODIFY_CONTACTS: Self = Self(1 << 5);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn set(&mut self, other: Self, enabled: bool) {
        if enabled {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }

    /// Query flags for simple or complex tracing
    pub fn for_trace_complex(trace_complex: bool) -> Self {
        if trace_complex {
            Self::COMPLEX_COLLISION
        } else {
            Self::SIMPLE_COLLISION
        }
    }
}

impl BitOr for FilterFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for FilterFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Interpretation of a query filter, stored in word0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QueryKind {
    ObjectQuery = 0,
    TraceQuery = 1,
}

/// Object-query word3 channel value for multi-result queries
pub const OBJECT_QUERY_MULTI: u8 = 1;
/// Object-query word3 channel value for single-result queries
pub const OBJECT_QUERY_SINGLE: u8 = 0;

/// Four-word filter record shared by queries and shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FilterData {
    pub word0: u32,
    pub word1: u32,
    pub word2: u32,
    pub word3: u32,
}

impl FilterData {
    #[inline]
    fn pack_word3(channel: u8, mask_filter: u8, flags: FilterFlags) -> u32 {
        ((channel as u32) << 24) | ((mask_filter as u32) << 16) | flags.0 as u32
    }

    /// Filter for a trace-channel query
    pub fn trace_query(
        channel: CollisionChannel,
        responses: &ResponseContainer,
        mask_filter: u8,
        trace_complex: bool,
    ) -> Self {
        Self {
            word0: QueryKind::TraceQuery as u32,
            word1: responses.block_mask(),
            word2: responses.touch_mask(),
            word3: Self::pack_word3(
                channel as u8,
                mask_filter,
                FilterFlags::for_trace_complex(trace_complex),
            ),
        }
    }

    /// Filter for an object-type query
    pub fn object_query(object_types: u32, multi: bool, mask_filter: u8, trace_complex: bool) -> Self {
        Self {
            word0: QueryKind::ObjectQuery as u32,
            word1: object_types,
            word2: 0,
            word3: Self::pack_word3(
                if multi {
                    OBJECT_QUERY_MULTI
                } else {
                    OBJECT_QUERY_SINGLE
                },
                mask_filter,
                FilterFlags::for_trace_complex(trace_complex),
            ),
        }
    }

    /// Filter stored on a shape
    pub fn shape(
        object_type: CollisionChannel,
        responses: &ResponseContainer,
        mask_filter: u8,
        flags: FilterFlags,
    ) -> Self {
        Self {
            word0: 0,
            word1: responses.block_mask(),
            word2: responses.touch_mask(),
            word3: Self::pack_word3(object_type as u8, mask_filter, flags),
        }
    }

    pub fn query_kind(&self) -> QueryKind {
        if self.word0 == QueryKind::TraceQuery as u32 {
            QueryKind::TraceQuery
        } else {
            QueryKind::ObjectQuery
        }
    }

    /// Raw channel byte (object queries: multi flag)
    #[inline]
    pub fn channel_index(&self) -> u8 {
        (self.word3 >> 24) as u8
    }

    #[inline]
    pub fn channel(&self) -> Option<CollisionChannel> {
        CollisionChannel::from_index(self.channel_index())
    }

    #[inline]
    pub fn mask_filter(&self) -> u8 {
        ((self.word3 >> 16) & 0xFF) as u8
    }

    #[inline]
    pub fn flags(&self) -> FilterFlags {
        FilterFlags((self.word3 & 0xFFFF) as u16)
    }

    pub fn set_flags(&mut self, flags: FilterFlags) {
        self.word3 = (self.word3 & 0xFFFF_0000) | flags.0 as u32;
    }

    pub fn set_mask_filter(&mut self, mask_filter: u8) {
        self.word3 = (self.word3 & 0xFF00_FFFF) | ((mask_filter as u32) << 16);
    }

    /// Whether this is an object query asking for multiple results
    pub fn is_multi_object_query(&self) -> bool {
        self.query_kind() == QueryKind::ObjectQuery && self.channel_index() == OBJECT_QUERY_MULTI
    }
}

/// Outcome of filtering a query against a shape; ordered Ignore < Touch < Block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum HitType {
    #[default]
    Ignore,
    Touch,
    Block,
}

impl HitType {
    fn from_masks(bit: u32, block_mask: u32, touch_mask: u32) -> Self {
        if bit & block_mask != 0 {
            HitType::Block
        } else if bit & touch_mask != 0 {
            HitType::Touch
        } else {
            HitType::Ignore
        }
    }
}

/// Decide how `query` treats a shape with filter `shape`.
///
/// `prefilter` distinguishes the pass that runs while the backend collects
/// hits (multi object queries must report touches so the query continues)
/// from the final classification of a hit.
pub fn classify(query: &FilterData, shape: &FilterData, prefilter: bool) -> HitType {
    if query.mask_filter() & shape.mask_filter() != 0 {
        return HitType::Ignore;
    }

    let shape_bit = bit_for_index(shape.channel_index());

    match query.query_kind() {
        QueryKind::ObjectQuery => {
            if shape_bit & query.word1 == 0 {
                return HitType::Ignore;
            }
            if prefilter && query.channel_index() == OBJECT_QUERY_MULTI {
                HitType::Touch
            } else {
                HitType::Block
            }
        }
        QueryKind::TraceQuery => {
            let querier_channel = query.channel_index();
            if querier_channel == CollisionChannel::OverlapAllDeprecated as u8 {
                return HitType::Touch;
            }
            let querier_bit = bit_for_index(querier_channel);
            // what the shape thinks of the querier's channel
            let querier_hit = HitType::from_masks(querier_bit, shape.word1, shape.word2);
            // what the querier thinks of the shape's object type
            let shape_hit = HitType::from_masks(shape_bit, query.word1, query.word2);
            querier_hit.min(shape_hit)
        }
    }
}

/// Which shapes a query may see by mobility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueryMobility {
    #[default]
    Any,
    Static,
    Dynamic,
}

impl QueryMobility {
    pub fn accepts(self, shape_flags: FilterFlags) -> bool {
        let is_static = shape_flags.contains(FilterFlags::STATIC_SHAPE);
        match self {
            Self::Any => true,
            Self::Static => is_static,
            Self::Dynamic => !is_static,
        }
    }
}

/// Per-query pre/post filter applied to every candidate shape
#[derive(Debug, Clone, Default)]
pub struct QueryFilterCallback<'a> {
    pub ignore_components: &'a [ComponentId],
    pub ignore_actors: &'a [ActorId],
    pub ignore_touches: bool,
    pub ignore_blocks: bool,
    pub discard_initial_overlaps: bool,
    pub mobility: QueryMobility,
}

impl<'a> QueryFilterCallback<'a> {
    pub fn new(ignore_components: &'a [ComponentId], ignore_actors: &'a [ActorId]) -> Self {
        Self {
            ignore_components,
            ignore_actors,
            ..Default::default()
        }
    }

    /// Filter a shape before the backend tests its geometry
    pub fn pre_filter(&self, query: &FilterData, shape: &FilterData, identity: Option<&ShapeIdentity>) -> HitType {
        let common = query.flags() & shape.flags();
        if !common.intersects(FilterFlags::SIMPLE_COLLISION | FilterFlags::COMPLEX_COLLISION) {
            return HitType::Ignore;
        }
        if !self.mobility.accepts(shape.flags()) {
            return HitType::Ignore;
        }

        let result = classify(query, shape, true);
        if result == HitType::Touch && self.ignore_touches {
            return HitType::Ignore;
        }
        if result == HitType::Block && self.ignore_blocks {
            return HitType::Ignore;
        }
        if result == HitType::Ignore {
            return result;
        }

        if let Some(identity) = identity {
            if self.ignore_components.contains(&identity.component)
                || self.ignore_actors.contains(&identity.actor)
            {
                return HitType::Ignore;
            }
        }
        result
    }

    /// Filter a sweep hit after geometry testing
    pub fn post_filter(&self, prefilter_result: HitType, initial_overlap: bool) -> HitType {
        if !initial_overlap {
            return prefilter_result;
        }
        if self.discard_initial_overlaps {
            HitType::Ignore
        } else if prefilter_result == HitType::Block {
            // keep sweeping past the start
            HitType::Touch
        } else {
            prefilter_result
        }
    }
}
