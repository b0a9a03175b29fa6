//! Engine-side hit and overlap records

use crate::identity::{ActorId, BodyId, ComponentId};
use crate::material::MaterialId;
use crate::math::Vec3;
use std::cmp::Ordering;
use std::sync::Arc;

/// Result of a trace or sweep against one shape
#[derive(Debug, Clone, PartialEq)]
pub struct HitResult {
    pub trace_start: Vec3,
    pub trace_end: Vec3,
    /// Where the moving shape ended up; never inside the hit geometry
    pub location: Vec3,
    /// Contact point on the hit geometry
    pub impact_point: Vec3,
    /// Normal of the moving shape at impact (equals `impact_normal` for rays)
    pub normal: Vec3,
    /// Normal of the hit surface
    pub impact_normal: Vec3,
    pub penetration_depth: f32,
    /// Fraction along the trace in [0, 1]
    pub time: f32,
    pub distance: f32,
    pub blocking_hit: bool,
    pub start_penetrating: bool,
    pub actor: Option<ActorId>,
    pub component: Option<ComponentId>,
    pub body: Option<BodyId>,
    pub phys_material: Option<MaterialId>,
    pub bone_name: Option<Arc<str>>,
    pub item: Option<i32>,
    pub face_index: Option<u32>,
}

impl Default for HitResult {
    fn default() -> Self {
        Self::new(Vec3::zeros(), Vec3::zeros())
    }
}

impl HitResult {
    /// Empty result for a trace from `trace_start` to `trace_end`
    pub fn new(trace_start: Vec3, trace_end: Vec3) -> Self {
        Self {
            trace_start,
            trace_end,
            location: Vec3::zeros(),
            impact_point: Vec3::zeros(),
            normal: Vec3::zeros(),
            impact_normal: Vec3::zeros(),
            penetration_depth: 0.0,
            time: 1.0,
            distance: 0.0,
            blocking_hit: false,
            start_penetrating: false,
            actor: None,
            component: None,
            body: None,
            phys_material: None,
            bone_name: None,
            item: None,
            face_index: None,
        }
    }

    /// Reset to an empty result for a new trace
    pub fn reset(&mut self, trace_start: Vec3, trace_end: Vec3) {
        *self = Self::new(trace_start, trace_end);
    }

    /// Blocking hit that did not start in penetration
    pub fn is_valid_blocking_hit(&self) -> bool {
        self.blocking_hit && !self.start_penetrating
    }

    /// True if the hit has no NaN or infinite values in its geometric fields
    pub fn is_finite(&self) -> bool {
        let vectors = [&self.location, &self.impact_point, &self.normal, &self.impact_normal];
        vectors.iter().all(|v| v.iter().all(|c| c.is_finite()))
            && self.time.is_finite()
            && self.distance.is_finite()
            && self.penetration_depth.is_finite()
    }
}

/// Hit ordering: by time, and at equal time non-blocking hits first
pub fn compare_hits(a: &HitResult, b: &HitResult) -> Ordering {
    a.time
        .total_cmp(&b.time)
        .then(a.blocking_hit.cmp(&b.blocking_hit))
}

/// Stable sort by `compare_hits`
pub fn sort_hits(hits: &mut [HitResult]) {
    hits.sort_by(compare_hits);
}

/// Result of an overlap query against one shape
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OverlapResult {
    pub actor: Option<ActorId>,
    pub component: Option<ComponentId>,
    pub body: Option<BodyId>,
    pub item: Option<i32>,
    pub blocking_hit: bool,
}

impl OverlapResult {
    /// Key used for deduplication
    pub fn key(&self) -> (Option<ComponentId>, Option<i32>) {
        (self.component, self.item)
    }
}

/// Hits of a multi trace; the blocking hit, if any, is last
#[derive(Debug, Clone, Default)]
pub struct QueryHits {
    pub hits: Vec<HitResult>,
    pub blocking_hit: bool,
}

impl QueryHits {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// The blocking hit, when there is one
    pub fn blocking(&self) -> Option<&HitResult> {
        self.hits.last().filter(|h| h.blocking_hit)
    }
}

/// Results of a multi overlap
#[derive(Debug, Clone, Default)]
pub struct QueryOverlaps {
    pub overlaps: Vec<OverlapResult>,
    pub blocking_hit: bool,
}

impl QueryOverlaps {
    pub fn is_empty(&self) -> bool {
        self.overlaps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.overlaps.len()
    }
}
