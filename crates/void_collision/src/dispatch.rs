//! Scene query dispatch
//!
//! `SceneQuery` runs raycasts, sweeps and overlaps against every logical
//! scene of a world: the first ("sync") scene always, the others only when
//! the query asks for them. Results from several scenes are merged so the
//! caller sees one nearest-first list with at most one blocking hit.
//!
//! ```text
//!   query ──► scene 0 ──► convert ──┐
//!             scene 1 ──► convert ──┼──► merge ──► observer ──► caller
//!             (limited to nearest   │
//!              block distance)   ───┘
//! ```

use crate::backend::{QueryMode, QueryRequest, RapierScene, RawHits, SceneBackend};
use crate::config::CollisionConfig;
use crate::convert::{
    add_sweep_results, convert_hit, convert_overlap_results, convert_raycast_results, ConversionStatus, HitContext,
};
use crate::filter::{FilterData, QueryFilterCallback};
use crate::hit::{sort_hits, HitResult, OverlapResult, QueryHits, QueryOverlaps};
use crate::math::{Quat, Vec3, KINDA_SMALL_NUMBER, SMALL_NUMBER};
use crate::observer::{CollisionObserver, OverlapRecord, TraceKind, TraceRecord};
use crate::params::CollisionQuery;
use crate::shape::{adapt_shape, CollisionShape, GeometryHandle};
use parking_lot::RwLock;

/// What an overlap query wants to know
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapInfo {
    /// Every overlapping shape
    GatherAll,
    /// Whether any shape blocks
    IsBlocking,
    /// Whether anything overlaps at all
    IsAnything,
}

#[derive(Clone, Copy)]
enum Cast<'g> {
    Ray,
    Sweep(&'g GeometryHandle),
}

impl<'g> Cast<'g> {
    fn kind(&self) -> TraceKind {
        match self {
            Self::Ray => TraceKind::Raycast,
            Self::Sweep(_) => TraceKind::Sweep,
        }
    }

    fn geometry(self) -> Option<&'g GeometryHandle> {
        match self {
            Self::Ray => None,
            Self::Sweep(geometry) => Some(geometry),
        }
    }
}

/// Trace segment resolved into direction and length
struct Segment {
    start: Vec3,
    end: Vec3,
    dir: Vec3,
    length: f32,
}

impl Segment {
    /// `None` for traces too short to run
    fn new(start: &Vec3, end: &Vec3) -> Option<Self> {
        let delta = end - start;
        let length = delta.norm();
        if length <= KINDA_SMALL_NUMBER || !length.is_finite() {
            return None;
        }
        Some(Self {
            start: *start,
            end: *end,
            dir: delta / length,
            length,
        })
    }
}

/// Query front end over a set of scenes
pub struct SceneQuery<'a, B: SceneBackend = RapierScene> {
    scenes: &'a [RwLock<B>],
    config: &'a CollisionConfig,
    observer: &'a dyn CollisionObserver,
}

impl<'a, B: SceneBackend> SceneQuery<'a, B> {
    pub fn new(scenes: &'a [RwLock<B>], config: &'a CollisionConfig, observer: &'a dyn CollisionObserver) -> Self {
        Self {
            scenes,
            config,
            observer,
        }
    }

    /// Scenes a query runs against, in order
    fn scenes_for(&self, query: &CollisionQuery) -> &'a [RwLock<B>] {
        let count = if query.params.trace_async_scene {
            self.scenes.len()
        } else {
            self.scenes.len().min(1)
        };
        &self.scenes[..count]
    }

    fn callback<'q>(&self, query: &'q CollisionQuery) -> QueryFilterCallback<'q> {
        let mut callback =
            QueryFilterCallback::new(query.params.ignored_components(), query.params.ignored_actors());
        callback.mobility = query.params.mobility;
        callback.discard_initial_overlaps = !query.params.find_initial_overlaps;
        callback
    }

    fn context<'c>(
        &'c self,
        segment: &Segment,
        query: &CollisionQuery,
        filter: &'c FilterData,
        cast: Cast<'c>,
    ) -> HitContext<'c> {
        HitContext {
            trace_start: segment.start,
            trace_end: segment.end,
            check_length: segment.length,
            query_filter: filter,
            sweep_geometry: cast.geometry(),
            return_face_index: query.params.return_face_index,
            return_physical_material: query.params.return_physical_material,
            config: self.config,
        }
    }

    fn cast(
        &self,
        scene: &B,
        cast: Cast<'_>,
        segment: &Segment,
        max: f32,
        request: &QueryRequest<'_>,
        tag: &str,
    ) -> RawHits {
        let hits = match cast {
            Cast::Ray => scene.raycast(&segment.start, &segment.dir, max, request),
            Cast::Sweep(geometry) => scene.sweep(geometry, &segment.start, &segment.dir, max, request),
        };
        if hits.overflowed {
            log::warn!(
                "Hit buffer overflow ({} entries) for trace '{}' from {:?} to {:?}; results truncated",
                request.buffer_size,
                tag,
                segment.start,
                segment.end
            );
        }
        hits
    }

    fn report_invalid(&self, segment: &Segment, query: &CollisionQuery) {
        log::error!(
            "Non-finite hit result: start {:?} end {:?} channel {:?} params {:?}",
            segment.start,
            segment.end,
            query.channel,
            query.params
        );
    }

    fn notify_trace(
        &self,
        cast: Cast<'_>,
        mode: QueryMode,
        start: &Vec3,
        end: &Vec3,
        query: &CollisionQuery,
        hits: &[HitResult],
    ) {
        self.observer.on_trace(&TraceRecord {
            kind: cast.kind(),
            mode,
            start: *start,
            end: *end,
            channel: query.channel,
            tag: &query.params.trace_tag,
            hits,
        });
    }

    // ---- generic trace drivers ----

    fn trace_test(&self, cast: Cast<'_>, start: &Vec3, end: &Vec3, query: &CollisionQuery) -> bool {
        let Some(segment) = Segment::new(start, end) else {
            return false;
        };
        let mut callback = self.callback(query);
        callback.ignore_touches = true;
        let mut request = QueryRequest::new(query.filter_data(false), callback, QueryMode::Any, 1);
        request.post_filter = matches!(cast, Cast::Sweep(_));

        let blocked = self
            .scenes_for(query)
            .iter()
            .any(|scene| {
                self.cast(&scene.read(), cast, &segment, segment.length, &request, &query.params.trace_tag)
                    .has_block()
            });
        self.notify_trace(cast, QueryMode::Any, start, end, query, &[]);
        blocked
    }

    fn trace_single(&self, cast: Cast<'_>, start: &Vec3, end: &Vec3, query: &CollisionQuery) -> HitResult {
        let Some(segment) = Segment::new(start, end) else {
            return HitResult::new(*start, *end);
        };
        let filter = query.filter_data(false);
        let mut callback = self.callback(query);
        callback.ignore_touches = true;
        let mut request = QueryRequest::new(filter, callback, QueryMode::Single, 1);
        request.compute_mtd = matches!(cast, Cast::Sweep(_));
        let ctx = self.context(&segment, query, &filter, cast);

        let mut best: Option<HitResult> = None;
        for scene in self.scenes_for(query) {
            let max = best.as_ref().map_or(segment.length, |b| b.distance);
            if best.is_some() && max <= SMALL_NUMBER {
                break;
            }
            let guard = scene.read();
            let raws = self.cast(&guard, cast, &segment, max, &request, &query.params.trace_tag);
            let Some(block) = raws.block else {
                drop(guard);
                continue;
            };
            let converted = convert_hit(&*guard, &block, &ctx);
            drop(guard);
            match converted {
                Ok(hit) if hit.blocking_hit => {
                    if best.as_ref().map_or(true, |b| hit.distance < b.distance) {
                        best = Some(hit);
                    }
                }
                Ok(_) => {}
                Err(_) => self.report_invalid(&segment, query),
            }
        }

        let result = best.unwrap_or_else(|| HitResult::new(*start, *end));
        self.notify_trace(cast, QueryMode::Single, start, end, query, std::slice::from_ref(&result));
        result
    }

    fn trace_multi(&self, cast: Cast<'_>, start: &Vec3, end: &Vec3, query: &CollisionQuery) -> QueryHits {
        let Some(segment) = Segment::new(start, end) else {
            return QueryHits::default();
        };
        let filter = query.filter_data(true);
        let mut request = QueryRequest::new(filter, self.callback(query), QueryMode::Multi, self.config.hit_buffer_size);
        request.post_filter = matches!(cast, Cast::Sweep(_));
        let ctx = self.context(&segment, query, &filter, cast);

        let mut hits: Vec<HitResult> = Vec::new();
        let mut block_distance: Option<f32> = None;
        for scene in self.scenes_for(query) {
            let max = block_distance.unwrap_or(segment.length);
            if block_distance.is_some() && max <= SMALL_NUMBER {
                break;
            }
            let guard = scene.read();
            let raws = self.cast(&guard, cast, &segment, max, &request, &query.params.trace_tag);
            if raws.is_empty() {
                drop(guard);
                continue;
            }
            let status = match cast {
                Cast::Ray => {
                    let (converted, status) = convert_raycast_results(&*guard, &raws, &ctx);
                    hits.extend(converted);
                    status
                }
                Cast::Sweep(_) => add_sweep_results(&*guard, &raws, &ctx, &mut hits),
            };
            drop(guard);
            if status == ConversionStatus::Invalid {
                self.report_invalid(&segment, query);
            }
            block_distance = keep_nearest_block(&mut hits);
        }

        let result = QueryHits {
            blocking_hit: block_distance.is_some(),
            hits,
        };
        self.notify_trace(cast, QueryMode::Multi, start, end, query, &result.hits);
        result
    }

    // ---- raycasts ----

    /// True if anything blocks the segment
    pub fn raycast_test(&self, start: &Vec3, end: &Vec3, query: &CollisionQuery) -> bool {
        self.trace_test(Cast::Ray, start, end, query)
    }

    /// Nearest blocking hit; a non-blocking default result when nothing blocks
    pub fn raycast_single(&self, start: &Vec3, end: &Vec3, query: &CollisionQuery) -> HitResult {
        self.trace_single(Cast::Ray, start, end, query)
    }

    /// Touches in front of the nearest block, followed by the block
    pub fn raycast_multi(&self, start: &Vec3, end: &Vec3, query: &CollisionQuery) -> QueryHits {
        self.trace_multi(Cast::Ray, start, end, query)
    }

    // ---- sweeps ----

    pub fn sweep_test(
        &self,
        start: &Vec3,
        end: &Vec3,
        rotation: &Quat,
        shape: &CollisionShape,
        query: &CollisionQuery,
    ) -> bool {
        // traced as a ray: a start touching a surface is not start-penetrating
        if shape.is_nearly_zero() {
            return self.raycast_test(start, end, query);
        }
        let geometry = adapt_shape(rotation, shape);
        self.trace_test(Cast::Sweep(&geometry), start, end, query)
    }

    pub fn sweep_single(
        &self,
        start: &Vec3,
        end: &Vec3,
        rotation: &Quat,
        shape: &CollisionShape,
        query: &CollisionQuery,
    ) -> HitResult {
        // traced as a ray: a start touching a surface is not start-penetrating
        if shape.is_nearly_zero() {
            return self.raycast_single(start, end, query);
        }
        let geometry = adapt_shape(rotation, shape);
        self.trace_single(Cast::Sweep(&geometry), start, end, query)
    }

    pub fn sweep_multi(
        &self,
        start: &Vec3,
        end: &Vec3,
        rotation: &Quat,
        shape: &CollisionShape,
        query: &CollisionQuery,
    ) -> QueryHits {
        // traced as a ray: a start touching a surface is not start-penetrating
        if shape.is_nearly_zero() {
            return self.raycast_multi(start, end, query);
        }
        let geometry = adapt_shape(rotation, shape);
        self.trace_multi(Cast::Sweep(&geometry), start, end, query)
    }

    /// Multi sweep of prepared geometry, e.g. taken from a body's shape
    pub fn sweep_geometry_multi(
        &self,
        geometry: &GeometryHandle,
        start: &Vec3,
        end: &Vec3,
        query: &CollisionQuery,
    ) -> QueryHits {
        self.trace_multi(Cast::Sweep(geometry), start, end, query)
    }

    // ---- overlaps ----

    /// True if a blocking shape overlaps
    pub fn overlap_test(&self, position: &Vec3, rotation: &Quat, shape: &CollisionShape, query: &CollisionQuery) -> bool {
        if shape.is_line() {
            log::warn!("Overlap query with unsupported shape {:?}", shape);
            return false;
        }
        let geometry = adapt_shape(rotation, shape);
        !self
            .overlap(&geometry, position, query, OverlapInfo::IsBlocking)
            .is_empty()
    }

    /// True if any shape overlaps, blocking or not
    pub fn overlap_any_test(&self, position: &Vec3, rotation: &Quat, shape: &CollisionShape, query: &CollisionQuery) -> bool {
        if shape.is_line() {
            log::warn!("Overlap query with unsupported shape {:?}", shape);
            return false;
        }
        let geometry = adapt_shape(rotation, shape);
        !self
            .overlap(&geometry, position, query, OverlapInfo::IsAnything)
            .is_empty()
    }

    /// Every overlapping (component, item), blocking entries winning duplicates
    pub fn overlap_multi(
        &self,
        position: &Vec3,
        rotation: &Quat,
        shape: &CollisionShape,
        query: &CollisionQuery,
    ) -> QueryOverlaps {
        if shape.is_line() {
            log::warn!("Overlap query with unsupported shape {:?}", shape);
            return QueryOverlaps::default();
        }
        let geometry = adapt_shape(rotation, shape);
        self.overlap_geometry_multi(&geometry, position, query)
    }

    pub fn overlap_geometry_multi(&self, geometry: &GeometryHandle, position: &Vec3, query: &CollisionQuery) -> QueryOverlaps {
        let overlaps = self.overlap(geometry, position, query, OverlapInfo::GatherAll);
        QueryOverlaps {
            blocking_hit: overlaps.iter().any(|o| o.blocking_hit),
            overlaps,
        }
    }

    fn overlap(
        &self,
        geometry: &GeometryHandle,
        position: &Vec3,
        query: &CollisionQuery,
        info: OverlapInfo,
    ) -> Vec<OverlapResult> {
        let multi = info == OverlapInfo::GatherAll;
        let filter = query.filter_data(multi);
        let mut callback = self.callback(query);
        callback.ignore_touches = info == OverlapInfo::IsBlocking;
        let (mode, buffer_size) = if multi {
            (QueryMode::Multi, self.config.overlap_buffer_size)
        } else {
            (QueryMode::Any, 1)
        };
        let request = QueryRequest::new(filter, callback, mode, buffer_size);

        let mut results = Vec::new();
        for scene in self.scenes_for(query) {
            let guard = scene.read();
            let raws = guard.overlap(geometry, position, &request);
            if raws.overflowed {
                log::warn!(
                    "Overlap buffer overflow ({} entries) at {:?}; results truncated",
                    buffer_size,
                    position
                );
            }
            if raws.is_empty() {
                drop(guard);
                continue;
            }
            convert_overlap_results(&*guard, &raws, &filter, &mut results);
            drop(guard);
            if !multi {
                break;
            }
        }

        self.observer.on_overlap(&OverlapRecord {
            mode,
            position: *position,
            channel: query.channel,
            tag: &query.params.trace_tag,
            overlaps: &results,
        });
        results
    }
}

/// Drop hits at or behind the nearest block and sort; returns the block distance.
fn keep_nearest_block(hits: &mut Vec<HitResult>) -> Option<f32> {
    let nearest = hits
        .iter()
        .enumerate()
        .filter(|(_, h)| h.blocking_hit)
        .min_by(|a, b| a.1.distance.total_cmp(&b.1.distance))
        .map(|(index, h)| (index, h.distance));

    if let Some((block_index, distance)) = nearest {
        let mut index = 0;
        hits.retain(|h| {
            let keep = index == block_index || (!h.blocking_hit && h.distance < distance);
            index += 1;
            keep
        });
    }
    sort_hits(hits);
    nearest.map(|(_, distance)| distance)
}
