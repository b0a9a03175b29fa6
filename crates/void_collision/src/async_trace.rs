//! Frame-deferred batch traces and overlaps
//!
//! Requests queued during frame N run on background threads in chunks of
//! `async_trace_chunk_size` and are collected during frame N+1:
//!
//! ```text
//!  frame N:    trace() ─► buffer[N % 2] ──(chunk full)──► worker
//!              finish_async_trace()  dispatch rest, frame = N+1
//!  frame N+1:  reset_async_trace()   join workers, fire delegates
//!              query_trace_data(handle of N) ─► results
//! ```
//!
//! Handles are `(frame, index)` pairs and stay valid for the frame they were
//! issued in and the one after.

use crate::backend::RapierScene;
use crate::config::CollisionConfig;
use crate::dispatch::SceneQuery;
use crate::hit::{QueryHits, QueryOverlaps};
use crate::math::{Quat, Vec3};
use crate::observer::CollisionObserver;
use crate::params::CollisionQuery;
use crate::scene::{PhysScene, SceneSet};
use crate::shape::CollisionShape;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// How much a request wants to know
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsyncTraceType {
    /// Only whether something blocks
    Test,
    /// The nearest blocking hit
    #[default]
    Single,
    /// Every hit up to and including the nearest block
    Multi,
}

/// What a trace moves along its segment
#[derive(Debug, Clone, Default)]
pub enum TraceGeometry {
    #[default]
    Line,
    Shape { rotation: Quat, shape: CollisionShape },
}

/// One queued trace
#[derive(Debug, Clone)]
pub struct TraceRequest {
    pub start: Vec3,
    pub end: Vec3,
    pub geometry: TraceGeometry,
    pub trace_type: AsyncTraceType,
    pub query: CollisionQuery,
}

impl TraceRequest {
    pub fn line(start: Vec3, end: Vec3, trace_type: AsyncTraceType, query: CollisionQuery) -> Self {
        Self {
            start,
            end,
            geometry: TraceGeometry::Line,
            trace_type,
            query,
        }
    }

    pub fn sweep(
        start: Vec3,
        end: Vec3,
        rotation: Quat,
        shape: CollisionShape,
        trace_type: AsyncTraceType,
        query: CollisionQuery,
    ) -> Self {
        Self {
            start,
            end,
            geometry: TraceGeometry::Shape { rotation, shape },
            trace_type,
            query,
        }
    }

    fn run(&self, scenes: &SceneQuery<'_>) -> QueryHits {
        let (start, end, query) = (&self.start, &self.end, &self.query);
        match (&self.geometry, self.trace_type) {
            (TraceGeometry::Line, AsyncTraceType::Test) => QueryHits {
                hits: Vec::new(),
                blocking_hit: scenes.raycast_test(start, end, query),
            },
            (TraceGeometry::Line, AsyncTraceType::Single) => single(scenes.raycast_single(start, end, query)),
            (TraceGeometry::Line, AsyncTraceType::Multi) => scenes.raycast_multi(start, end, query),
            (TraceGeometry::Shape { rotation, shape }, AsyncTraceType::Test) => QueryHits {
                hits: Vec::new(),
                blocking_hit: scenes.sweep_test(start, end, rotation, shape, query),
            },
            (TraceGeometry::Shape { rotation, shape }, AsyncTraceType::Single) => {
                single(scenes.sweep_single(start, end, rotation, shape, query))
            }
            (TraceGeometry::Shape { rotation, shape }, AsyncTraceType::Multi) => {
                scenes.sweep_multi(start, end, rotation, shape, query)
            }
        }
    }
}

fn single(hit: crate::hit::HitResult) -> QueryHits {
    let blocking_hit = hit.blocking_hit;
    QueryHits {
        hits: if blocking_hit { vec![hit] } else { Vec::new() },
        blocking_hit,
    }
}

/// One queued overlap; `Single` behaves like `Test`
#[derive(Debug, Clone)]
pub struct OverlapRequest {
    pub position: Vec3,
    pub rotation: Quat,
    pub shape: CollisionShape,
    pub trace_type: AsyncTraceType,
    pub query: CollisionQuery,
}

impl OverlapRequest {
    fn run(&self, scenes: &SceneQuery<'_>) -> QueryOverlaps {
        match self.trace_type {
            AsyncTraceType::Multi => scenes.overlap_multi(&self.position, &self.rotation, &self.shape, &self.query),
            AsyncTraceType::Test | AsyncTraceType::Single => QueryOverlaps {
                overlaps: Vec::new(),
                blocking_hit: scenes.overlap_test(&self.position, &self.rotation, &self.shape, &self.query),
            },
        }
    }
}

/// Handle of a queued trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceHandle {
    pub frame: u64,
    pub index: usize,
}

/// Handle of a queued overlap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverlapHandle {
    pub frame: u64,
    pub index: usize,
}

pub type TraceDelegate = Box<dyn FnOnce(TraceHandle, &TraceRequest, &QueryHits) + Send>;
pub type OverlapDelegate = Box<dyn FnOnce(OverlapHandle, &OverlapRequest, &QueryOverlaps) + Send>;

struct Slot<R, O, D> {
    request: R,
    output: Option<O>,
    delegate: Option<D>,
}

type TraceSlot = Slot<TraceRequest, QueryHits, TraceDelegate>;
type OverlapSlot = Slot<OverlapRequest, QueryOverlaps, OverlapDelegate>;

enum ChunkOutput {
    Traces { first: usize, outputs: Vec<QueryHits> },
    Overlaps { first: usize, outputs: Vec<QueryOverlaps> },
}

/// Everything needed to run queries off the game thread
#[derive(Clone)]
struct WorkerContext {
    scenes: Arc<SceneSet>,
    config: Arc<CollisionConfig>,
    observer: Arc<dyn CollisionObserver>,
}

impl WorkerContext {
    fn run(&self, job: Job) -> ChunkOutput {
        let query = SceneQuery::<RapierScene>::new(self.scenes.as_slice(), &self.config, self.observer.as_ref());
        match job {
            Job::Traces { first, requests } => ChunkOutput::Traces {
                first,
                outputs: requests.iter().map(|r| r.run(&query)).collect(),
            },
            Job::Overlaps { first, requests } => ChunkOutput::Overlaps {
                first,
                outputs: requests.iter().map(|r| r.run(&query)).collect(),
            },
        }
    }
}

enum Job {
    Traces { first: usize, requests: Vec<TraceRequest> },
    Overlaps { first: usize, requests: Vec<OverlapRequest> },
}

/// Requests of one frame
struct FrameBuffer {
    frame: u64,
    traces: Vec<TraceSlot>,
    overlaps: Vec<OverlapSlot>,
    dispatched_traces: usize,
    dispatched_overlaps: usize,
    workers: Vec<JoinHandle<()>>,
    tx: Sender<ChunkOutput>,
    rx: Receiver<ChunkOutput>,
    collected: bool,
}

impl FrameBuffer {
    fn new(frame: u64) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            frame,
            traces: Vec::new(),
            overlaps: Vec::new(),
            dispatched_traces: 0,
            dispatched_overlaps: 0,
            workers: Vec::new(),
            tx,
            rx,
            collected: false,
        }
    }

    fn clear(&mut self, frame: u64) {
        if !self.workers.is_empty() {
            log::warn!(
                "Async trace buffer of frame {} recycled with {} chunk(s) in flight",
                self.frame,
                self.workers.len()
            );
            self.join();
        }
        *self = Self::new(frame);
    }

    fn join(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Async trace worker of frame {} panicked", self.frame);
            }
        }
        for output in self.rx.try_iter() {
            match output {
                ChunkOutput::Traces { first, outputs } => {
                    for (slot, output) in self.traces[first..].iter_mut().zip(outputs) {
                        slot.output = Some(output);
                    }
                }
                ChunkOutput::Overlaps { first, outputs } => {
                    for (slot, output) in self.overlaps[first..].iter_mut().zip(outputs) {
                        slot.output = Some(output);
                    }
                }
            }
        }
    }
}

/// Double-buffered frame-deferred trace manager
pub struct AsyncTraceManager {
    context: WorkerContext,
    chunk_size: usize,
    frame: u64,
    buffers: [FrameBuffer; 2],
}

impl AsyncTraceManager {
    /// Manager querying the scenes of `phys`
    pub fn new(phys: &PhysScene) -> Self {
        Self {
            context: WorkerContext {
                scenes: Arc::clone(phys.scenes()),
                config: Arc::new(phys.config().clone()),
                observer: Arc::clone(phys.observer()),
            },
            chunk_size: phys.config().async_trace_chunk_size.max(1),
            frame: 0,
            buffers: [FrameBuffer::new(0), FrameBuffer::new(u64::MAX)],
        }
    }

    /// Current frame number
    pub fn frame(&self) -> u64 {
        self.frame
    }

    fn current(&mut self) -> &mut FrameBuffer {
        &mut self.buffers[(self.frame % 2) as usize]
    }

    fn buffer_for(&self, frame: u64) -> Option<&FrameBuffer> {
        let valid = frame == self.frame || frame.checked_add(1) == Some(self.frame);
        if !valid {
            return None;
        }
        let buffer = &self.buffers[(frame % 2) as usize];
        (buffer.frame == frame).then_some(buffer)
    }

    // ==================== Submission ====================

    /// Queue a trace for this frame
    pub fn trace(&mut self, request: TraceRequest, delegate: Option<TraceDelegate>) -> TraceHandle {
        let (frame, chunk_size) = (self.frame, self.chunk_size);
        let buffer = self.current();
        buffer.traces.push(Slot {
            request,
            output: None,
            delegate,
        });
        let handle = TraceHandle {
            frame,
            index: buffer.traces.len() - 1,
        };
        if buffer.traces.len() - buffer.dispatched_traces >= chunk_size {
            self.dispatch_traces();
        }
        handle
    }

    /// Queue an overlap for this frame
    pub fn overlap(&mut self, request: OverlapRequest, delegate: Option<OverlapDelegate>) -> OverlapHandle {
        let (frame, chunk_size) = (self.frame, self.chunk_size);
        let buffer = self.current();
        buffer.overlaps.push(Slot {
            request,
            output: None,
            delegate,
        });
        let handle = OverlapHandle {
            frame,
            index: buffer.overlaps.len() - 1,
        };
        if buffer.overlaps.len() - buffer.dispatched_overlaps >= chunk_size {
            self.dispatch_overlaps();
        }
        handle
    }

    fn dispatch_traces(&mut self) {
        let buffer = self.current();
        let first = buffer.dispatched_traces;
        if first >= buffer.traces.len() {
            return;
        }
        let requests = buffer.traces[first..].iter().map(|s| s.request.clone()).collect();
        buffer.dispatched_traces = buffer.traces.len();
        self.spawn(Job::Traces { first, requests });
    }

    fn dispatch_overlaps(&mut self) {
        let buffer = self.current();
        let first = buffer.dispatched_overlaps;
        if first >= buffer.overlaps.len() {
            return;
        }
        let requests = buffer.overlaps[first..].iter().map(|s| s.request.clone()).collect();
        buffer.dispatched_overlaps = buffer.overlaps.len();
        self.spawn(Job::Overlaps { first, requests });
    }

    fn spawn(&mut self, job: Job) {
        let context = self.context.clone();
        let frame = self.frame;
        let tx = self.current().tx.clone();

        // the job moves into the thread; build it again if spawning fails
        let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(1);
        let spawned = thread::Builder::new()
            .name(format!("async-trace-{}", frame))
            .spawn(move || {
                if let Ok(job) = job_rx.recv() {
                    let _ = tx.send(context.run(job));
                }
            });

        match spawned {
            Ok(handle) => {
                let _ = job_tx.send(job);
                self.current().workers.push(handle);
            }
            Err(err) => {
                log::warn!("Failed to start async trace worker ({}); running chunk inline", err);
                let output = self.context.run(job);
                let _ = self.current().tx.send(output);
            }
        }
    }

    // ==================== Frame boundaries ====================

    /// End the frame: dispatch partial chunks and start the next frame's buffer
    pub fn finish_async_trace(&mut self) {
        self.dispatch_traces();
        self.dispatch_overlaps();
        self.frame += 1;
        let frame = self.frame;
        self.current().clear(frame);
        log::trace!("Async trace frame {} started", frame);
    }

    /// Wait for the previous frame's work and fire its delegates in submission order
    pub fn reset_async_trace(&mut self) {
        let Some(previous) = self.frame.checked_sub(1) else {
            return;
        };
        let buffer = &mut self.buffers[(previous % 2) as usize];
        if buffer.frame != previous || buffer.collected {
            return;
        }
        buffer.join();
        buffer.collected = true;

        for (index, slot) in buffer.traces.iter_mut().enumerate() {
            if let (Some(delegate), Some(output)) = (slot.delegate.take(), slot.output.as_ref()) {
                delegate(TraceHandle { frame: previous, index }, &slot.request, output);
            }
        }
        for (index, slot) in buffer.overlaps.iter_mut().enumerate() {
            if let (Some(delegate), Some(output)) = (slot.delegate.take(), slot.output.as_ref()) {
                delegate(OverlapHandle { frame: previous, index }, &slot.request, output);
            }
        }
    }

    // ==================== Collection ====================

    /// Whether a handle refers to a live request of this or the previous frame
    pub fn is_trace_handle_valid(&self, handle: TraceHandle) -> bool {
        self.buffer_for(handle.frame)
            .map_or(false, |b| handle.index < b.traces.len())
    }

    pub fn is_overlap_handle_valid(&self, handle: OverlapHandle) -> bool {
        self.buffer_for(handle.frame)
            .map_or(false, |b| handle.index < b.overlaps.len())
    }

    /// Results of a trace once its frame has been collected
    pub fn query_trace_data(&self, handle: TraceHandle) -> Option<(&TraceRequest, &QueryHits)> {
        let slot = self.buffer_for(handle.frame)?.traces.get(handle.index)?;
        slot.output.as_ref().map(|o| (&slot.request, o))
    }

    /// Results of an overlap once its frame has been collected
    pub fn query_overlap_data(&self, handle: OverlapHandle) -> Option<(&OverlapRequest, &QueryOverlaps)> {
        let slot = self.buffer_for(handle.frame)?.overlaps.get(handle.index)?;
        slot.output.as_ref().map(|o| (&slot.request, o))
    }
}

impl Drop for AsyncTraceManager {
    fn drop(&mut self) {
        for buffer in &mut self.buffers {
            buffer.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{BodyInstance, BodyOwner};
    use crate::body_setup::{AggregateGeom, BodySetup};
    use crate::filter::CollisionChannel;
    use crate::identity::ComponentId;
    use crate::math::Transform;
    use approx::assert_relative_eq;
    use parking_lot::Mutex;

    fn scene_with_floor() -> PhysScene {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut phys = PhysScene::new(CollisionConfig::default().with_chunk_size(2)).unwrap();
        let id = phys.create_body(BodyInstance::default());
        let setup = BodySetup::from_geom(AggregateGeom::default().with_box(Vec3::zeros(), Vec3::repeat(50.0)));
        phys.init_body(
            id,
            Arc::new(setup),
            &Transform::identity(),
            BodyOwner::new(ComponentId(1)).with_static_mobility(),
        )
        .unwrap();
        phys
    }

    fn down_trace(x: f32, trace_type: AsyncTraceType) -> TraceRequest {
        TraceRequest::line(
            Vec3::new(x, 0.0, 100.0),
            Vec3::new(x, 0.0, -100.0),
            trace_type,
            CollisionQuery::channel(CollisionChannel::Visibility),
        )
    }

    #[test]
    fn test_results_available_next_frame() {
        let phys = scene_with_floor();
        let mut manager = AsyncTraceManager::new(&phys);
        let handle = manager.trace(down_trace(0.0, AsyncTraceType::Single), None);
        assert!(manager.is_trace_handle_valid(handle));
        assert!(manager.query_trace_data(handle).is_none());

        manager.finish_async_trace();
        manager.reset_async_trace();
        let (_, hits) = manager.query_trace_data(handle).expect("collected");
        assert!(hits.blocking_hit);
        assert_relative_eq!(hits.hits[0].time, 0.25, epsilon = 1e-4);
    }

    #[test]
    fn test_handles_expire_after_one_frame() {
        let phys = scene_with_floor();
        let mut manager = AsyncTraceManager::new(&phys);
        let handle = manager.trace(down_trace(0.0, AsyncTraceType::Test), None);

        manager.finish_async_trace();
        manager.reset_async_trace();
        assert!(manager.is_trace_handle_valid(handle));

        manager.finish_async_trace();
        manager.reset_async_trace();
        assert!(!manager.is_trace_handle_valid(handle));
        assert!(manager.query_trace_data(handle).is_none());
    }

    #[test]
    fn test_delegates_fire_in_submission_order() {
        let phys = scene_with_floor();
        let mut manager = AsyncTraceManager::new(&phys);
        let order = Arc::new(Mutex::new(Vec::new()));

        // five requests with a chunk size of two: two full chunks and a partial one
        for i in 0..5 {
            let order = Arc::clone(&order);
            let x = if i % 2 == 0 { 0.0 } else { 500.0 };
            manager.trace(
                down_trace(x, AsyncTraceType::Multi),
                Some(Box::new(move |handle, _, hits| {
                    order.lock().push((handle.index, hits.blocking_hit));
                })),
            );
        }
        manager.finish_async_trace();
        manager.reset_async_trace();
        manager.reset_async_trace();

        let order = order.lock();
        assert_eq!(
            *order,
            vec![(0, true), (1, false), (2, true), (3, false), (4, true)]
        );
    }

    #[test]
    fn test_overlap_requests() {
        let phys = scene_with_floor();
        let mut manager = AsyncTraceManager::new(&phys);
        let query = CollisionQuery::channel(CollisionChannel::WorldStatic);
        let touching = manager.overlap(
            OverlapRequest {
                position: Vec3::new(0.0, 0.0, 55.0),
                rotation: Quat::identity(),
                shape: CollisionShape::sphere(10.0),
                trace_type: AsyncTraceType::Multi,
                query: query.clone(),
            },
            None,
        );
        let clear = manager.overlap(
            OverlapRequest {
                position: Vec3::new(0.0, 0.0, 500.0),
                rotation: Quat::identity(),
                shape: CollisionShape::sphere(10.0),
                trace_type: AsyncTraceType::Test,
                query,
            },
            None,
        );
        manager.finish_async_trace();
        manager.reset_async_trace();

        let (_, found) = manager.query_overlap_data(touching).unwrap();
        assert_eq!(found.len(), 1);
        let (_, empty) = manager.query_overlap_data(clear).unwrap();
        assert!(!empty.blocking_hit);
        assert!(empty.is_empty());
    }
}
