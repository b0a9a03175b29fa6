//! Hooks receiving every final query result

use crate::backend::QueryMode;
use crate::filter::CollisionChannel;
use crate::hit::{HitResult, OverlapResult};
use crate::math::Vec3;
use parking_lot::Mutex;

/// What kind of trace produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Raycast,
    Sweep,
}

/// A finished raycast or sweep
#[derive(Debug, Clone, Copy)]
pub struct TraceRecord<'a> {
    pub kind: TraceKind,
    pub mode: QueryMode,
    pub start: Vec3,
    pub end: Vec3,
    pub channel: CollisionChannel,
    pub tag: &'a str,
    pub hits: &'a [HitResult],
}

/// A finished overlap query
#[derive(Debug, Clone, Copy)]
pub struct OverlapRecord<'a> {
    pub mode: QueryMode,
    pub position: Vec3,
    pub channel: CollisionChannel,
    pub tag: &'a str,
    pub overlaps: &'a [OverlapResult],
}

/// Receiver for converted query results (debug draw, capture)
pub trait CollisionObserver: Send + Sync {
    fn on_trace(&self, _record: &TraceRecord<'_>) {}

    fn on_overlap(&self, _record: &OverlapRecord<'_>) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CollisionObserver for NoopObserver {}

/// Owned copy of a `TraceRecord`
#[derive(Debug, Clone)]
pub struct CapturedTrace {
    pub kind: TraceKind,
    pub mode: QueryMode,
    pub start: Vec3,
    pub end: Vec3,
    pub channel: CollisionChannel,
    pub tag: String,
    pub hits: Vec<HitResult>,
}

/// Owned copy of an `OverlapRecord`
#[derive(Debug, Clone)]
pub struct CapturedOverlap {
    pub mode: QueryMode,
    pub position: Vec3,
    pub channel: CollisionChannel,
    pub tag: String,
    pub overlaps: Vec<OverlapResult>,
}

/// Observer recording every query it sees
#[derive(Debug, Default)]
pub struct CaptureObserver {
    traces: Mutex<Vec<CapturedTrace>>,
    overlaps: Mutex<Vec<CapturedOverlap>>,
}

impl CaptureObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain recorded traces
    pub fn take_traces(&self) -> Vec<CapturedTrace> {
        std::mem::take(&mut *self.traces.lock())
    }

    /// Drain recorded overlaps
    pub fn take_overlaps(&self) -> Vec<CapturedOverlap> {
        std::mem::take(&mut *self.overlaps.lock())
    }

    pub fn trace_count(&self) -> usize {
        self.traces.lock().len()
    }
}

impl CollisionObserver for CaptureObserver {
    fn on_trace(&self, record: &TraceRecord<'_>) {
        self.traces.lock().push(CapturedTrace {
            kind: record.kind,
            mode: record.mode,
            start: record.start,
            end: record.end,
            channel: record.channel,
            tag: record.tag.to_owned(),
            hits: record.hits.to_vec(),
        });
    }

    fn on_overlap(&self, record: &OverlapRecord<'_>) {
        self.overlaps.lock().push(CapturedOverlap {
            mode: record.mode,
            position: record.position,
            channel: record.channel,
            tag: record.tag.to_owned(),
            overlaps: record.overlaps.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_records_and_drains() {
        let observer = CaptureObserver::new();
        let hits = [HitResult::new(Vec3::zeros(), Vec3::x())];
        observer.on_trace(&TraceRecord {
            kind: TraceKind::Raycast,
            mode: QueryMode::Single,
            start: Vec3::zeros(),
            end: Vec3::x(),
            channel: CollisionChannel::Visibility,
            tag: "probe",
            hits: &hits,
        });
        assert_eq!(observer.trace_count(), 1);
        let traces = observer.take_traces();
        assert_eq!(traces[0].tag, "probe");
        assert_eq!(traces[0].hits.len(), 1);
        assert_eq!(observer.trace_count(), 0);
    }

    #[test]
    fn test_noop_observer_accepts_records() {
        let observer: &dyn CollisionObserver = &NoopObserver;
        observer.on_overlap(&OverlapRecord {
            mode: QueryMode::Multi,
            position: Vec3::zeros(),
            channel: CollisionChannel::WorldStatic,
            tag: "",
            overlaps: &[],
        });
    }
}
