use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Hooks for observing undo slot and page accounting.
///
/// Slot gauges move by signed deltas; the remaining hooks are monotonic
/// counters.
pub trait UndoMetrics: Send + Sync {
    /// Undo slots holding an active or cached segment changed by `delta`.
    fn slots_used(&self, delta: i64);

    /// Cached segments changed by `delta`.
    fn slots_cached(&self, delta: i64);

    /// A page was added to an undo segment.
    fn page_allocated(&self);

    /// A page was released from an undo segment.
    fn page_freed(&self);

    /// An update log was linked into a history list.
    fn history_appended(&self);
}

/// A no-op implementation of [`UndoMetrics`].
#[derive(Default)]
pub struct NoopMetrics;

impl UndoMetrics for NoopMetrics {
    fn slots_used(&self, _delta: i64) {}
    fn slots_cached(&self, _delta: i64) {}
    fn page_allocated(&self) {}
    fn page_freed(&self) {}
    fn history_appended(&self) {}
}

/// A thread-safe counter-based implementation of [`UndoMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Slots currently holding a segment.
    pub slots_used: AtomicI64,

    /// Segments currently on a cached list.
    pub slots_cached: AtomicI64,

    /// Pages added to undo segments.
    pub pages_allocated: AtomicU64,

    /// Pages released from undo segments.
    pub pages_freed: AtomicU64,

    /// Update logs appended to history.
    pub history_appends: AtomicU64,
}

impl UndoMetrics for CounterMetrics {
    fn slots_used(&self, delta: i64) {
        self.slots_used.fetch_add(delta, Ordering::Relaxed);
    }

    fn slots_cached(&self, delta: i64) {
        self.slots_cached.fetch_add(delta, Ordering::Relaxed);
    }

    fn page_allocated(&self) {
        self.pages_allocated.fetch_add(1, Ordering::Relaxed);
    }

    fn page_freed(&self) {
        self.pages_freed.fetch_add(1, Ordering::Relaxed);
    }

    fn history_appended(&self) {
        self.history_appends.fetch_add(1, Ordering::Relaxed);
    }
}

impl CounterMetrics {
    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            slots_used: self.slots_used.load(Ordering::Relaxed),
            slots_cached: self.slots_cached.load(Ordering::Relaxed),
            pages_allocated: self.pages_allocated.load(Ordering::Relaxed),
            pages_freed: self.pages_freed.load(Ordering::Relaxed),
            history_appends: self.history_appends.load(Ordering::Relaxed),
        }
    }
}

/// Plain values copied out of [`CounterMetrics`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MetricsSnapshot {
    /// Slots currently holding a segment.
    pub slots_used: i64,
    /// Segments currently cached.
    pub slots_cached: i64,
    /// Pages added to undo segments.
    pub pages_allocated: u64,
    /// Pages released from undo segments.
    pub pages_freed: u64,
    /// Update logs appended to history.
    pub history_appends: u64,
}

/// Shared no-op metrics handle.
pub fn noop() -> Arc<dyn UndoMetrics> {
    Arc::new(NoopMetrics)
}
