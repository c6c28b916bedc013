//! Graph Observers
//!
//! Observers receive notifications about graph activity: ref writes, thunk
//! and effect refreshes, and node destruction. They are injected into the
//! runtime, so the graph itself carries no global debug state.
//!
//! All hooks have empty default implementations; implement only what you need.
//!
//! ```rust,ignore
//! let recent = RecentRefreshes::new(64);
//! let runtime = Runtime::builder().observer(recent.clone()).build();
//! // ... later, possibly from another thread:
//! for event in recent.snapshot() {
//!     println!("{} {:?}", event.label, event.outcome);
//! }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::graph::{AtomId, AtomKind};

/// What happened when a thunk or effect was brought up to date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The computation ran. `changed` is false when the result was equal to
    /// the previous one.
    Recomputed { changed: bool },
    /// None of the dependencies changed; the computation did not run.
    CutOff,
    /// The computation returned an error. The node stays dirty.
    Failed { message: String },
}

/// One refresh of a thunk or effect.
#[derive(Debug, Clone)]
pub struct RefreshEvent {
    pub atom: AtomId,
    pub kind: AtomKind,
    pub label: String,
    pub outcome: RefreshOutcome,
    /// Number of distinct atoms read by the run (0 for a cut-off).
    pub reads: usize,
    pub duration: Duration,
}

/// Hooks into graph activity.
pub trait GraphObserver {
    /// Called after a batch of ref writes, before effects run.
    ///
    /// `changed` holds the refs whose value actually changed.
    #[inline]
    fn on_refs_set(&self, _changed: &[AtomId], _effects: usize) {}

    /// Called after a thunk or effect was refreshed.
    #[inline]
    fn on_refresh(&self, _event: &RefreshEvent) {}

    /// Called after nodes were removed from the graph.
    #[inline]
    fn on_destroy(&self, _atoms: &[AtomId]) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl GraphObserver for NoopObserver {}

/// Observer that emits `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl GraphObserver for TracingObserver {
    fn on_refs_set(&self, changed: &[AtomId], effects: usize) {
        tracing::trace!(refs = changed.len(), effects, "refs set");
    }

    fn on_refresh(&self, event: &RefreshEvent) {
        match &event.outcome {
            RefreshOutcome::Recomputed { changed } => tracing::trace!(
                atom = %event.atom,
                label = %event.label,
                changed,
                reads = event.reads,
                elapsed_us = event.duration.as_micros() as u64,
                "recomputed"
            ),
            RefreshOutcome::CutOff => {
                tracing::trace!(atom = %event.atom, label = %event.label, "cut off")
            }
            RefreshOutcome::Failed { message } => tracing::debug!(
                atom = %event.atom,
                label = %event.label,
                error = %message,
                "computation failed"
            ),
        }
    }

    fn on_destroy(&self, atoms: &[AtomId]) {
        tracing::trace!(count = atoms.len(), "atoms destroyed");
    }
}

/// Bounded ring buffer of the most recent refreshes.
///
/// Clones share the same buffer, so one clone can be handed to the runtime
/// and another kept for inspection on any thread.
#[derive(Debug, Clone)]
pub struct RecentRefreshes {
    capacity: usize,
    events: Arc<Mutex<VecDeque<RefreshEvent>>>,
}

impl RecentRefreshes {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Copy of the buffered events, oldest first.
    pub fn snapshot(&self) -> Vec<RefreshEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl GraphObserver for RecentRefreshes {
    fn on_refresh(&self, event: &RefreshEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

impl<O: GraphObserver + ?Sized> GraphObserver for std::rc::Rc<O> {
    fn on_refs_set(&self, changed: &[AtomId], effects: usize) {
        (**self).on_refs_set(changed, effects);
    }

    fn on_refresh(&self, event: &RefreshEvent) {
        (**self).on_refresh(event);
    }

    fn on_destroy(&self, atoms: &[AtomId]) {
        (**self).on_destroy(atoms);
    }
}

impl<A: GraphObserver, B: GraphObserver> GraphObserver for (A, B) {
    fn on_refs_set(&self, changed: &[AtomId], effects: usize) {
        self.0.on_refs_set(changed, effects);
        self.1.on_refs_set(changed, effects);
    }

    fn on_refresh(&self, event: &RefreshEvent) {
        self.0.on_refresh(event);
        self.1.on_refresh(event);
    }

    fn on_destroy(&self, atoms: &[AtomId]) {
        self.0.on_destroy(atoms);
        self.1.on_destroy(atoms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(label: &str) -> RefreshEvent {
        RefreshEvent {
            atom: AtomId::new(0, 0),
            kind: AtomKind::Thunk,
            label: label.to_string(),
            outcome: RefreshOutcome::CutOff,
            reads: 0,
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn ring_buffer_keeps_most_recent() {
        let recent = RecentRefreshes::new(2);
        recent.on_refresh(&event("a"));
        recent.on_refresh(&event("b"));
        recent.on_refresh(&event("c"));

        let labels: Vec<_> = recent.snapshot().into_iter().map(|e| e.label).collect();
        assert_eq!(labels, vec!["b", "c"]);
    }

    #[test]
    fn clones_share_the_buffer() {
        let recent = RecentRefreshes::new(4);
        let pair = (NoopObserver, recent.clone());
        pair.on_refresh(&event("x"));
        assert_eq!(recent.len(), 1);
        recent.clear();
        assert!(recent.is_empty());
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let recent = RecentRefreshes::new(0);
        recent.on_refresh(&event("a"));
        assert!(recent.is_empty());
    }
}
