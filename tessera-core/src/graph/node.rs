//! Graph Nodes
//!
//! This module defines the node records that live in the dependency graph.
//! Nodes are stored in a generational arena and addressed by [`AtomId`].

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexSet;

use crate::error::GraphError;
use crate::reactive::Tracker;

/// Type-erased value cached in a node.
pub(crate) type Value = Rc<dyn Any>;

/// Type-erased equality predicate.
pub(crate) type EqualFn = Rc<dyn Fn(&dyn Any, &dyn Any) -> bool>;

/// Type-erased computation of a thunk or effect.
pub(crate) type ComputeFn = Rc<dyn Fn(&mut Tracker<'_>) -> Result<Value, GraphError>>;

/// Unique identifier for a node in the dependency graph.
///
/// The generation makes ids of destroyed nodes stale even after their slot is
/// reused by a new node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId {
    index: u32,
    generation: u32,
}

impl AtomId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the arena.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this id was handed out.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomKind {
    /// A mutable leaf. Height 0, never has dependencies.
    Ref,

    /// A memoized derived computation. Recomputes lazily when read.
    Thunk,

    /// A side-effecting leaf with no dependents. Runs when dirtied.
    Effect,
}

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// The node's value is up-to-date.
    Clean,

    /// Something upstream was set. The node must check whether any of its
    /// dependencies actually changed before deciding to rerun.
    MaybeDirty,

    /// The node definitely needs to rerun (never computed, or last run failed).
    Dirty,
}

/// A node in the dependency graph.
pub(crate) struct Node {
    pub(crate) id: AtomId,
    pub(crate) kind: AtomKind,
    pub(crate) label: String,
    pub(crate) meta: Option<serde_json::Value>,

    /// Longest dependency chain below this node.
    pub(crate) height: usize,
    pub(crate) dirty: DirtyState,
    pub(crate) computing: bool,

    /// Atoms this node read during its last computation.
    pub(crate) sub: IndexSet<AtomId>,
    /// Atoms that read this node.
    pub(crate) sup: IndexSet<AtomId>,

    /// Last successfully computed (or set) value.
    pub(crate) value: Option<Value>,
    pub(crate) equal: EqualFn,
    pub(crate) compute: Option<ComputeFn>,

    /// Revision at which `value` last changed according to `equal`.
    pub(crate) changed_at: u64,
    /// Revision at which the node was last computed or verified clean.
    pub(crate) verified_at: u64,
    pub(crate) run_count: u64,
}

impl Node {
    pub(crate) fn new_ref(id: AtomId, value: Value, equal: EqualFn, label: String) -> Self {
        Self::new(id, AtomKind::Ref, Some(value), equal, None, label)
    }

    pub(crate) fn new_thunk(id: AtomId, compute: ComputeFn, equal: EqualFn, label: String) -> Self {
        Self::new(id, AtomKind::Thunk, None, equal, Some(compute), label)
    }

    pub(crate) fn new_effect(id: AtomId, compute: ComputeFn, label: String) -> Self {
        Self::new(id, AtomKind::Effect, None, never_equal(), Some(compute), label)
    }

    fn new(
        id: AtomId,
        kind: AtomKind,
        value: Option<Value>,
        equal: EqualFn,
        compute: Option<ComputeFn>,
        label: String,
    ) -> Self {
        Self {
            id,
            kind,
            label,
            meta: None,
            height: 0,
            dirty: match kind {
                AtomKind::Ref => DirtyState::Clean,
                // Start dirty to ensure first computation
                AtomKind::Thunk | AtomKind::Effect => DirtyState::Dirty,
            },
            computing: false,
            sub: IndexSet::new(),
            sup: IndexSet::new(),
            value,
            equal,
            compute,
            changed_at: 0,
            verified_at: 0,
            run_count: 0,
        }
    }

    pub(crate) fn is_clean(&self) -> bool {
        self.dirty == DirtyState::Clean
    }

    /// Mark the node as maybe dirty. A definite `Dirty` is never downgraded.
    pub(crate) fn mark_maybe_dirty(&mut self) {
        if self.dirty == DirtyState::Clean {
            self.dirty = DirtyState::MaybeDirty;
        }
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = DirtyState::Dirty;
    }

    pub(crate) fn mark_clean(&mut self, revision: u64) {
        self.dirty = DirtyState::Clean;
        self.verified_at = revision;
    }

    /// Store a freshly computed value.
    ///
    /// Returns whether the value changed according to the node's equality. An
    /// unchanged value keeps the previous allocation so readers see a stable `Rc`.
    pub(crate) fn store(&mut self, value: Value, revision: u64) -> bool {
        let changed = match &self.value {
            Some(previous) => !(self.equal)(previous.as_ref(), value.as_ref()),
            None => true,
        };
        if changed {
            self.value = Some(value);
            self.changed_at = revision;
        }
        changed
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("height", &self.height)
            .field("dirty", &self.dirty)
            .field("sub", &self.sub)
            .field("sup", &self.sup)
            .field("has_value", &self.value.is_some())
            .finish()
    }
}

/// Equality that treats every write as a change.
pub(crate) fn never_equal() -> EqualFn {
    Rc::new(|_, _| false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(index: u32) -> AtomId {
        AtomId::new(index, 0)
    }

    #[test]
    fn ref_node_starts_clean() {
        let node = Node::new_ref(id(0), Rc::new(1_i32), never_equal(), "r".into());
        assert_eq!(node.kind, AtomKind::Ref);
        assert!(node.is_clean());
        assert_eq!(node.height, 0);
    }

    #[test]
    fn thunk_node_starts_dirty_without_value() {
        let compute: ComputeFn = Rc::new(|_: &mut Tracker<'_>| Ok(Rc::new(()) as Value));
        let node = Node::new_thunk(id(1), compute, never_equal(), "t".into());
        assert_eq!(node.dirty, DirtyState::Dirty);
        assert!(node.value.is_none());
    }

    #[test]
    fn dirty_state_transitions() {
        let mut node = Node::new_ref(id(2), Rc::new(()), never_equal(), "r".into());

        node.mark_maybe_dirty();
        assert_eq!(node.dirty, DirtyState::MaybeDirty);

        node.mark_dirty();
        node.mark_maybe_dirty();
        assert_eq!(node.dirty, DirtyState::Dirty);

        node.mark_clean(7);
        assert!(node.is_clean());
        assert_eq!(node.verified_at, 7);
    }

    #[test]
    fn store_keeps_previous_allocation_when_equal() {
        let equal: EqualFn = Rc::new(|a: &dyn Any, b: &dyn Any| {
            a.downcast_ref::<i32>() == b.downcast_ref::<i32>()
        });
        let mut node = Node::new_ref(id(3), Rc::new(5_i32), equal, "r".into());
        let before = node.value.clone().unwrap();

        assert!(!node.store(Rc::new(5_i32), 1));
        assert!(Rc::ptr_eq(&before, node.value.as_ref().unwrap()));
        assert_eq!(node.changed_at, 0);

        assert!(node.store(Rc::new(6_i32), 2));
        assert_eq!(node.changed_at, 2);
    }

    #[test]
    fn atom_ids_display_index_and_generation() {
        assert_eq!(AtomId::new(4, 2).to_string(), "#4v2");
    }
}
