//! Update Scheduler
//!
//! The scheduler determines the order in which dirtied nodes are processed.
//! Ordering by ascending height guarantees that every node comes after all of
//! its dependencies, since a node's height is strictly greater than the
//! height of anything it reads.
//!
//! Evaluation stays pull-based: thunks recompute when read. The scheduler only
//! orders the effects a ref write reached, so that an effect never runs before
//! an effect it transitively depends on and each one runs once per write.

use indexmap::IndexSet;

use super::arena::NodeArena;
use super::node::AtomId;

/// Queue of dirtied nodes waiting to be processed.
#[derive(Debug, Default)]
pub(crate) struct UpdateScheduler {
    pending: IndexSet<AtomId>,
}

impl UpdateScheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue nodes. Nodes already pending are not queued twice.
    pub(crate) fn schedule(&mut self, nodes: impl IntoIterator<Item = AtomId>) {
        self.pending.extend(nodes);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take every pending node in ascending height order.
    ///
    /// Nodes that no longer exist are dropped. Ties keep scheduling order.
    pub(crate) fn drain(&mut self, arena: &NodeArena) -> Vec<AtomId> {
        let pending = std::mem::take(&mut self.pending);
        refresh_order(arena, pending)
    }
}

/// Sort `nodes` so that dependencies come before dependents.
pub(crate) fn refresh_order(
    arena: &NodeArena,
    nodes: impl IntoIterator<Item = AtomId>,
) -> Vec<AtomId> {
    let mut ordered: Vec<(usize, usize, AtomId)> = nodes
        .into_iter()
        .enumerate()
        .filter_map(|(position, id)| arena.get(id).map(|node| (node.height, position, id)))
        .collect();
    ordered.sort_unstable();
    ordered.into_iter().map(|(_, _, id)| id).collect()
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::graph::node::{never_equal, ComputeFn, Node, Value};
    use crate::reactive::Tracker;

    fn noop() -> ComputeFn {
        Rc::new(|_: &mut Tracker<'_>| Ok(Rc::new(()) as Value))
    }

    #[test]
    fn drains_in_height_order() {
        let mut arena = NodeArena::new();
        let r = arena.insert(|id| Node::new_ref(id, Rc::new(()), never_equal(), "r".into()));
        let t = arena.insert(|id| Node::new_thunk(id, noop(), never_equal(), "t".into()));
        let deep = arena.insert(|id| Node::new_effect(id, noop(), "deep".into()));
        let shallow = arena.insert(|id| Node::new_effect(id, noop(), "shallow".into()));

        arena.add_edge(t, r);
        arena.add_edge(deep, t);
        arena.add_edge(shallow, r);

        let mut scheduler = UpdateScheduler::new();
        scheduler.schedule([deep, shallow, deep]);
        assert!(!scheduler.is_empty());

        let order = scheduler.drain(&arena);
        assert_eq!(order, vec![shallow, deep]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn refresh_order_skips_destroyed_nodes() {
        let mut arena = NodeArena::new();
        let a = arena.insert(|id| Node::new_effect(id, noop(), "a".into()));
        let b = arena.insert(|id| Node::new_effect(id, noop(), "b".into()));
        arena.destroy(a);

        assert_eq!(refresh_order(&arena, [a, b]), vec![b]);
    }
}
