//! Node Arena
//!
//! All nodes of one graph live in a single generational arena. Edges are kept
//! in both directions (`sub` for what a node reads, `sup` for who reads it) so
//! that dirty propagation walks up and destruction can clean neighbours
//! without a full scan.
//!
//! # Heights
//!
//! A node's height is the length of its longest dependency chain:
//! `0` for refs and for nodes without dependencies, otherwise
//! `1 + max(height(sub))`. Heights are maintained incrementally by
//! [`NodeArena::add_edge`] and [`NodeArena::remove_edge`]; a change is pushed
//! upwards only as far as it actually alters a height.

use indexmap::IndexSet;

use super::node::{AtomId, AtomKind, Node};

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Generational storage for graph nodes.
pub(crate) struct NodeArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
    /// Bumped on every batch of ref writes.
    revision: u64,
}

impl NodeArena {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            revision: 0,
        }
    }

    /// Insert a node built from its freshly allocated id.
    pub(crate) fn insert(&mut self, build: impl FnOnce(AtomId) -> Node) -> AtomId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                AtomId::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                AtomId::new(index, 0)
            }
        };
        self.slots[id.index() as usize].node = Some(build(id));
        self.len += 1;
        id
    }

    pub(crate) fn get(&self, id: AtomId) -> Option<&Node> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: AtomId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_mut())
    }

    pub(crate) fn contains(&self, id: AtomId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn bump_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Free a slot. The caller is responsible for edges.
    fn take(&mut self, id: AtomId) -> Option<Node> {
        let slot = self
            .slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())?;
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.len -= 1;
        Some(node)
    }

    /// Record that `sup` reads `sub`.
    pub(crate) fn add_edge(&mut self, sup: AtomId, sub: AtomId) {
        if !self.contains(sup) || !self.contains(sub) {
            return;
        }
        if let Some(node) = self.get_mut(sub) {
            node.sup.insert(sup);
        }
        let inserted = self
            .get_mut(sup)
            .map(|node| node.sub.insert(sub))
            .unwrap_or(false);
        if inserted {
            self.update_height(sup);
        }
    }

    /// Remove the edge recorded by [`add_edge`](Self::add_edge).
    pub(crate) fn remove_edge(&mut self, sup: AtomId, sub: AtomId) {
        if let Some(node) = self.get_mut(sub) {
            node.sup.shift_remove(&sup);
        }
        let removed = self
            .get_mut(sup)
            .map(|node| node.sub.shift_remove(&sub))
            .unwrap_or(false);
        if removed {
            self.update_height(sup);
        }
    }

    /// Recompute the height of `id` and push any change to its dependents.
    fn update_height(&mut self, id: AtomId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.get(current) else {
                continue;
            };
            let height = match node.kind {
                AtomKind::Ref => 0,
                AtomKind::Thunk | AtomKind::Effect => node
                    .sub
                    .iter()
                    .filter_map(|sub| self.get(*sub))
                    .map(|sub| sub.height + 1)
                    .max()
                    .unwrap_or(0),
            };
            if height == node.height {
                continue;
            }
            let dependents: Vec<AtomId> = node.sup.iter().copied().collect();
            if let Some(node) = self.get_mut(current) {
                node.height = height;
            }
            stack.extend(dependents);
        }
    }

    /// Mark every atom reachable through `sup` edges from `roots` as maybe
    /// dirty and return the effects among them, each exactly once.
    pub(crate) fn mark_super_dirty(&mut self, roots: &[AtomId]) -> IndexSet<AtomId> {
        let mut effects = IndexSet::new();
        let mut visited: IndexSet<AtomId> = IndexSet::new();
        let mut stack: Vec<AtomId> = roots
            .iter()
            .filter_map(|root| self.get(*root))
            .flat_map(|node| node.sup.iter().copied())
            .collect();

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(node) = self.get_mut(id) else {
                continue;
            };
            node.mark_maybe_dirty();
            if node.kind == AtomKind::Effect {
                effects.insert(id);
            }
            stack.extend(node.sup.iter().copied());
        }

        effects
    }

    /// Destroy `id` together with everything that reads it.
    ///
    /// Dependents are destroyed before the nodes they read. The removed nodes
    /// are returned so the caller can drop them (and the closures they own)
    /// outside of any borrow of the arena.
    pub(crate) fn destroy(&mut self, id: AtomId) -> Vec<Node> {
        let mut order = Vec::new();
        let mut seen = IndexSet::new();
        self.collect_dependents_first(id, &mut seen, &mut order);

        let mut removed = Vec::with_capacity(order.len());
        for current in order {
            let (subs, sups) = match self.get(current) {
                Some(node) => (
                    node.sub.iter().copied().collect::<Vec<_>>(),
                    node.sup.iter().copied().collect::<Vec<_>>(),
                ),
                None => continue,
            };
            for sub in subs {
                self.remove_edge(current, sub);
            }
            for sup in sups {
                self.remove_edge(sup, current);
            }
            if let Some(node) = self.take(current) {
                removed.push(node);
            }
        }
        removed
    }

    fn collect_dependents_first(
        &self,
        id: AtomId,
        seen: &mut IndexSet<AtomId>,
        order: &mut Vec<AtomId>,
    ) {
        if !seen.insert(id) {
            return;
        }
        let Some(node) = self.get(id) else {
            return;
        };
        for sup in node.sup.iter() {
            self.collect_dependents_first(*sup, seen, order);
        }
        order.push(id);
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::graph::node::{never_equal, ComputeFn, DirtyState, Value};
    use crate::reactive::Tracker;

    fn add_ref(arena: &mut NodeArena) -> AtomId {
        arena.insert(|id| Node::new_ref(id, Rc::new(()), never_equal(), "ref".into()))
    }

    fn add_thunk(arena: &mut NodeArena) -> AtomId {
        let compute: ComputeFn = Rc::new(|_: &mut Tracker<'_>| Ok(Rc::new(()) as Value));
        arena.insert(|id| Node::new_thunk(id, compute, never_equal(), "thunk".into()))
    }

    fn add_effect(arena: &mut NodeArena) -> AtomId {
        let compute: ComputeFn = Rc::new(|_: &mut Tracker<'_>| Ok(Rc::new(()) as Value));
        arena.insert(|id| Node::new_effect(id, compute, "effect".into()))
    }

    fn height(arena: &NodeArena, id: AtomId) -> usize {
        arena.get(id).unwrap().height
    }

    #[test]
    fn insert_and_reuse_slots() {
        let mut arena = NodeArena::new();
        let a = add_ref(&mut arena);
        assert_eq!(arena.len(), 1);

        arena.destroy(a);
        assert_eq!(arena.len(), 0);
        assert!(arena.get(a).is_none());

        let b = add_ref(&mut arena);
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
    }

    #[test]
    fn edges_are_symmetric() {
        let mut arena = NodeArena::new();
        let r = add_ref(&mut arena);
        let t = add_thunk(&mut arena);

        arena.add_edge(t, r);
        assert!(arena.get(t).unwrap().sub.contains(&r));
        assert!(arena.get(r).unwrap().sup.contains(&t));

        arena.remove_edge(t, r);
        assert!(!arena.get(t).unwrap().sub.contains(&r));
        assert!(!arena.get(r).unwrap().sup.contains(&t));
    }

    #[test]
    fn heights_follow_longest_chain() {
        let mut arena = NodeArena::new();
        let r = add_ref(&mut arena);
        let a = add_thunk(&mut arena);
        let b = add_thunk(&mut arena);
        let c = add_thunk(&mut arena);

        // c reads a and b, b reads a, a reads r
        arena.add_edge(c, a);
        assert_eq!(height(&arena, c), 1);
        arena.add_edge(a, r);
        assert_eq!(height(&arena, a), 1);
        assert_eq!(height(&arena, c), 2);
        arena.add_edge(b, a);
        arena.add_edge(c, b);
        assert_eq!(height(&arena, b), 2);
        assert_eq!(height(&arena, c), 3);

        arena.remove_edge(c, b);
        assert_eq!(height(&arena, c), 2);
        arena.remove_edge(a, r);
        assert_eq!(height(&arena, a), 0);
        assert_eq!(height(&arena, b), 1);
        assert_eq!(height(&arena, c), 1);
    }

    #[test]
    fn dirty_propagation_reaches_diamond_once() {
        let mut arena = NodeArena::new();
        let r = add_ref(&mut arena);
        let left = add_thunk(&mut arena);
        let right = add_thunk(&mut arena);
        let join = add_thunk(&mut arena);
        let effect = add_effect(&mut arena);

        arena.add_edge(left, r);
        arena.add_edge(right, r);
        arena.add_edge(join, left);
        arena.add_edge(join, right);
        arena.add_edge(effect, join);
        for id in [left, right, join, effect] {
            arena.get_mut(id).unwrap().mark_clean(0);
        }

        let effects = arena.mark_super_dirty(&[r]);
        assert_eq!(effects.len(), 1);
        assert!(effects.contains(&effect));
        for id in [left, right, join, effect] {
            assert_eq!(arena.get(id).unwrap().dirty, DirtyState::MaybeDirty);
        }
        assert!(arena.get(r).unwrap().is_clean());
    }

    #[test]
    fn destroy_removes_dependents_and_edges() {
        let mut arena = NodeArena::new();
        let r = add_ref(&mut arena);
        let other = add_ref(&mut arena);
        let t = add_thunk(&mut arena);
        let e = add_effect(&mut arena);

        arena.add_edge(t, r);
        arena.add_edge(t, other);
        arena.add_edge(e, t);

        let removed = arena.destroy(t);
        let ids: Vec<AtomId> = removed.iter().map(|node| node.id).collect();
        assert_eq!(ids, vec![e, t]);

        assert!(arena.get(r).unwrap().sup.is_empty());
        assert!(arena.get(other).unwrap().sup.is_empty());
        assert_eq!(arena.len(), 2);
    }
}
