//! Reactive Runtime
//!
//! The runtime owns one dependency graph and coordinates refs, thunks and
//! effects. It is single-owner and synchronous: cloning a `Runtime` clones a
//! handle to the same graph, and nothing in it is `Send`.
//!
//! # How It Works
//!
//! 1. When a thunk or effect reads an atom through its [`Tracker`], the
//!    runtime records an edge from the reader to the atom and brings the atom
//!    up to date.
//!
//! 2. When refs are written with [`Runtime::set_refs`], the runtime:
//!    a. Stores the new values, skipping refs whose equality holds
//!    b. Marks everything reachable through `sup` edges as maybe dirty
//!    c. Collects the reachable effects, each exactly once
//!    d. Runs them in height order inside the effects wrapper
//!
//! 3. Thunks are lazy: a dirty thunk recomputes only when something reads it.
//!    A maybe-dirty node first checks its previous dependencies and skips the
//!    rerun when none of them changed.
//!
//! # Borrowing
//!
//! The arena sits in a `RefCell`. No borrow is held while user code runs
//! (computations, the effects wrapper, observers), so computations may freely
//! read atoms, create nodes or destroy them.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use smallvec::SmallVec;

use super::cell::{Ref, RefUpdate};
use super::context::Tracker;
use super::effect::Effect;
use super::observer::{GraphObserver, NoopObserver, RefreshEvent, RefreshOutcome};
use super::options::{Atom, AtomOptions};
use super::thunk::Thunk;
use crate::error::GraphError;
use crate::graph::{AtomId, AtomKind, ComputeFn, DirtyState, Node, NodeArena, UpdateScheduler, Value};

/// Hook wrapping every batch of effect runs.
///
/// The wrapper must call the given closure exactly once before returning.
/// Hosts use it to batch the side effects of many subscriber callbacks.
pub type EffectsWrapper = Rc<dyn Fn(&mut dyn FnMut())>;

struct RuntimeInner {
    arena: RefCell<NodeArena>,
    scheduler: RefCell<UpdateScheduler>,
    effects_wrapper: EffectsWrapper,
    observer: Rc<dyn GraphObserver>,
}

/// Handle to a dependency graph.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

/// Builder for a [`Runtime`] with a custom effects wrapper or observer.
#[derive(Default)]
pub struct RuntimeBuilder {
    effects_wrapper: Option<EffectsWrapper>,
    observer: Option<Rc<dyn GraphObserver>>,
}

impl RuntimeBuilder {
    pub fn effects_wrapper(mut self, wrapper: impl Fn(&mut dyn FnMut()) + 'static) -> Self {
        self.effects_wrapper = Some(Rc::new(wrapper));
        self
    }

    pub fn observer(mut self, observer: impl GraphObserver + 'static) -> Self {
        self.observer = Some(Rc::new(observer));
        self
    }

    pub fn build(self) -> Runtime {
        Runtime {
            inner: Rc::new(RuntimeInner {
                arena: RefCell::new(NodeArena::new()),
                scheduler: RefCell::new(UpdateScheduler::new()),
                effects_wrapper: self
                    .effects_wrapper
                    .unwrap_or_else(|| Rc::new(|run: &mut dyn FnMut()| run())),
                observer: self.observer.unwrap_or_else(|| Rc::new(NoopObserver)),
            }),
        }
    }
}

impl Runtime {
    /// A runtime that runs effects immediately and observes nothing.
    pub fn new() -> Self {
        RuntimeBuilder::default().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Create a mutable leaf holding `value`.
    pub fn make_ref<T: 'static>(&self, value: T, options: AtomOptions<T>) -> Ref<T> {
        let equal = options.erased_equal();
        let AtomOptions { label, meta, .. } = options;
        let id = self.inner.arena.borrow_mut().insert(|id| {
            let label = label.unwrap_or_else(|| format!("ref{id}"));
            let mut node = Node::new_ref(id, Rc::new(value), equal, label);
            node.meta = meta;
            node
        });
        Ref::from_id(id)
    }

    /// Create a memoized derived computation. It does not run until read.
    pub fn make_thunk<T, F>(&self, compute: F, options: AtomOptions<T>) -> Thunk<T>
    where
        T: 'static,
        F: Fn(&mut Tracker<'_>) -> Result<T, GraphError> + 'static,
    {
        let equal = options.erased_equal();
        let AtomOptions { label, meta, .. } = options;
        let compute: ComputeFn =
            Rc::new(move |tracker: &mut Tracker<'_>| compute(tracker).map(|value| Rc::new(value) as Value));
        let id = self.inner.arena.borrow_mut().insert(|id| {
            let label = label.unwrap_or_else(|| format!("thunk{id}"));
            let mut node = Node::new_thunk(id, compute, equal, label);
            node.meta = meta;
            node
        });
        Thunk::from_id(id)
    }

    /// Create a side-effecting leaf.
    ///
    /// The effect does not run until [`run_effect`](Self::run_effect) is
    /// called or a ref write reaches it.
    pub fn make_effect<F>(&self, run: F, options: AtomOptions<()>) -> Effect
    where
        F: Fn(&mut Tracker<'_>) -> Result<(), GraphError> + 'static,
    {
        let AtomOptions { label, meta, .. } = options;
        let compute: ComputeFn =
            Rc::new(move |tracker: &mut Tracker<'_>| run(tracker).map(|()| Rc::new(()) as Value));
        let id = self.inner.arena.borrow_mut().insert(|id| {
            let label = label.unwrap_or_else(|| format!("effect{id}"));
            let mut node = Node::new_effect(id, compute, label);
            node.meta = meta;
            node
        });
        Effect::from_id(id)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub fn set_ref<T: 'static>(&self, target: &Ref<T>, value: T) -> Result<(), GraphError> {
        self.set_refs([RefUpdate::new(target, value)])
    }

    /// Write several refs at once.
    ///
    /// Dependents are dirtied once for the whole batch and every reachable
    /// effect runs at most once. Returns the first effect error; later effects
    /// still run. Writes to destroyed refs are reported after the rest of the
    /// batch has been applied.
    pub fn set_refs(&self, updates: impl IntoIterator<Item = RefUpdate>) -> Result<(), GraphError> {
        let mut missing = None;
        let (changed, effects) = {
            let mut arena = self.inner.arena.borrow_mut();
            let revision = arena.bump_revision();
            let mut changed: SmallVec<[AtomId; 8]> = SmallVec::new();
            for update in updates {
                match arena.get_mut(update.id) {
                    Some(node) if node.kind == AtomKind::Ref => {
                        if node.store(update.value, revision) && !changed.contains(&update.id) {
                            changed.push(update.id);
                        }
                    }
                    _ => {
                        missing.get_or_insert(update.id);
                    }
                }
            }
            let effects = arena.mark_super_dirty(&changed);
            (changed, effects)
        };

        self.inner.observer.on_refs_set(&changed, effects.len());
        self.inner.scheduler.borrow_mut().schedule(effects);
        self.run_effects()?;

        match missing {
            Some(id) => Err(GraphError::Destroyed(id)),
            None => Ok(()),
        }
    }

    fn run_effects(&self) -> Result<(), GraphError> {
        let order = {
            let arena = self.inner.arena.borrow();
            self.inner.scheduler.borrow_mut().drain(&arena)
        };
        if order.is_empty() {
            return Ok(());
        }

        let mut first_error: Option<GraphError> = None;
        let mut run = || {
            for id in &order {
                // An earlier effect may have destroyed this one
                if !self.contains(*id) {
                    continue;
                }
                if let Err(err) = self.compute_value(*id) {
                    tracing::debug!(effect = %id, error = %err, "effect failed");
                    first_error.get_or_insert(err);
                }
            }
        };
        (self.inner.effects_wrapper)(&mut run);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Bring an atom up to date and return its value.
    pub fn compute<T: 'static>(&self, atom: &impl Atom<T>) -> Result<Rc<T>, GraphError> {
        let id = atom.id();
        let value = self.compute_value(id)?;
        self.downcast(id, value)
    }

    /// Run an effect now if it is dirty.
    pub fn run_effect(&self, effect: &Effect) -> Result<(), GraphError> {
        self.compute_value(effect.id()).map(|_| ())
    }

    /// The cached value, without recomputing.
    ///
    /// Returns `None` for destroyed atoms and thunks that never ran.
    pub fn peek<T: 'static>(&self, atom: &impl Atom<T>) -> Option<Rc<T>> {
        let value = self.inner.arena.borrow().get(atom.id())?.value.clone()?;
        value.downcast::<T>().ok()
    }

    pub(crate) fn downcast<T: 'static>(&self, id: AtomId, value: Value) -> Result<Rc<T>, GraphError> {
        value.downcast::<T>().map_err(|_| GraphError::TypeMismatch {
            label: self.label(id).unwrap_or_default(),
        })
    }

    /// Record that `caller` reads `callee`.
    pub(crate) fn track(&self, caller: AtomId, callee: AtomId) -> Result<(), GraphError> {
        let mut arena = self.inner.arena.borrow_mut();
        let node = arena.get(callee).ok_or(GraphError::Destroyed(callee))?;
        if node.kind == AtomKind::Effect {
            return Err(GraphError::EffectRead {
                label: node.label.clone(),
            });
        }
        if node.computing || caller == callee {
            return Err(GraphError::Cycle {
                label: node.label.clone(),
            });
        }
        arena.add_edge(caller, callee);
        Ok(())
    }

    pub(crate) fn compute_value(&self, id: AtomId) -> Result<Value, GraphError> {
        let state = {
            let arena = self.inner.arena.borrow();
            let node = arena.get(id).ok_or(GraphError::Destroyed(id))?;
            if node.computing {
                return Err(GraphError::Cycle {
                    label: node.label.clone(),
                });
            }
            match (node.kind, node.dirty, &node.value) {
                (AtomKind::Ref, _, Some(value)) | (_, DirtyState::Clean, Some(value)) => {
                    return Ok(Rc::clone(value));
                }
                (_, DirtyState::MaybeDirty, Some(_)) => DirtyState::MaybeDirty,
                _ => DirtyState::Dirty,
            }
        };

        if state == DirtyState::MaybeDirty && self.verify(id)? {
            let arena = self.inner.arena.borrow();
            if let Some(value) = arena.get(id).and_then(|node| node.value.clone()) {
                return Ok(value);
            }
        }
        self.recompute(id)
    }

    /// Check whether a maybe-dirty node can keep its value.
    ///
    /// Brings each previous dependency up to date in read order. Returns
    /// `true` (and marks the node clean) when none of them changed since the
    /// node was last verified.
    fn verify(&self, id: AtomId) -> Result<bool, GraphError> {
        let started = Instant::now();
        let (subs, verified_at) = {
            let arena = self.inner.arena.borrow();
            let node = arena.get(id).ok_or(GraphError::Destroyed(id))?;
            let subs: SmallVec<[AtomId; 8]> = node.sub.iter().copied().collect();
            (subs, node.verified_at)
        };

        for sub in subs {
            match self.compute_value(sub) {
                Ok(_) => {}
                Err(GraphError::Destroyed(_)) => return Ok(false),
                Err(err) => {
                    if let Some(node) = self.inner.arena.borrow_mut().get_mut(id) {
                        node.mark_dirty();
                    }
                    return Err(err);
                }
            }
            let changed = self
                .inner
                .arena
                .borrow()
                .get(sub)
                .map_or(true, |node| node.changed_at > verified_at);
            if changed {
                return Ok(false);
            }
        }

        let event = {
            let mut arena = self.inner.arena.borrow_mut();
            let revision = arena.revision();
            let node = arena.get_mut(id).ok_or(GraphError::Destroyed(id))?;
            node.mark_clean(revision);
            RefreshEvent {
                atom: id,
                kind: node.kind,
                label: node.label.clone(),
                outcome: RefreshOutcome::CutOff,
                reads: 0,
                duration: started.elapsed(),
            }
        };
        self.inner.observer.on_refresh(&event);
        Ok(true)
    }

    /// Rerun a computation from scratch, rediscovering its dependencies.
    fn recompute(&self, id: AtomId) -> Result<Value, GraphError> {
        let started = Instant::now();
        let (compute, old_subs) = {
            let mut arena = self.inner.arena.borrow_mut();
            let node = arena.get_mut(id).ok_or(GraphError::Destroyed(id))?;
            let Some(compute) = node.compute.clone() else {
                return Err(GraphError::TypeMismatch {
                    label: node.label.clone(),
                });
            };
            node.computing = true;
            let old_subs: SmallVec<[AtomId; 8]> = node.sub.iter().copied().collect();
            for sub in &old_subs {
                arena.remove_edge(id, *sub);
            }
            (compute, old_subs)
        };

        let mut tracker = Tracker::new(self, id);
        let result = compute(&mut tracker);
        let reads = tracker.reads().len();
        drop(tracker);

        let (result, event) = {
            let mut arena = self.inner.arena.borrow_mut();
            let revision = arena.revision();
            if !arena.contains(id) {
                // Destroyed by its own computation
                return result;
            }
            let (result, outcome) = match result {
                Ok(value) => {
                    let node = arena.get_mut(id).ok_or(GraphError::Destroyed(id))?;
                    node.computing = false;
                    node.run_count += 1;
                    let changed = node.store(value, revision);
                    node.mark_clean(revision);
                    let value = node.value.clone().ok_or(GraphError::Destroyed(id));
                    (value, RefreshOutcome::Recomputed { changed })
                }
                Err(err) => {
                    // Keep the previous dependencies so invalidation still reaches it
                    for sub in old_subs {
                        arena.add_edge(id, sub);
                    }
                    let node = arena.get_mut(id).ok_or(GraphError::Destroyed(id))?;
                    node.computing = false;
                    node.run_count += 1;
                    node.mark_dirty();
                    let message = err.to_string();
                    (Err(err), RefreshOutcome::Failed { message })
                }
            };
            let node = arena.get(id).ok_or(GraphError::Destroyed(id))?;
            let event = RefreshEvent {
                atom: id,
                kind: node.kind,
                label: node.label.clone(),
                outcome,
                reads,
                duration: started.elapsed(),
            };
            (result, event)
        };

        self.inner.observer.on_refresh(&event);
        result
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Record that `sup` reads `sub` outside of any computation.
    ///
    /// Edges are normally discovered by running computations; a manual edge
    /// lasts until `sup` next recomputes.
    pub fn add_edge(&self, sup: AtomId, sub: AtomId) -> Result<(), GraphError> {
        let mut arena = self.inner.arena.borrow_mut();
        for id in [sup, sub] {
            if !arena.contains(id) {
                return Err(GraphError::Destroyed(id));
            }
        }
        arena.add_edge(sup, sub);
        Ok(())
    }

    pub fn remove_edge(&self, sup: AtomId, sub: AtomId) {
        self.inner.arena.borrow_mut().remove_edge(sup, sub);
    }

    /// Destroy an atom and everything that reads it.
    pub fn destroy(&self, id: AtomId) {
        let removed: Vec<Node> = self.inner.arena.borrow_mut().destroy(id);
        if removed.is_empty() {
            return;
        }
        let ids: SmallVec<[AtomId; 8]> = removed.iter().map(|node| node.id).collect();
        self.inner.observer.on_destroy(&ids);
        // Closures owned by the nodes are dropped here, outside the borrow
        drop(removed);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn contains(&self, id: AtomId) -> bool {
        self.inner.arena.borrow().contains(id)
    }

    pub fn node_count(&self) -> usize {
        self.inner.arena.borrow().len()
    }

    /// Number of ref write batches so far.
    pub fn revision(&self) -> u64 {
        self.inner.arena.borrow().revision()
    }

    pub fn is_dirty(&self, id: AtomId) -> bool {
        self.dirty_state(id).is_some_and(|state| state != DirtyState::Clean)
    }

    pub fn dirty_state(&self, id: AtomId) -> Option<DirtyState> {
        self.inner.arena.borrow().get(id).map(|node| node.dirty)
    }

    pub fn height(&self, id: AtomId) -> Option<usize> {
        self.inner.arena.borrow().get(id).map(|node| node.height)
    }

    /// Atoms `id` read during its last computation, in read order.
    pub fn sub(&self, id: AtomId) -> Vec<AtomId> {
        self.inner
            .arena
            .borrow()
            .get(id)
            .map(|node| node.sub.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Atoms that read `id`.
    pub fn supers(&self, id: AtomId) -> Vec<AtomId> {
        self.inner
            .arena
            .borrow()
            .get(id)
            .map(|node| node.sup.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn kind(&self, id: AtomId) -> Option<AtomKind> {
        self.inner.arena.borrow().get(id).map(|node| node.kind)
    }

    pub fn label(&self, id: AtomId) -> Option<String> {
        self.inner.arena.borrow().get(id).map(|node| node.label.clone())
    }

    pub fn meta(&self, id: AtomId) -> Option<serde_json::Value> {
        self.inner.arena.borrow().get(id).and_then(|node| node.meta.clone())
    }

    /// How many times the computation of `id` has run.
    pub fn run_count(&self, id: AtomId) -> u64 {
        self.inner
            .arena
            .borrow()
            .get(id)
            .map_or(0, |node| node.run_count)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arena = self.inner.arena.borrow();
        f.debug_struct("Runtime")
            .field("nodes", &arena.len())
            .field("revision", &arena.revision())
            .finish()
    }
}
