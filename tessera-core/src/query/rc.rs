//! Reference-Counted Live Queries
//!
//! Every [`LiveQueryDef`] resolves to at most one live graph node per
//! context. The registry maps a definition's key to that node and a count of
//! the [`RcRef`]s holding it:
//!
//! 1. `make` on a key that is not live runs the definition's setup and
//!    stores the node with a count of 1.
//!
//! 2. `make` on a live key only increments the count.
//!
//! 3. Dropping (or releasing) an `RcRef` decrements the count. At zero the
//!    entry is removed and the node is destroyed along with its edges.
//!
//! Graph nodes only hold weak references to the context, so a context and
//! the closures stored in its graph never keep each other alive.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use super::{LiveQuery, LiveQueryDef, QueryAtom, QueryKey};
use crate::graph::AtomId;
use crate::reactive::{Atom, Runtime};
use crate::read_model::ReadModel;

type Slot = (QueryKey, TypeId);

struct Entry {
    rc: usize,
    atom: AtomId,
    /// The `QueryAtom<T>` of the live node.
    handle: Box<dyn Any>,
}

#[derive(Default)]
struct QueryRegistry {
    entries: IndexMap<Slot, Entry>,
}

struct ContextInner {
    runtime: Runtime,
    registry: RefCell<QueryRegistry>,
    read_model: Rc<ReadModel>,
}

/// The graph and read model that live queries are made in.
#[derive(Clone)]
pub struct QueryContext {
    inner: Rc<ContextInner>,
}

#[derive(Clone)]
pub(crate) struct WeakQueryContext {
    inner: Weak<ContextInner>,
}

impl WeakQueryContext {
    pub(crate) fn upgrade(&self) -> Option<QueryContext> {
        self.inner.upgrade().map(|inner| QueryContext { inner })
    }
}

impl QueryContext {
    pub(crate) fn new(runtime: Runtime, read_model: Rc<ReadModel>) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                runtime,
                registry: RefCell::new(QueryRegistry::default()),
                read_model,
            }),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub(crate) fn read_model(&self) -> &ReadModel {
        &self.inner.read_model
    }

    pub(crate) fn downgrade(&self) -> WeakQueryContext {
        WeakQueryContext {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Resolve `def` to its shared live node, creating it on first use.
    pub fn make<T: 'static>(&self, def: &LiveQueryDef<T>) -> RcRef<T> {
        let slot = (def.key(), TypeId::of::<T>());
        let existing = {
            let mut registry = self.inner.registry.borrow_mut();
            registry.entries.get_mut(&slot).and_then(|entry| {
                let atom = *entry.handle.downcast_ref::<QueryAtom<T>>()?;
                entry.rc += 1;
                Some(atom)
            })
        };

        let atom = match existing {
            Some(atom) => atom,
            None => {
                // Setup runs outside the registry borrow
                let atom = def.create(self);
                tracing::trace!(key = %def.key(), label = def.label(), "live query created");
                self.inner.registry.borrow_mut().entries.insert(
                    slot,
                    Entry {
                        rc: 1,
                        atom: atom.id(),
                        handle: Box::new(atom),
                    },
                );
                atom
            }
        };

        RcRef {
            ctx: self.downgrade(),
            slot,
            live: LiveQuery {
                atom,
                key: def.key(),
            },
        }
    }

    /// Number of holders of `def`'s live node; 0 when it is not live.
    pub fn rc<T: 'static>(&self, def: &LiveQueryDef<T>) -> usize {
        self.inner
            .registry
            .borrow()
            .entries
            .get(&(def.key(), TypeId::of::<T>()))
            .map_or(0, |entry| entry.rc)
    }

    /// The live node of `def`, without taking a reference.
    pub(crate) fn live_atom<T: 'static>(&self, def: &LiveQueryDef<T>) -> Option<QueryAtom<T>> {
        self.inner
            .registry
            .borrow()
            .entries
            .get(&(def.key(), TypeId::of::<T>()))
            .and_then(|entry| entry.handle.downcast_ref::<QueryAtom<T>>().copied())
    }

    /// Number of distinct live queries.
    pub fn live_count(&self) -> usize {
        self.inner.registry.borrow().entries.len()
    }

    fn retain(&self, slot: Slot) {
        if let Some(entry) = self.inner.registry.borrow_mut().entries.get_mut(&slot) {
            entry.rc += 1;
        }
    }

    fn release(&self, slot: Slot) {
        let destroyed = {
            let mut registry = self.inner.registry.borrow_mut();
            let Some(entry) = registry.entries.get_mut(&slot) else {
                return;
            };
            entry.rc -= 1;
            if entry.rc > 0 {
                return;
            }
            registry.entries.shift_remove(&slot).map(|entry| entry.atom)
        };
        if let Some(atom) = destroyed {
            tracing::trace!(key = %slot.0, "live query destroyed");
            self.inner.runtime.destroy(atom);
        }
    }
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("live", &self.live_count())
            .field("runtime", &self.inner.runtime)
            .finish()
    }
}

/// A counted reference to a live query.
///
/// Cloning takes another reference; dropping gives one back.
pub struct RcRef<T: 'static> {
    ctx: WeakQueryContext,
    slot: Slot,
    live: LiveQuery<T>,
}

impl<T: 'static> RcRef<T> {
    /// Give the reference back now. Same as dropping it.
    pub fn release(self) {
        drop(self);
    }

    pub fn live(&self) -> LiveQuery<T> {
        self.live
    }
}

impl<T: 'static> Deref for RcRef<T> {
    type Target = LiveQuery<T>;

    fn deref(&self) -> &LiveQuery<T> {
        &self.live
    }
}

impl<T: 'static> Atom<T> for RcRef<T> {
    fn id(&self) -> AtomId {
        self.live.id()
    }
}

impl<T: 'static> Clone for RcRef<T> {
    fn clone(&self) -> Self {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.retain(self.slot);
        }
        Self {
            ctx: self.ctx.clone(),
            slot: self.slot,
            live: self.live,
        }
    }
}

impl<T: 'static> Drop for RcRef<T> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.release(self.slot);
        }
    }
}

impl<T: 'static> fmt::Debug for RcRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcRef")
            .field("key", &self.slot.0)
            .field("atom", &self.live.id())
            .finish()
    }
}
