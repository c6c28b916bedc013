//! Ref Handles
//!
//! A [`Ref`] is the mutable leaf of the graph. Its height is always 0 and it
//! never reads anything. Writes go through
//! [`Runtime::set_ref`](super::Runtime::set_ref) or
//! [`Runtime::set_refs`](super::Runtime::set_refs), never through a thunk.
//!
//! Handles are plain ids: they are `Copy`, carry no lifetime and do not keep
//! the node alive.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;

use super::options::Atom;
use crate::graph::{AtomId, Value};

/// Handle to a mutable leaf holding a `T`.
pub struct Ref<T> {
    id: AtomId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Ref<T> {
    pub(crate) fn from_id(id: AtomId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> AtomId {
        self.id
    }
}

impl<T> Atom<T> for Ref<T> {
    fn id(&self) -> AtomId {
        self.id
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Ref<T> {}

impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Ref<T> {}

impl<T> Hash for Ref<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&self.id).finish()
    }
}

/// One entry of a batched ref write.
pub struct RefUpdate {
    pub(crate) id: AtomId,
    pub(crate) value: Value,
}

impl RefUpdate {
    pub fn new<T: 'static>(target: &Ref<T>, value: T) -> Self {
        Self {
            id: target.id,
            value: Rc::new(value),
        }
    }

    pub fn target(&self) -> AtomId {
        self.id
    }
}

impl fmt::Debug for RefUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefUpdate").field("target", &self.id).finish()
    }
}
