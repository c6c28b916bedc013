//! Thunk Handles
//!
//! A [`Thunk`] is a memoized derived value. It starts dirty and uncomputed,
//! and only runs when something reads it:
//!
//! 1. A ref upstream is set: the thunk is marked maybe-dirty, nothing runs.
//!
//! 2. The thunk is read: each of its previous dependencies is brought up to
//!    date in read order. If none of them changed since the thunk was last
//!    verified, it is marked clean and keeps its cached value.
//!
//! 3. Otherwise it reruns from scratch, rediscovering its dependencies.
//!
//! 4. The new value is compared with the previous one using the thunk's
//!    equality. Only a real change advances the thunk's change revision, which
//!    is what lets readers further down skip their own rerun.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use super::options::Atom;
use crate::graph::AtomId;

/// Handle to a memoized derived computation producing a `T`.
pub struct Thunk<T> {
    id: AtomId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Thunk<T> {
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

impl<T> Atom<T> for Thunk<T> {
    fn id(&self) -> AtomId {
        self.id
    }
}

impl<T> Clone for Thunk<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Thunk<T> {}

impl<T> PartialEq for Thunk<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Thunk<T> {}

impl<T> Hash for Thunk<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Thunk<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Thunk").field(&self.id).finish()
    }
}
