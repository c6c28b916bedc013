//! Effect Handles
//!
//! An Effect is a side-effecting leaf of the graph. It reads atoms through its
//! tracker like a thunk does, but nothing may read it and its return value is
//! never observed.
//!
//! # How Effects Work
//!
//! 1. When created, the effect is dirty and has not run. The creator decides
//!    when to run it the first time with
//!    [`Runtime::run_effect`](super::Runtime::run_effect).
//!
//! 2. When a ref write reaches the effect through `sup` edges, the effect is
//!    collected into a deduplicated set and run once, after all other atoms
//!    are marked dirty, inside the runtime's effects wrapper.
//!
//! 3. Before rerunning, the effect checks its previous dependencies. If none
//!    of them actually changed, it does not run.
//!
//! # Differences from Thunk
//!
//! - Thunks return a value; effects do not.
//! - Thunks are lazy (compute on read); effects are eager (run when dirtied).
//! - Effects are always leaves: reading one from a computation is an error.
//!
//! # Cleanup
//!
//! Destroying an effect with [`Runtime::destroy`](super::Runtime::destroy)
//! removes all of its edges; it will not run again.

use std::fmt;

use super::options::Atom;
use crate::graph::AtomId;

/// Handle to a side-effecting leaf.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Effect {
    id: AtomId,
}

impl Effect {
    pub(crate) fn from_id(id: AtomId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> AtomId {
        self.id
    }
}

impl Atom<()> for Effect {
    fn id(&self) -> AtomId {
        self.id
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Effect").field(&self.id).finish()
    }
}
