//! Tracking Context
//!
//! The tracker is the explicit accumulator handed to every thunk and effect
//! computation. Reading an atom through it records a dependency edge from the
//! running computation to the atom, then brings the atom up to date:
//!
//! ```rust,ignore
//! let doubled = runtime.make_thunk(
//!     move |get| Ok(*get.get(&count)? * 2),
//!     AtomOptions::new().label("doubled"),
//! );
//! ```
//!
//! Nested computations get their own tracker, so reads are always attributed
//! to the innermost running computation.

use std::rc::Rc;

use smallvec::SmallVec;

use super::options::Atom;
use super::runtime::Runtime;
use crate::error::GraphError;
use crate::graph::AtomId;

/// Records the atoms read by one run of a computation.
pub struct Tracker<'a> {
    runtime: &'a Runtime,
    caller: AtomId,
    reads: SmallVec<[AtomId; 8]>,
}

impl<'a> Tracker<'a> {
    pub(crate) fn new(runtime: &'a Runtime, caller: AtomId) -> Self {
        Self {
            runtime,
            caller,
            reads: SmallVec::new(),
        }
    }

    /// Read an atom, recording it as a dependency of the running computation.
    pub fn get<T: 'static>(&mut self, atom: &impl Atom<T>) -> Result<Rc<T>, GraphError> {
        let id = atom.id();
        self.runtime.track(self.caller, id)?;
        if !self.reads.contains(&id) {
            self.reads.push(id);
        }
        let value = self.runtime.compute_value(id)?;
        self.runtime.downcast(id, value)
    }

    /// The computation this tracker records for.
    pub fn caller(&self) -> AtomId {
        self.caller
    }

    /// Atoms read so far, in first-read order.
    pub fn reads(&self) -> &[AtomId] {
        &self.reads
    }

    pub fn runtime(&self) -> &'a Runtime {
        self.runtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::AtomOptions;

    #[test]
    fn tracker_records_reads_once_in_order() {
        let runtime = Runtime::new();
        let a = runtime.make_ref(1, AtomOptions::new().label("a"));
        let b = runtime.make_ref(2, AtomOptions::new().label("b"));

        let reads = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let reads_clone = reads.clone();
        let sum = runtime.make_thunk(
            move |get| {
                let total = *get.get(&b)? + *get.get(&a)? + *get.get(&b)?;
                *reads_clone.borrow_mut() = get.reads().to_vec();
                Ok(total)
            },
            AtomOptions::new().label("sum"),
        );

        assert_eq!(*runtime.compute(&sum).unwrap(), 5);
        assert_eq!(*reads.borrow(), vec![b.id(), a.id()]);
    }

    #[test]
    fn reading_an_effect_is_rejected() {
        let runtime = Runtime::new();
        let effect = runtime.make_effect(|_| Ok(()), AtomOptions::new().label("fx"));
        let reader = runtime.make_thunk(
            move |get| get.get(&effect).map(|_| ()),
            AtomOptions::new().label("reader"),
        );

        let err = runtime.compute(&reader).unwrap_err();
        assert!(matches!(err, GraphError::EffectRead { .. }));
    }
}
