//! Atom options and the [`Atom`] handle trait.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::graph::{never_equal, AtomId, EqualFn};

/// A typed handle to a node that holds values of type `T`.
pub trait Atom<T> {
    /// Id of the node this handle points at.
    fn id(&self) -> AtomId;
}

/// Options shared by refs, thunks and effects.
///
/// Without an explicit equality, every new value counts as a change.
pub struct AtomOptions<T> {
    pub(crate) label: Option<String>,
    pub(crate) equal: Option<Rc<dyn Fn(&T, &T) -> bool>>,
    pub(crate) meta: Option<serde_json::Value>,
}

impl<T: 'static> AtomOptions<T> {
    pub fn new() -> Self {
        Self {
            label: None,
            equal: None,
            meta: None,
        }
    }

    /// Human-readable label used in errors, logs and devtools.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Custom equality deciding whether a new value is a change.
    pub fn equal(mut self, equal: impl Fn(&T, &T) -> bool + 'static) -> Self {
        self.equal = Some(Rc::new(equal));
        self
    }

    /// Opaque metadata attached to the node.
    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub(crate) fn erased_equal(&self) -> EqualFn {
        match &self.equal {
            Some(equal) => {
                let equal = Rc::clone(equal);
                Rc::new(move |a: &dyn Any, b: &dyn Any| {
                    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                        (Some(a), Some(b)) => equal(a, b),
                        _ => false,
                    }
                })
            }
            None => never_equal(),
        }
    }
}

impl<T: PartialEq + 'static> AtomOptions<T> {
    /// Use `PartialEq` as the equality.
    pub fn structural_eq(self) -> Self {
        self.equal(|a: &T, b: &T| a == b)
    }
}

impl<T: 'static> Default for AtomOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for AtomOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomOptions")
            .field("label", &self.label)
            .field("has_equal", &self.equal.is_some())
            .field("meta", &self.meta)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_equality_treats_everything_as_changed() {
        let equal = AtomOptions::<i32>::new().erased_equal();
        assert!(!equal(&1_i32, &1_i32));
    }

    #[test]
    fn structural_equality_compares_values() {
        let equal = AtomOptions::<String>::new().structural_eq().erased_equal();
        assert!(equal(&"a".to_string(), &"a".to_string()));
        assert!(!equal(&"a".to_string(), &"b".to_string()));
        // Mismatched types are never equal
        assert!(!equal(&"a".to_string(), &1_i32));
    }
}
