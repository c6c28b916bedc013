//! Reactive Primitives
//!
//! This module implements the computation graph: refs, thunks and effects
//! on top of the [`graph`](crate::graph) storage.
//!
//! # Concepts
//!
//! ## Refs
//!
//! A [`Ref`] is a mutable leaf. Writing it marks every atom that transitively
//! reads it as dirty and runs the effects it reaches.
//!
//! ## Thunks
//!
//! A [`Thunk`] is a memoized derived value. It reads other atoms through a
//! [`Tracker`], which records them as dependencies, and recomputes only when
//! it is read while dirty.
//!
//! ## Effects
//!
//! An [`Effect`] is a side-effecting leaf that reruns when a ref write reaches
//! it. Store subscriptions are effects.
//!
//! # Implementation Notes
//!
//! Dependencies are tracked through an explicit [`Tracker`] argument rather
//! than ambient state. Every run starts from an empty dependency set and
//! records what it actually reads, so conditional reads never leave stale
//! edges behind.

mod cell;
mod context;
mod effect;
mod observer;
mod options;
mod runtime;
mod thunk;

pub use cell::{Ref, RefUpdate};
pub use context::Tracker;
pub use effect::Effect;
pub use observer::{
    GraphObserver, NoopObserver, RecentRefreshes, RefreshEvent, RefreshOutcome, TracingObserver,
};
pub use options::{Atom, AtomOptions};
pub use runtime::{EffectsWrapper, Runtime, RuntimeBuilder};
pub use thunk::Thunk;
