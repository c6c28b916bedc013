//! Dependency Graph
//!
//! This module implements the storage side of the computation graph: the node
//! records, the arena that owns them, and the scheduler that orders dirtied
//! nodes.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent refs (mutable leaves), thunks (memoized derivations) or
//!   effects (side-effecting leaves)
//! - Edges represent reads: if A reads B, B is in `A.sub` and A is in `B.sup`
//!
//! When a ref changes, we walk `sup` edges to mark everything downstream
//! dirty and collect the effects to run. Thunks recompute lazily on the next
//! read.
//!
//! # Design Decisions
//!
//! 1. Nodes live in a generational arena addressed by [`AtomId`]. Destroying a
//!    node frees its slot and clears its neighbours' edge sets, so there are no
//!    weak back-pointers to manage.
//!
//! 2. Dependencies are rediscovered on every recomputation: a thunk drops all
//!    of its `sub` edges before running and re-adds whatever it reads.
//!
//! 3. Heights are kept consistent incrementally on every edge change so that
//!    dirty nodes can always be processed in topological order.

mod arena;
mod node;
mod scheduler;

pub(crate) use arena::NodeArena;
pub(crate) use node::{never_equal, ComputeFn, EqualFn, Node, Value};
pub use node::{AtomId, AtomKind, DirtyState};
pub(crate) use scheduler::UpdateScheduler;
