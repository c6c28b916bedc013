//! Tessera Core
//!
//! This crate provides the reactive core of the Tessera local-first store.
//! It implements:
//!
//! - An incremental computation graph (refs, thunks, effects)
//! - Event materialization into an embedded SQL read model
//! - Live queries shared between subscribers by reference counting
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: node storage, heights and dirty propagation
//! - `reactive`: typed atom handles, dependency tracking and the runtime
//! - `sql`: the SQL engine seam and its SQLite implementation
//! - `schema`, `event`, `materialize`: tables, events and materializers
//! - `query`: live query definitions and their shared instances
//! - `store`: the commit pipeline and public surface
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera_core::prelude::*;
//!
//! let created = EventDef::<TodoCreated>::new("todo_created");
//! let schema = Schema::new()
//!     .table(TableDef::new("todos", "create table todos (id integer primary key, text text)"))
//!     .materializer(&created, |args: &TodoCreated, _| {
//!         Ok(vec![SqlStatement::new("insert into todos (id, text) values (?, ?)")
//!             .bind(args.id)
//!             .bind(args.text.as_str())])
//!     });
//!
//! let store = Store::in_memory(schema)?;
//! let count = query_db("select count(*) from todos", Scalar::<i64>::new());
//!
//! let _sub = store.subscribe(&count, |n| println!("{n} todos"), SubscribeOptions::default())?;
//! // prints "0 todos"
//!
//! store.commit([created.make(&TodoCreated { id: 1, text: "write docs".into() })?])?;
//! // prints "1 todos"
//! ```

pub mod error;
pub mod event;
pub mod graph;
pub mod materialize;
pub mod query;
pub mod reactive;
mod read_model;
pub mod schema;
pub mod sql;
pub mod store;

pub use error::{DbError, DecodeError, GraphError, MaterializeError, StoreError};

/// Commonly used types.
pub mod prelude {
    pub use crate::error::{GraphError, StoreError};
    pub use crate::event::{Event, EventSequenceNumber, PartialEvent};
    pub use crate::materialize::SqlStatement;
    pub use crate::query::{computed, query_db, query_db_fn, signal, FirstRow, LiveQueryDef, QueryInput, ResultSchema, Rows, Scalar};
    pub use crate::reactive::{Atom, AtomOptions, Runtime};
    pub use crate::schema::{EventDef, Schema, TableDef};
    pub use crate::sql::SqlValue;
    pub use crate::store::{CommitOptions, Store, StoreConfig, SubscribeOptions, Subscription};
}
