//! Store Schema
//!
//! A [`Schema`] lists the state tables of the read model and the
//! materializer registered for each event name:
//!
//! ```rust,ignore
//! let todo_created = EventDef::<TodoCreated>::new("todoCreated");
//!
//! let schema = Schema::new()
//!     .table(TableDef::new("todos", "create table todos (id text primary key, text text)"))
//!     .materializer(&todo_created, |args, _event| {
//!         Ok(vec![SqlStatement::new("insert into todos (id, text) values (?, ?)")
//!             .bind(args.id.clone())
//!             .bind(args.text.clone())])
//!     });
//!
//! store.commit([todo_created.make(&TodoCreated { .. })?])?;
//! ```

use std::fmt;
use std::marker::PhantomData;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BoxError;
use crate::event::{Event, PartialEvent};
use crate::materialize::{Materializer, SqlStatement};

/// A state table and the DDL that creates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    name: String,
    ddl: String,
}

impl TableDef {
    /// `ddl` may contain several `;`-separated statements (indexes, triggers).
    pub fn new(name: impl Into<String>, ddl: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            ddl: ddl.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ddl(&self) -> &str {
        &self.ddl
    }
}

/// Typed handle for creating events with args of type `A`.
pub struct EventDef<A> {
    name: String,
    _marker: PhantomData<fn(A)>,
}

impl<A> EventDef<A> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<A: Serialize> EventDef<A> {
    pub fn make(&self, args: &A) -> Result<PartialEvent, serde_json::Error> {
        Ok(PartialEvent::new(self.name.clone(), serde_json::to_value(args)?))
    }
}

impl<A> Clone for EventDef<A> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<A> fmt::Debug for EventDef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventDef").field(&self.name).finish()
    }
}

/// Tables and materializers of one store.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    tables: IndexMap<String, TableDef>,
    materializers: IndexMap<String, Materializer>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TableDef) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Register the materializer for `event`, replacing any previous one.
    pub fn materializer<A, F>(mut self, event: &EventDef<A>, materialize: F) -> Self
    where
        A: DeserializeOwned + 'static,
        F: Fn(&A, &Event) -> Result<Vec<SqlStatement>, BoxError> + 'static,
    {
        self.materializers
            .insert(event.name.clone(), Materializer::new(event.name.clone(), materialize));
        self
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(&name.to_lowercase())
    }

    pub fn materializer_for(&self, event: &str) -> Option<&Materializer> {
        self.materializers.get(event)
    }

    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.materializers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Renamed {
        id: u32,
        title: String,
    }

    #[test]
    fn event_def_encodes_args() {
        let renamed = EventDef::<Renamed>::new("issueRenamed");
        let event = renamed
            .make(&Renamed {
                id: 3,
                title: "Crash".into(),
            })
            .unwrap();
        assert_eq!(event.name, "issueRenamed");
        assert_eq!(event.args["title"], "Crash");
    }

    #[test]
    fn schema_registers_tables_and_materializers() {
        let renamed = EventDef::<Renamed>::new("issueRenamed");
        let schema = Schema::new()
            .table(TableDef::new("Issues", "create table issues (id integer, title text)"))
            .materializer(&renamed, |args, _| {
                Ok(vec![SqlStatement::new("update issues set title = ? where id = ?")
                    .bind(args.title.clone())
                    .bind(args.id)])
            });

        assert!(schema.has_table("issues"));
        assert!(schema.has_table("ISSUES"));
        assert!(schema.materializer_for("issueRenamed").is_some());
        assert!(schema.materializer_for("issueDeleted").is_none());
        assert_eq!(schema.event_names().collect::<Vec<_>>(), vec!["issueRenamed"]);
    }
}
