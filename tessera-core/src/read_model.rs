//! Read Model
//!
//! The SQL engine together with one table ref per state table. Queries read
//! table refs to depend on tables; commits write them to invalidate queries.

use std::cell::RefCell;

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::error::DbError;
use crate::reactive::{AtomOptions, Ref, Runtime};
use crate::schema::Schema;
use crate::sql::{Row, SqlEngine, SqlValue};

pub(crate) struct ReadModel {
    engine: RefCell<Box<dyn SqlEngine>>,
    table_refs: IndexMap<String, Ref<()>>,
}

impl ReadModel {
    /// Create the schema's tables and their refs.
    pub(crate) fn new(
        runtime: &Runtime,
        mut engine: Box<dyn SqlEngine>,
        schema: &Schema,
    ) -> Result<Self, DbError> {
        let mut table_refs = IndexMap::new();
        for table in schema.tables() {
            engine.execute_batch(table.ddl())?;
            // Never equal: every write counts as a change
            let table_ref = runtime.make_ref((), AtomOptions::new().label(format!("table:{}", table.name())));
            table_refs.insert(table.name().to_string(), table_ref);
        }
        Ok(Self {
            engine: RefCell::new(engine),
            table_refs,
        })
    }

    pub(crate) fn table_ref(&self, name: &str) -> Option<Ref<()>> {
        self.table_refs.get(name).copied()
    }

    pub(crate) fn table_names(&self) -> impl Iterator<Item = &str> {
        self.table_refs.keys().map(String::as_str)
    }

    /// Table refs a query depends on: the explicit tables when given,
    /// otherwise the known tables the engine reports the query reads.
    pub(crate) fn resolve_tables(&self, sql: &str, explicit: Option<&[String]>) -> Result<SmallVec<[Ref<()>; 4]>, DbError> {
        let refs = match explicit {
            Some(tables) => tables
                .iter()
                .filter_map(|name| self.table_ref(&name.to_lowercase()))
                .collect(),
            None => {
                let engine = self.engine.try_borrow().map_err(|_| DbError::Busy)?;
                engine
                    .tables_read_by(sql)?
                    .iter()
                    .filter_map(|name| self.table_ref(name))
                    .collect()
            }
        };
        Ok(refs)
    }

    pub(crate) fn select(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        let engine = self.engine.try_borrow().map_err(|_| DbError::Busy)?;
        engine.select(sql, params)
    }

    /// Run `f` with exclusive access to the engine.
    pub(crate) fn with_engine<R, E>(&self, f: impl FnOnce(&mut dyn SqlEngine) -> Result<R, E>) -> Result<R, E>
    where
        E: From<DbError>,
    {
        let mut engine = self.engine.try_borrow_mut().map_err(|_| DbError::Busy)?;
        f(&mut **engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TableDef;
    use crate::sql::SqliteEngine;

    fn read_model(runtime: &Runtime) -> ReadModel {
        let schema = Schema::new()
            .table(TableDef::new("issues", "create table issues (id integer primary key)"))
            .table(TableDef::new("comments", "create table comments (id integer, issue_id integer)"));
        let engine = SqliteEngine::open_in_memory().unwrap();
        ReadModel::new(runtime, Box::new(engine), &schema).unwrap()
    }

    #[test]
    fn creates_tables_and_refs() {
        let runtime = Runtime::new();
        let model = read_model(&runtime);
        assert_eq!(model.table_names().collect::<Vec<_>>(), vec!["issues", "comments"]);
        assert!(model.select("select * from comments", &[]).unwrap().is_empty());
    }

    #[test]
    fn resolves_only_known_tables() {
        let runtime = Runtime::new();
        let model = read_model(&runtime);
        let issues = model.table_ref("issues").unwrap();

        let refs = model
            .resolve_tables("select * from issues join sqlite_master", None)
            .unwrap();
        assert_eq!(refs.as_slice(), [issues]);

        let comments = model.table_ref("comments").unwrap();
        model
            .with_engine(|engine| {
                engine.execute_batch(
                    "create view issue_comments as \
                     select c.id from comments c join issues i on i.id = c.issue_id",
                )
            })
            .unwrap();
        let refs = model.resolve_tables("select count(*) from issue_comments", None).unwrap();
        assert!(refs.contains(&issues));
        assert!(refs.contains(&comments));

        let explicit = ["Comments".to_string(), "nope".to_string()];
        let refs = model.resolve_tables("select 1", Some(&explicit[..])).unwrap();
        assert_eq!(refs.as_slice(), [comments]);
    }

    #[test]
    fn nested_engine_access_is_busy() {
        let runtime = Runtime::new();
        let model = read_model(&runtime);
        let result: Result<(), DbError> = model.with_engine(|_| {
            model.select("select 1", &[])?;
            Ok(())
        });
        assert!(matches!(result, Err(DbError::Busy)));
    }
}
