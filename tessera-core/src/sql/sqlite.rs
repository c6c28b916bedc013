//! SQLite engine on `rusqlite`.
//!
//! Two connection hooks tell the store which tables a statement touches:
//!
//! - The authorizer reports every table column read while a statement is
//!   prepared, including the base tables behind a view.
//! - The update hook reports every row change, including rows written by
//!   triggers. SQLite skips it for `WITHOUT ROWID` tables and for the
//!   truncate optimization of an unqualified `DELETE`, so the statement's own
//!   write target is taken from the authorizer as well.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use rusqlite::hooks::{Action, AuthAction, AuthContext, Authorization};
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value as JsonValue;

#[cfg(feature = "changesets")]
use super::Changeset;
use super::{Row, SqlEngine, SqlValue};
use crate::error::DbError;

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            SqlValue::Null => ValueRef::Null,
            SqlValue::Integer(v) => ValueRef::Integer(*v),
            SqlValue::Real(v) => ValueRef::Real(*v),
            SqlValue::Text(v) => ValueRef::Text(v.as_bytes()),
            SqlValue::Blob(v) => ValueRef::Blob(v),
        }))
    }
}

fn to_json(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(v) => JsonValue::from(v),
        ValueRef::Real(v) => serde_json::Number::from_f64(v).map_or(JsonValue::Null, JsonValue::Number),
        ValueRef::Text(bytes) => JsonValue::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => JsonValue::Array(bytes.iter().map(|b| JsonValue::from(*b)).collect()),
    }
}

/// What the hooks have seen. Shared with the hook closures, which SQLite
/// requires to be `Send`.
#[derive(Default)]
struct Observed {
    /// Set while a statement is prepared for analysis.
    analysing: bool,
    read: IndexSet<String>,
    written: IndexSet<String>,
    /// Row changes reported by the update hook.
    changed: IndexSet<String>,
}

/// Tables one statement touches, as reported by the authorizer.
#[derive(Debug, Default)]
struct StatementTables {
    read: IndexSet<String>,
    written: IndexSet<String>,
}

/// [`SqlEngine`] backed by one SQLite connection.
///
/// Transactions are savepoints, so they nest. The engine installs its own
/// authorizer and update hook on the connection, replacing any set before.
pub struct SqliteEngine {
    conn: Rc<Connection>,
    depth: usize,
    observed: Arc<Mutex<Observed>>,
    analysed: RefCell<HashMap<String, Rc<StatementTables>>>,
}

impl SqliteEngine {
    pub fn open_in_memory() -> Result<Self, DbError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        let observed = Arc::new(Mutex::new(Observed::default()));

        let sink = Arc::clone(&observed);
        conn.authorizer(Some(move |ctx: AuthContext<'_>| {
            let mut observed = sink.lock();
            if observed.analysing {
                match ctx.action {
                    AuthAction::Read { table_name, .. } => {
                        observed.read.insert(table_name.to_lowercase());
                    }
                    // Only the statement's own target; trigger bodies report
                    // through the update hook when they actually fire
                    AuthAction::Insert { table_name }
                    | AuthAction::Delete { table_name }
                    | AuthAction::Update { table_name, .. }
                        if ctx.accessor.is_none() =>
                    {
                        observed.written.insert(table_name.to_lowercase());
                    }
                    _ => {}
                }
            }
            Authorization::Allow
        }));

        let sink = Arc::clone(&observed);
        conn.update_hook(Some(move |_: Action, _: &str, table: &str, _: i64| {
            sink.lock().changed.insert(table.to_lowercase());
        }));

        Self {
            conn: Rc::new(conn),
            depth: 0,
            observed,
            analysed: RefCell::new(HashMap::new()),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Number of open (possibly nested) transactions.
    pub fn transaction_depth(&self) -> usize {
        self.depth
    }

    /// Prepare `sql` once with the authorizer listening. Results are cached
    /// per SQL text; the schema is fixed once the store is built.
    fn analyse(&self, sql: &str) -> Result<Rc<StatementTables>, DbError> {
        if let Some(tables) = self.analysed.borrow().get(sql) {
            return Ok(Rc::clone(tables));
        }

        {
            let mut observed = self.observed.lock();
            observed.analysing = true;
            observed.read.clear();
            observed.written.clear();
        }
        let prepared = self.conn.prepare(sql).map(drop);
        let tables = {
            let mut observed = self.observed.lock();
            observed.analysing = false;
            StatementTables {
                read: std::mem::take(&mut observed.read),
                written: std::mem::take(&mut observed.written),
            }
        };
        prepared?;

        let tables = Rc::new(tables);
        self.analysed
            .borrow_mut()
            .insert(sql.to_string(), Rc::clone(&tables));
        Ok(tables)
    }
}

impl SqlEngine for SqliteEngine {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize, DbError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        Ok(stmt.execute(params_from_iter(params.iter()))?)
    }

    fn execute_batch(&mut self, sql: &str) -> Result<(), DbError> {
        Ok(self.conn.execute_batch(sql)?)
    }

    fn select(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut seen = IndexSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(DbError::DuplicateColumn {
                    column: column.clone(),
                });
            }
        }
        let mut rows = stmt.query(params_from_iter(params.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Row::new();
            for (index, name) in columns.iter().enumerate() {
                record.insert(name.clone(), to_json(row.get_ref(index)?));
            }
            out.push(record);
        }
        Ok(out)
    }

    fn tables_read_by(&self, sql: &str) -> Result<IndexSet<String>, DbError> {
        Ok(self.analyse(sql)?.read.clone())
    }

    fn tables_written_by(&self, sql: &str) -> Result<IndexSet<String>, DbError> {
        Ok(self.analyse(sql)?.written.clone())
    }

    fn take_changed_tables(&mut self) -> Option<IndexSet<String>> {
        Some(std::mem::take(&mut self.observed.lock().changed))
    }

    fn begin(&mut self) -> Result<(), DbError> {
        self.conn
            .execute_batch(&format!("SAVEPOINT tessera_{}", self.depth))?;
        self.depth += 1;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DbError> {
        let depth = self
            .depth
            .checked_sub(1)
            .ok_or_else(|| DbError::Transaction("commit without an open transaction".into()))?;
        self.conn.execute_batch(&format!("RELEASE tessera_{depth}"))?;
        self.depth = depth;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        let depth = self
            .depth
            .checked_sub(1)
            .ok_or_else(|| DbError::Transaction("rollback without an open transaction".into()))?;
        self.conn.execute_batch(&format!(
            "ROLLBACK TO tessera_{depth}; RELEASE tessera_{depth}"
        ))?;
        self.depth = depth;
        Ok(())
    }

    #[cfg(feature = "changesets")]
    fn with_changeset(
        &mut self,
        f: &mut dyn FnMut(&mut dyn SqlEngine) -> Result<(), DbError>,
    ) -> Result<Changeset, DbError> {
        // The session borrows its own handle so `f` can borrow the engine
        let conn = Rc::clone(&self.conn);
        let mut session = rusqlite::session::Session::new(&conn)?;
        session.attach(None)?;
        f(self)?;
        let mut bytes = Vec::new();
        session.changeset_strm(&mut bytes)?;
        Ok(Changeset::from_bytes(bytes))
    }

    #[cfg(feature = "changesets")]
    fn rollback_changeset(&mut self, changeset: &Changeset) -> Result<(), DbError> {
        use rusqlite::session::{invert_strm, ConflictAction};

        let mut inverse = Vec::new();
        let mut input = changeset.as_bytes();
        invert_strm(&mut input, &mut inverse)?;
        let mut input = inverse.as_slice();
        self.conn.apply_strm(
            &mut input,
            None::<fn(&str) -> bool>,
            |_, _| ConflictAction::SQLITE_CHANGESET_ABORT,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::transaction;

    fn engine() -> SqliteEngine {
        let mut engine = SqliteEngine::open_in_memory().unwrap();
        engine
            .execute_batch("create table issues (id integer primary key, title text, score real, data blob)")
            .unwrap();
        engine
    }

    fn count(engine: &SqliteEngine) -> i64 {
        engine.select("select count(*) as n from issues", &[]).unwrap()[0]["n"]
            .as_i64()
            .unwrap()
    }

    #[test]
    fn rows_are_keyed_by_column() {
        let mut engine = engine();
        engine
            .execute(
                "insert into issues (id, title, score, data) values (?, ?, ?, ?)",
                &[1i64.into(), "first".into(), 0.5.into(), vec![1u8, 2].into()],
            )
            .unwrap();

        let rows = engine.select("select id, title, score, data from issues", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], 1);
        assert_eq!(rows[0]["title"], "first");
        assert_eq!(rows[0]["score"], 0.5);
        assert_eq!(rows[0]["data"], serde_json::json!([1, 2]));
        let columns: Vec<_> = rows[0].keys().cloned().collect();
        assert_eq!(columns, vec!["id", "title", "score", "data"]);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let mut engine = engine();
        let result: Result<(), DbError> = transaction(&mut engine, |tx| {
            tx.execute("insert into issues (id) values (1)", &[])?;
            tx.execute("insert into missing (id) values (1)", &[])?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(count(&engine), 0);
        assert_eq!(engine.transaction_depth(), 0);
    }

    #[test]
    fn inner_rollback_keeps_outer_work() {
        let mut engine = engine();
        engine.begin().unwrap();
        engine.execute("insert into issues (id) values (1)", &[]).unwrap();
        engine.begin().unwrap();
        engine.execute("insert into issues (id) values (2)", &[]).unwrap();
        engine.rollback().unwrap();
        engine.commit().unwrap();

        assert_eq!(count(&engine), 1);
    }

    #[test]
    fn unbalanced_commit_is_an_error() {
        let mut engine = engine();
        assert!(matches!(engine.commit(), Err(DbError::Transaction(_))));
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let engine = engine();
        match engine.select("select 1 as id, 2 as id", &[]) {
            Err(DbError::DuplicateColumn { column }) => assert_eq!(column, "id"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(engine.select("select 1 as a, 2 as b", &[]).unwrap()[0].len(), 2);
    }

    #[test]
    fn reads_resolve_through_views() {
        let mut engine = engine();
        engine
            .execute_batch("create view titled as select id, title from issues where title is not null")
            .unwrap();

        let read = engine.tables_read_by("select count(*) from titled").unwrap();
        assert!(read.contains("issues"));
        let read = engine.tables_read_by("select count(*) from issues").unwrap();
        assert_eq!(read.into_iter().collect::<Vec<_>>(), vec!["issues"]);
        assert!(engine.tables_read_by("select * from missing").is_err());
    }

    #[test]
    fn trigger_writes_are_observed() {
        let mut engine = engine();
        engine
            .execute_batch(
                "create table audit (issue_id integer);
                 create trigger issues_audit after insert on issues
                 begin insert into audit (issue_id) values (new.id); end;",
            )
            .unwrap();
        engine.take_changed_tables();

        let insert = "insert into issues (id) values (?)";
        let written = engine.tables_written_by(insert).unwrap();
        assert_eq!(written.into_iter().collect::<Vec<_>>(), vec!["issues"]);

        engine.execute(insert, &[1i64.into()]).unwrap();
        let changed = engine.take_changed_tables().unwrap();
        assert!(changed.contains("issues"));
        assert!(changed.contains("audit"));
        assert!(engine.take_changed_tables().unwrap().is_empty());
    }

    #[test]
    fn unqualified_delete_is_a_write_target() {
        let engine = engine();
        let written = engine.tables_written_by("delete from issues").unwrap();
        assert_eq!(written.into_iter().collect::<Vec<_>>(), vec!["issues"]);
    }

    #[cfg(feature = "changesets")]
    #[test]
    fn changeset_rollback_restores_rows() {
        let mut engine = engine();
        engine.execute("insert into issues (id) values (1)", &[]).unwrap();

        let (changeset, changed) = crate::sql::with_changeset(&mut engine, |tx| {
            let mut changed = tx.execute("insert into issues (id) values (2)", &[])?;
            changed += tx.execute("delete from issues where id = 1", &[])?;
            Ok(changed)
        })
        .unwrap();
        assert_eq!(changed, 2);
        assert!(!changeset.is_empty());

        engine.rollback_changeset(&changeset).unwrap();
        let ids = engine.select("select id from issues", &[]).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0]["id"], 1);
    }
}
