//! Embedded SQL Engine Seam
//!
//! The store talks to its relational read model only through the
//! [`SqlEngine`] trait. [`SqliteEngine`] implements it on top of bundled
//! SQLite; tests and hosts may supply their own.
//!
//! # Table Analysis
//!
//! The store needs to know which tables a query reads and which tables a
//! commit wrote:
//!
//! - [`SqliteEngine`] asks SQLite itself. Reads come from the authorizer
//!   while the query is prepared, so views resolve to their base tables.
//!   Writes come from the update hook, so rows written by triggers count.
//!
//! - Other engines fall back to [`tables_used_by`], a small tokenizer that
//!   collects the identifiers following `FROM`, `JOIN`, `INTO`, `UPDATE` and
//!   `TABLE`. It over-approximates (CTE names and unknown identifiers are
//!   returned too) and cannot see through views or triggers.
//!
//! Callers intersect the result with the tables they know about.

mod sqlite;

use std::fmt;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::error::DbError;

pub use sqlite::SqliteEngine;

/// One result row, keyed by column name in select order.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A bind parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Integer(v) => write!(f, "{v}"),
            SqlValue::Real(v) => write!(f, "{v}"),
            SqlValue::Text(v) => write!(f, "'{v}'"),
            SqlValue::Blob(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Integer(value.into())
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        SqlValue::Integer(value.into())
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Integer(value.into())
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        SqlValue::Blob(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlValue::Null, Into::into)
    }
}

/// The relational engine backing the read model.
///
/// Transactions nest: every `begin` must be matched by exactly one `commit`
/// or `rollback`, and rolling back an inner transaction leaves the outer one
/// open.
pub trait SqlEngine {
    /// Run one statement, returning the number of changed rows.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize, DbError>;

    /// Run several `;`-separated statements without parameters.
    fn execute_batch(&mut self, sql: &str) -> Result<(), DbError>;

    fn select(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError>;

    /// Tables a query reads, lowercased.
    fn tables_read_by(&self, sql: &str) -> Result<IndexSet<String>, DbError> {
        Ok(tables_used_by(sql))
    }

    /// Tables a statement names as its write target, lowercased.
    fn tables_written_by(&self, sql: &str) -> Result<IndexSet<String>, DbError> {
        Ok(tables_used_by(sql))
    }

    /// Tables with rows changed since the last call, in first-change order.
    ///
    /// `None` when the engine does not observe row changes; callers then
    /// rely on [`SqlEngine::tables_written_by`] alone.
    fn take_changed_tables(&mut self) -> Option<IndexSet<String>> {
        None
    }

    fn begin(&mut self) -> Result<(), DbError>;

    fn commit(&mut self) -> Result<(), DbError>;

    fn rollback(&mut self) -> Result<(), DbError>;

    /// Run `f` and record the row changes it makes.
    fn with_changeset(
        &mut self,
        f: &mut dyn FnMut(&mut dyn SqlEngine) -> Result<(), DbError>,
    ) -> Result<Changeset, DbError> {
        let _ = f;
        Err(DbError::Unsupported("changesets"))
    }

    /// Undo the row changes recorded in `changeset`.
    fn rollback_changeset(&mut self, changeset: &Changeset) -> Result<(), DbError> {
        let _ = changeset;
        Err(DbError::Unsupported("changesets"))
    }
}

/// Row changes recorded by [`SqlEngine::with_changeset`], in the engine's
/// own encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    bytes: Vec<u8>,
}

impl Changeset {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Run `f` on `engine`, returning its result with the changes it made.
pub fn with_changeset<T>(
    engine: &mut dyn SqlEngine,
    f: impl FnOnce(&mut dyn SqlEngine) -> Result<T, DbError>,
) -> Result<(Changeset, T), DbError> {
    let mut f = Some(f);
    let mut output = None;
    let changeset = engine.with_changeset(&mut |engine| {
        if let Some(f) = f.take() {
            output = Some(f(engine)?);
        }
        Ok(())
    })?;
    match output {
        Some(output) => Ok((changeset, output)),
        None => Err(DbError::Transaction("changeset body did not run".into())),
    }
}

/// Run `f` inside one transaction, committing on `Ok` and rolling back on `Err`.
pub fn transaction<T, E>(
    engine: &mut dyn SqlEngine,
    f: impl FnOnce(&mut dyn SqlEngine) -> Result<T, E>,
) -> Result<T, E>
where
    E: From<DbError>,
{
    engine.begin()?;
    match f(&mut *engine) {
        Ok(value) => {
            engine.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = engine.rollback() {
                tracing::error!(error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Punct(char),
}

fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            '\'' => {
                // String literal, '' escapes a quote
                i += 1;
                while i < chars.len() {
                    if chars[i] == '\'' {
                        if chars.get(i + 1) == Some(&'\'') {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            '"' | '`' | '[' => {
                let close = if c == '[' { ']' } else { c };
                let start = i + 1;
                i = start;
                while i < chars.len() && chars[i] != close {
                    i += 1;
                }
                tokens.push(Token::Quoted(chars[start..i.min(chars.len())].iter().collect()));
                i += 1;
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            _ => {
                tokens.push(Token::Punct(c));
                i += 1;
            }
        }
    }
    tokens
}

const CLAUSE_WORDS: &[&str] = &[
    "as", "cross", "default", "except", "full", "group", "having", "inner", "intersect", "join",
    "left", "limit", "natural", "on", "order", "outer", "returning", "right", "select", "set",
    "union", "using", "values", "where", "window",
];

fn is_word(token: Option<&Token>, word: &str) -> bool {
    matches!(token, Some(Token::Word(w)) if w.eq_ignore_ascii_case(word))
}

/// Read a possibly schema-qualified name at `tokens[*i]`.
fn read_name(tokens: &[Token], i: &mut usize) -> Option<String> {
    let mut name = match tokens.get(*i)? {
        Token::Word(w) | Token::Quoted(w) => w.clone(),
        Token::Punct(_) => return None,
    };
    *i += 1;
    while tokens.get(*i) == Some(&Token::Punct('.')) {
        match tokens.get(*i + 1) {
            Some(Token::Word(w)) | Some(Token::Quoted(w)) => {
                name = w.clone();
                *i += 2;
            }
            _ => break,
        }
    }
    Some(name.to_lowercase())
}

/// Statically collect the table names referenced by `sql`, lowercased.
pub fn tables_used_by(sql: &str) -> IndexSet<String> {
    let tokens = tokenize(sql);
    let mut tables = IndexSet::new();
    let mut i = 0;

    while i < tokens.len() {
        let keyword = match &tokens[i] {
            Token::Word(w) => w.to_ascii_lowercase(),
            _ => {
                i += 1;
                continue;
            }
        };
        i += 1;
        let relation_list = match keyword.as_str() {
            "from" | "join" => true,
            "into" | "table" => false,
            "update" => {
                if is_word(tokens.get(i), "or") {
                    i += 2;
                }
                false
            }
            _ => continue,
        };
        if is_word(tokens.get(i), "if") {
            i += 1;
            if is_word(tokens.get(i), "not") {
                i += 1;
            }
            if is_word(tokens.get(i), "exists") {
                i += 1;
            }
        }

        loop {
            let Some(name) = read_name(&tokens, &mut i) else {
                break;
            };
            // Table-valued function such as json_each(...)
            let is_function = relation_list && tokens.get(i) == Some(&Token::Punct('('));
            if !is_function && !CLAUSE_WORDS.contains(&name.as_str()) {
                tables.insert(name);
            }
            if !relation_list {
                break;
            }
            // Optional alias
            if is_word(tokens.get(i), "as") {
                i += 2;
            } else if let Some(Token::Word(w)) = tokens.get(i) {
                if !CLAUSE_WORDS.contains(&w.to_ascii_lowercase().as_str()) {
                    i += 1;
                }
            }
            if tokens.get(i) == Some(&Token::Punct(',')) {
                i += 1;
            } else {
                break;
            }
        }
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(sql: &str) -> Vec<String> {
        tables_used_by(sql).into_iter().collect()
    }

    #[test]
    fn simple_select() {
        assert_eq!(tables("select * from issues"), vec!["issues"]);
        assert_eq!(tables("SELECT id FROM Issues WHERE done = 0"), vec!["issues"]);
    }

    #[test]
    fn joins_aliases_and_comma_lists() {
        assert_eq!(
            tables("select * from issues i, labels l join comments as c on c.issue_id = i.id"),
            vec!["issues", "labels", "comments"]
        );
    }

    #[test]
    fn writes_and_ddl() {
        assert_eq!(tables("INSERT OR REPLACE INTO issues (id) VALUES (?)"), vec!["issues"]);
        assert_eq!(tables("update or ignore comments set body = ?"), vec!["comments"]);
        assert_eq!(tables("delete from labels where id = ?"), vec!["labels"]);
        assert_eq!(
            tables("create table if not exists issues (id text primary key)"),
            vec!["issues"]
        );
    }

    #[test]
    fn quoted_and_qualified_names() {
        assert_eq!(tables(r#"select * from "Todo Items""#), vec!["todo items"]);
        assert_eq!(tables("select * from main.issues"), vec!["issues"]);
        assert_eq!(tables("select * from [issues]"), vec!["issues"]);
    }

    #[test]
    fn subqueries_functions_literals_and_comments() {
        assert_eq!(
            tables("select * from (select id from issues) where x in (select issue_id from comments)"),
            vec!["issues", "comments"]
        );
        assert_eq!(tables("select value from json_each(?)"), Vec::<String>::new());
        assert_eq!(tables("select 'from labels' -- from users\n from issues"), vec!["issues"]);
    }

    struct Bare;

    impl SqlEngine for Bare {
        fn execute(&mut self, _: &str, _: &[SqlValue]) -> Result<usize, DbError> {
            Ok(0)
        }

        fn execute_batch(&mut self, _: &str) -> Result<(), DbError> {
            Ok(())
        }

        fn select(&self, _: &str, _: &[SqlValue]) -> Result<Vec<Row>, DbError> {
            Ok(Vec::new())
        }

        fn begin(&mut self) -> Result<(), DbError> {
            Ok(())
        }

        fn commit(&mut self) -> Result<(), DbError> {
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), DbError> {
            Ok(())
        }
    }

    #[test]
    fn default_engine_scans_sql_text() {
        let mut engine = Bare;
        let read = engine.tables_read_by("select * from issues join labels").unwrap();
        assert_eq!(read.into_iter().collect::<Vec<_>>(), vec!["issues", "labels"]);
        assert!(engine.take_changed_tables().is_none());
        assert!(matches!(
            with_changeset(&mut engine, |_| Ok(())),
            Err(DbError::Unsupported("changesets"))
        ));
    }

    #[test]
    fn option_values_bind_as_null() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some("a")), SqlValue::Text("a".into()));
        assert_eq!(SqlValue::from(true), SqlValue::Integer(1));
    }
}
