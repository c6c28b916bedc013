//! Materializers
//!
//! A materializer turns one event into the SQL statements that apply it to
//! the read model. Materializers must be deterministic: the same event always
//! yields the same statements. [`MaterializerHash`] fingerprints the emitted
//! statements so clients can detect when two of them disagree.

use std::fmt;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{BoxError, MaterializeError};
use crate::event::Event;
use crate::sql::SqlValue;

/// One write statement emitted by a materializer.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub bind_values: Vec<SqlValue>,
    /// Tables written. When `None`, they are derived from the SQL text.
    pub write_tables: Option<SmallVec<[String; 2]>>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bind_values: Vec::new(),
            write_tables: None,
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.bind_values.push(value.into());
        self
    }

    /// Declare a written table explicitly instead of analysing the SQL.
    pub fn writes(mut self, table: impl Into<String>) -> Self {
        self.write_tables
            .get_or_insert_with(SmallVec::new)
            .push(table.into().to_lowercase());
        self
    }
}

/// Fingerprint of the statements a materializer emitted for one event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaterializerHash([u8; 32]);

impl MaterializerHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for MaterializerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for MaterializerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MaterializerHash({self})")
    }
}

#[derive(Serialize)]
struct HashedStatement<'a> {
    sql: &'a str,
    bind_values: &'a [SqlValue],
}

/// Hash the SQL text and bind values of `statements`, in order.
pub fn hash_statements(statements: &[SqlStatement]) -> Result<MaterializerHash, rmp_serde::encode::Error> {
    let hashed: Vec<HashedStatement<'_>> = statements
        .iter()
        .map(|statement| HashedStatement {
            sql: &statement.sql,
            bind_values: &statement.bind_values,
        })
        .collect();
    let bytes = rmp_serde::to_vec(&hashed)?;
    Ok(MaterializerHash(*blake3::hash(&bytes).as_bytes()))
}

type MaterializeFn = dyn Fn(&Event) -> Result<Vec<SqlStatement>, MaterializeError>;

/// A registered materializer for one event name.
#[derive(Clone)]
pub struct Materializer {
    event: String,
    run: Rc<MaterializeFn>,
}

impl Materializer {
    /// Wrap a typed materializer. Event args are decoded into `A` first.
    pub(crate) fn new<A, F>(event: impl Into<String>, materialize: F) -> Self
    where
        A: DeserializeOwned + 'static,
        F: Fn(&A, &Event) -> Result<Vec<SqlStatement>, BoxError> + 'static,
    {
        let event = event.into();
        let name = event.clone();
        Self {
            event,
            run: Rc::new(move |event: &Event| {
                let args: A = event
                    .decode_args()
                    .map_err(|source| MaterializeError::InvalidArgs {
                        event: name.clone(),
                        source,
                    })?;
                materialize(&args, event).map_err(|source| MaterializeError::Materializer {
                    event: name.clone(),
                    seq_num: event.seq_num,
                    source,
                })
            }),
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn run(&self, event: &Event) -> Result<Vec<SqlStatement>, MaterializeError> {
        (self.run)(event)
    }
}

impl fmt::Debug for Materializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Materializer").field("event", &self.event).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSequenceNumber;
    use serde_json::json;

    fn event(args: serde_json::Value) -> Event {
        Event {
            name: "todoCreated".into(),
            args,
            seq_num: EventSequenceNumber::new(1, 0),
            client_id: "c".into(),
            session_id: "s".into(),
            materializer_hash: None,
        }
    }

    #[derive(Deserialize)]
    struct TodoCreated {
        id: String,
        text: String,
    }

    fn todo_materializer() -> Materializer {
        Materializer::new("todoCreated", |args: &TodoCreated, _event: &Event| {
            Ok(vec![SqlStatement::new("insert into todos (id, text) values (?, ?)")
                .bind(args.id.as_str())
                .bind(args.text.as_str())])
        })
    }

    #[test]
    fn hash_depends_on_sql_and_binds() {
        let a = [SqlStatement::new("insert into t values (?)").bind(1i64)];
        let b = [SqlStatement::new("insert into t values (?)").bind(2i64)];
        assert_eq!(hash_statements(&a).unwrap(), hash_statements(&a).unwrap());
        assert_ne!(hash_statements(&a).unwrap(), hash_statements(&b).unwrap());

        // Declared write tables are not part of the fingerprint
        let declared = [SqlStatement::new("insert into t values (?)").bind(1i64).writes("t")];
        assert_eq!(hash_statements(&a).unwrap(), hash_statements(&declared).unwrap());
    }

    #[test]
    fn materializer_decodes_args() {
        let statements = todo_materializer()
            .run(&event(json!({ "id": "1", "text": "milk" })))
            .unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].bind_values,
            vec![SqlValue::from("1"), SqlValue::from("milk")]
        );
    }

    #[test]
    fn invalid_args_are_reported() {
        let err = todo_materializer().run(&event(json!({ "id": 1 }))).unwrap_err();
        assert!(matches!(err, MaterializeError::InvalidArgs { .. }));
    }

    #[test]
    fn write_tables_are_lowercased() {
        let statement = SqlStatement::new("insert into Todos values (1)").writes("Todos");
        assert_eq!(statement.write_tables.unwrap().as_slice(), ["todos".to_string()]);
    }
}
