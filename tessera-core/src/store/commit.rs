//! Commit & Materialization Pipeline
//!
//! Applying a batch of events to the read model goes through these steps:
//!
//! 1. Resolve each event's materializer by name. Events without one are
//!    skipped (they may come from a newer schema) but still logged.
//!
//! 2. Run the materializers and execute their statements, all inside one
//!    transaction, so a failure anywhere leaves no trace of the batch.
//!
//! 3. When hash verification is on, fingerprint each event's statements.
//!    Local events get the hash attached; pulled and replayed events that
//!    carry a hash must match it.
//!
//! 4. Union the tables written by every statement: each statement's own
//!    target plus, when the engine observes row changes, every table whose
//!    rows changed inside the transaction (trigger writes included).
//!
//! The caller then writes the table refs of that union in one batch, so
//! each dependent query refreshes at most once per commit.

use indexmap::IndexSet;

use crate::error::MaterializeError;
use crate::event::{Event, EventLog};
use crate::materialize::hash_statements;
use crate::read_model::ReadModel;
use crate::schema::Schema;
use crate::sql::{transaction, SqlEngine};

/// Where a batch of events comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Committed on this client.
    Local,
    /// Received from another client.
    Pulled,
    /// Re-applied from the event log at startup.
    Replay,
}

impl Origin {
    fn as_str(self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Pulled => "pulled",
            Origin::Replay => "replay",
        }
    }
}

/// Settings for one pipeline run.
pub(crate) struct Pipeline<'a> {
    pub(crate) read_model: &'a ReadModel,
    pub(crate) schema: &'a Schema,
    pub(crate) verify_hashes: bool,
}

impl Pipeline<'_> {
    /// Materialize `events` and append them to `log` in one transaction.
    ///
    /// Returns the tables written, in first-write order.
    pub(crate) fn apply(
        &self,
        events: &mut [Event],
        origin: Origin,
        log: Option<&mut dyn EventLog>,
    ) -> Result<IndexSet<String>, MaterializeError> {
        self.read_model.with_engine(|engine| {
            // Changes made outside the pipeline are not part of this batch
            engine.take_changed_tables();
            transaction(engine, |engine| {
                let mut tables = IndexSet::new();
                for event in events.iter_mut() {
                    tables.extend(self.materialize(engine, event, origin)?);
                }
                if let Some(changed) = engine.take_changed_tables() {
                    tables.extend(changed);
                }
                if let Some(log) = log {
                    log.append(events)?;
                }
                Ok(tables)
            })
        })
    }

    fn materialize(
        &self,
        engine: &mut dyn SqlEngine,
        event: &mut Event,
        origin: Origin,
    ) -> Result<IndexSet<String>, MaterializeError> {
        let Some(materializer) = self.schema.materializer_for(&event.name) else {
            tracing::warn!(
                event = %event.name,
                seq_num = %event.seq_num,
                origin = origin.as_str(),
                "no materializer registered, skipping"
            );
            return Ok(IndexSet::new());
        };

        let statements = materializer.run(event)?;

        if self.verify_hashes {
            let actual = hash_statements(&statements)?;
            match (origin, event.materializer_hash) {
                (Origin::Local, _) => event.materializer_hash = Some(actual),
                (_, Some(expected)) if expected != actual => {
                    return Err(MaterializeError::HashMismatch {
                        event: event.name.clone(),
                        seq_num: event.seq_num,
                        expected,
                        actual,
                    });
                }
                _ => {}
            }
        }

        let mut tables = IndexSet::new();
        for statement in &statements {
            engine
                .execute(&statement.sql, &statement.bind_values)
                .map_err(|source| MaterializeError::Statement {
                    event: event.name.clone(),
                    sql: statement.sql.clone(),
                    source,
                })?;
            match &statement.write_tables {
                Some(explicit) => tables.extend(explicit.iter().map(|table| table.to_lowercase())),
                None => tables.extend(engine.tables_written_by(&statement.sql)?),
            }
        }

        tracing::debug!(
            event = %event.name,
            seq_num = %event.seq_num,
            origin = origin.as_str(),
            statements = statements.len(),
            "materialized"
        );
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventSequenceNumber, MemoryEventLog};
    use crate::materialize::{MaterializerHash, SqlStatement};
    use crate::reactive::Runtime;
    use crate::schema::{EventDef, TableDef};
    use crate::sql::SqliteEngine;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct TodoCreated {
        id: i64,
        text: String,
    }

    fn schema() -> Schema {
        let created = EventDef::<TodoCreated>::new("todo_created");
        Schema::new()
            .table(TableDef::new("todos", "create table todos (id integer primary key, text text not null)"))
            .table(TableDef::new("stats", "create table stats (n integer)"))
            .materializer(&created, |args: &TodoCreated, _| {
                Ok(vec![SqlStatement::new("insert into todos (id, text) values (?, ?)")
                    .bind(args.id)
                    .bind(args.text.as_str())])
            })
    }

    fn event(name: &str, global: u64, args: serde_json::Value) -> Event {
        Event {
            name: name.to_string(),
            args,
            seq_num: EventSequenceNumber::new(global, 0),
            client_id: "c".to_string(),
            session_id: "s".to_string(),
            materializer_hash: None,
        }
    }

    fn todo_count(read_model: &ReadModel) -> usize {
        read_model.select("select * from todos", &[]).unwrap().len()
    }

    #[test]
    fn applies_events_and_collects_write_tables() {
        let runtime = Runtime::new();
        let schema = schema();
        let read_model = ReadModel::new(&runtime, Box::new(SqliteEngine::open_in_memory().unwrap()), &schema).unwrap();
        let pipeline = Pipeline {
            read_model: &read_model,
            schema: &schema,
            verify_hashes: true,
        };

        let mut log = MemoryEventLog::new();
        let mut events = vec![
            event("todo_created", 1, json!({ "id": 1, "text": "a" })),
            event("from_the_future", 2, json!({})),
        ];
        let tables = pipeline.apply(&mut events, Origin::Local, Some(&mut log)).unwrap();

        assert_eq!(tables.into_iter().collect::<Vec<_>>(), vec!["todos"]);
        assert_eq!(todo_count(&read_model), 1);
        assert_eq!(log.len(), 2);
        assert!(events[0].materializer_hash.is_some());
        assert!(events[1].materializer_hash.is_none());
    }

    #[test]
    fn failing_batch_rolls_back() {
        let runtime = Runtime::new();
        let schema = schema();
        let read_model = ReadModel::new(&runtime, Box::new(SqliteEngine::open_in_memory().unwrap()), &schema).unwrap();
        let pipeline = Pipeline {
            read_model: &read_model,
            schema: &schema,
            verify_hashes: false,
        };

        let mut log = MemoryEventLog::new();
        // Duplicate primary key on the second event
        let mut events = vec![
            event("todo_created", 1, json!({ "id": 1, "text": "a" })),
            event("todo_created", 2, json!({ "id": 1, "text": "b" })),
        ];
        let err = pipeline.apply(&mut events, Origin::Local, Some(&mut log)).unwrap_err();

        assert!(matches!(err, MaterializeError::Statement { .. }));
        assert_eq!(todo_count(&read_model), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn pulled_hash_mismatch_is_detected() {
        let runtime = Runtime::new();
        let schema = schema();
        let read_model = ReadModel::new(&runtime, Box::new(SqliteEngine::open_in_memory().unwrap()), &schema).unwrap();
        let pipeline = Pipeline {
            read_model: &read_model,
            schema: &schema,
            verify_hashes: true,
        };

        let mut pulled = event("todo_created", 1, json!({ "id": 1, "text": "a" }));
        pulled.materializer_hash = Some(MaterializerHash::from_bytes([7; 32]));
        let err = pipeline
            .apply(std::slice::from_mut(&mut pulled), Origin::Pulled, None)
            .unwrap_err();

        assert!(err.is_hash_mismatch());
        assert_eq!(todo_count(&read_model), 0);
    }

    #[test]
    fn trigger_writes_join_the_write_set() {
        let runtime = Runtime::new();
        let created = EventDef::<TodoCreated>::new("todo_created");
        let schema = Schema::new()
            .table(TableDef::new("todos", "create table todos (id integer primary key, text text not null)"))
            .table(TableDef::new(
                "stats",
                "create table stats (n integer);
                 create trigger todos_stats after insert on todos
                 begin insert into stats (n) values (new.id); end;",
            ))
            .materializer(&created, |args: &TodoCreated, _| {
                Ok(vec![SqlStatement::new("insert into todos (id, text) values (?, ?)")
                    .bind(args.id)
                    .bind(args.text.as_str())])
            });
        let read_model = ReadModel::new(&runtime, Box::new(SqliteEngine::open_in_memory().unwrap()), &schema).unwrap();
        let pipeline = Pipeline {
            read_model: &read_model,
            schema: &schema,
            verify_hashes: false,
        };

        let mut events = vec![event("todo_created", 1, json!({ "id": 1, "text": "a" }))];
        let tables = pipeline.apply(&mut events, Origin::Local, None).unwrap();

        assert_eq!(tables.into_iter().collect::<Vec<_>>(), vec!["todos", "stats"]);
        assert_eq!(read_model.select("select n from stats", &[]).unwrap().len(), 1);
    }
}
