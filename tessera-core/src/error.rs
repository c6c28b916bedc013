//! Error Types
//!
//! Errors are split along the lines of who can do something about them:
//!
//! - [`GraphError`]: a computation inside the graph failed or a handle is stale.
//!   The node that failed stays dirty and can be retried.
//! - [`DbError`]: the embedded SQL engine rejected a statement.
//! - [`DecodeError`]: query rows did not match the declared result schema.
//!   This is a programming error and is never retried.
//! - [`MaterializeError`]: applying an event to the read model failed. Fatal to
//!   the store instance.
//! - [`StoreError`]: everything the public store surface can return.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

use crate::event::EventSequenceNumber;
use crate::graph::AtomId;
use crate::materialize::MaterializerHash;
use crate::store::CommitReport;

/// Boxed error used for failures raised by user code (computations, materializers).
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors raised while computing atoms in the graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The body of a thunk or effect returned an error.
    #[error("computation `{label}` failed: {source}")]
    Computation {
        label: String,
        #[source]
        source: BoxError,
    },

    /// An atom was read while it was already being computed.
    #[error("dependency cycle detected at `{label}`")]
    Cycle { label: String },

    /// The handle points at an atom that has been destroyed.
    #[error("atom {0} has been destroyed")]
    Destroyed(AtomId),

    /// Effects are leaves; nothing may read them.
    #[error("effect `{label}` cannot be read by another computation")]
    EffectRead { label: String },

    /// A typed handle did not match the value stored in the atom.
    #[error("atom `{label}` does not hold a value of the requested type")]
    TypeMismatch { label: String },
}

impl GraphError {
    /// Wrap an arbitrary error raised inside a computation.
    pub fn computation(label: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Computation {
            label: label.into(),
            source: source.into(),
        }
    }

    /// Find a [`DecodeError`] anywhere in the source chain.
    pub fn decode_error(&self) -> Option<&DecodeError> {
        let mut current: Option<&(dyn StdError + 'static)> = match self {
            GraphError::Computation { source, .. } => Some(source.as_ref() as &(dyn StdError + 'static)),
            _ => None,
        };
        while let Some(err) = current {
            if let Some(decode) = err.downcast_ref::<DecodeError>() {
                return Some(decode);
            }
            current = err.source();
        }
        None
    }
}

/// Errors from the embedded SQL engine.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("transaction: {0}")]
    Transaction(String),

    /// The engine was already in use, e.g. a query issued from a materializer.
    #[error("sql engine is busy")]
    Busy,

    /// Two result columns share a name, so rows cannot be keyed by column.
    #[error("result column `{column}` appears more than once; alias it")]
    DuplicateColumn { column: String },

    #[error("sql engine does not support {0}")]
    Unsupported(&'static str),
}

/// Query rows could not be decoded into the declared result type.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("row {index} does not match the result schema: {source}")]
    Row {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("query returned no rows but the result schema requires one")]
    MissingRow,

    #[error("query row has no columns")]
    MissingColumn,
}

/// Failure to persist events to the event log.
#[derive(Debug, Error)]
#[error("event log: {message}")]
pub struct EventLogError {
    pub message: String,
}

impl EventLogError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors raised while applying events to the read model.
#[derive(Debug, Error)]
pub enum MaterializeError {
    /// The event args do not decode into the materializer's argument type.
    #[error("event `{event}` has invalid args: {source}")]
    InvalidArgs {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    /// The materializer itself returned an error.
    #[error("materializer for `{event}` ({seq_num}) failed: {source}")]
    Materializer {
        event: String,
        seq_num: EventSequenceNumber,
        #[source]
        source: BoxError,
    },

    /// A statement emitted by a materializer failed to execute.
    #[error("statement `{sql}` for `{event}` failed: {source}")]
    Statement {
        event: String,
        sql: String,
        #[source]
        source: DbError,
    },

    /// The locally computed materializer hash differs from the one attached
    /// to the event. Materializers are nondeterministic or the schema drifted.
    #[error("materializer hash mismatch for `{event}` ({seq_num}): expected {expected}, got {actual}")]
    HashMismatch {
        event: String,
        seq_num: EventSequenceNumber,
        expected: MaterializerHash,
        actual: MaterializerHash,
    },

    #[error("failed to encode statements for hashing: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    EventLog(#[from] EventLogError),
}

impl MaterializeError {
    /// Whether this is the hash-mismatch tripwire rather than a generic failure.
    pub fn is_hash_mismatch(&self) -> bool {
        matches!(self, MaterializeError::HashMismatch { .. })
    }
}

/// Errors returned by the public [`Store`](crate::store::Store) surface.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Materialization failed; the store has shut down.
    #[error("materialization failed: {0}")]
    Materialize(Arc<MaterializeError>),

    /// The store shut down earlier and no longer accepts this operation.
    #[error("store has shut down: {cause}")]
    Shutdown { cause: Arc<MaterializeError> },

    /// A query or subscriber computation failed.
    #[error(transparent)]
    Query(#[from] GraphError),

    /// The events were applied and logged, but a dependent computation
    /// failed while refreshing. `report` describes what was committed.
    #[error("commit applied but refresh failed: {source}")]
    Refresh {
        report: Box<CommitReport>,
        #[source]
        source: GraphError,
    },

    #[error(transparent)]
    Db(#[from] DbError),

    /// The event log could not be read.
    #[error(transparent)]
    EventLog(#[from] EventLogError),

    /// `set_signal` was given a definition that is not a signal.
    #[error("query `{label}` is not a signal")]
    NotASignal { label: String },

    /// `commit` was called from inside a commit (e.g. from a subscriber callback).
    #[error("commit called while another commit is in progress")]
    ReentrantCommit,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether the error ended the store's usable lifetime.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Materialize(_) | StoreError::Shutdown { .. }
        )
    }

    /// What was committed despite the error, if anything.
    pub fn commit_report(&self) -> Option<&CommitReport> {
        match self {
            StoreError::Refresh { report, .. } => Some(&**report),
            _ => None,
        }
    }

    /// The materialization failure behind a fatal error, if any.
    pub fn materialize_error(&self) -> Option<&MaterializeError> {
        match self {
            StoreError::Materialize(err) | StoreError::Shutdown { cause: err } => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_is_found_through_computation() {
        let decode = DecodeError::MissingRow;
        let err = GraphError::computation("issues", decode);
        assert!(matches!(err.decode_error(), Some(DecodeError::MissingRow)));
    }

    #[test]
    fn fatal_classification() {
        let cause = Arc::new(MaterializeError::EventLog(EventLogError::new("disk full")));
        assert!(StoreError::Materialize(cause.clone()).is_fatal());
        assert!(StoreError::Shutdown { cause }.is_fatal());
        assert!(!StoreError::ReentrantCommit.is_fatal());
    }

    #[test]
    fn refresh_error_keeps_the_report() {
        let report = CommitReport {
            write_tables: vec!["issues".into()],
            refreshed: true,
            ..CommitReport::default()
        };
        let err = StoreError::Refresh {
            report: Box::new(report.clone()),
            source: GraphError::computation("count", "boom"),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.commit_report(), Some(&report));
        assert!(StoreError::ReentrantCommit.commit_report().is_none());
    }
}
