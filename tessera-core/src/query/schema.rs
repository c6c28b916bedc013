//! Result schemas decode query rows into typed values.

use std::any::type_name;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::DecodeError;
use crate::sql::Row;

static MAPPED_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Decodes the rows of a query into its result value.
///
/// The output's `PartialEq` is the query's result equality: a recompute that
/// decodes an equal value does not notify readers.
pub trait ResultSchema: 'static {
    type Output: PartialEq + 'static;

    fn decode(&self, rows: Vec<Row>) -> Result<Self::Output, DecodeError>;

    /// Contribution of the schema to the query key.
    fn key_part(&self) -> String;

    /// Apply `f` to the decoded value.
    fn map<F, U>(self, f: F) -> Mapped<Self, F, U>
    where
        Self: Sized,
        F: Fn(Self::Output) -> U + 'static,
        U: PartialEq + 'static,
    {
        Mapped {
            inner: self,
            f: Rc::new(f),
            id: MAPPED_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }
}

fn decode_row<R: DeserializeOwned>(index: usize, row: Row) -> Result<R, DecodeError> {
    serde_json::from_value(JsonValue::Object(row)).map_err(|source| DecodeError::Row { index, source })
}

/// Every row, decoded as `R`.
pub struct Rows<R>(PhantomData<fn() -> R>);

impl<R> Rows<R> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<R> Default for Rows<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: DeserializeOwned + PartialEq + 'static> ResultSchema for Rows<R> {
    type Output = Vec<R>;

    fn decode(&self, rows: Vec<Row>) -> Result<Vec<R>, DecodeError> {
        rows.into_iter()
            .enumerate()
            .map(|(index, row)| decode_row(index, row))
            .collect()
    }

    fn key_part(&self) -> String {
        format!("rows<{}>", type_name::<R>())
    }
}

/// The first row, decoded as `R`. An empty result is an error.
pub struct FirstRow<R>(PhantomData<fn() -> R>);

impl<R> FirstRow<R> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<R> Default for FirstRow<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: DeserializeOwned + PartialEq + 'static> ResultSchema for FirstRow<R> {
    type Output = R;

    fn decode(&self, rows: Vec<Row>) -> Result<R, DecodeError> {
        let row = rows.into_iter().next().ok_or(DecodeError::MissingRow)?;
        decode_row(0, row)
    }

    fn key_part(&self) -> String {
        format!("first<{}>", type_name::<R>())
    }
}

/// The first column of the first row, e.g. `select count(*) from todos`.
pub struct Scalar<R>(PhantomData<fn() -> R>);

impl<R> Scalar<R> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<R> Default for Scalar<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: DeserializeOwned + PartialEq + 'static> ResultSchema for Scalar<R> {
    type Output = R;

    fn decode(&self, rows: Vec<Row>) -> Result<R, DecodeError> {
        let row = rows.into_iter().next().ok_or(DecodeError::MissingRow)?;
        let (_, value) = row.into_iter().next().ok_or(DecodeError::MissingColumn)?;
        serde_json::from_value(value).map_err(|source| DecodeError::Row { index: 0, source })
    }

    fn key_part(&self) -> String {
        format!("scalar<{}>", type_name::<R>())
    }
}

/// A schema followed by a mapping function. See [`ResultSchema::map`].
pub struct Mapped<S, F, U> {
    inner: S,
    f: Rc<F>,
    id: u64,
    _marker: PhantomData<fn() -> U>,
}

impl<S, F, U> ResultSchema for Mapped<S, F, U>
where
    S: ResultSchema,
    F: Fn(S::Output) -> U + 'static,
    U: PartialEq + 'static,
{
    type Output = U;

    fn decode(&self, rows: Vec<Row>) -> Result<U, DecodeError> {
        self.inner.decode(rows).map(|value| (self.f)(value))
    }

    // Closures cannot be compared, so every mapping is its own key
    fn key_part(&self) -> String {
        format!("{}.map#{}", self.inner.key_part(), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Issue {
        id: i64,
        title: String,
    }

    fn rows(values: Vec<JsonValue>) -> Vec<Row> {
        values
            .into_iter()
            .map(|value| match value {
                JsonValue::Object(row) => row,
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn decodes_all_rows() {
        let decoded = Rows::<Issue>::new()
            .decode(rows(vec![
                json!({ "id": 1, "title": "a" }),
                json!({ "id": 2, "title": "b" }),
            ]))
            .unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].title, "b");
    }

    #[test]
    fn reports_the_failing_row() {
        let err = Rows::<Issue>::new()
            .decode(rows(vec![
                json!({ "id": 1, "title": "a" }),
                json!({ "id": "x", "title": "b" }),
            ]))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Row { index: 1, .. }));
    }

    #[test]
    fn first_row_and_scalar() {
        let issue = FirstRow::<Issue>::new()
            .decode(rows(vec![json!({ "id": 1, "title": "a" })]))
            .unwrap();
        assert_eq!(issue.id, 1);
        assert!(matches!(
            FirstRow::<Issue>::new().decode(Vec::new()),
            Err(DecodeError::MissingRow)
        ));

        let count = Scalar::<i64>::new().decode(rows(vec![json!({ "n": 3 })])).unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn mapped_schemas_have_distinct_keys() {
        let a = Scalar::<i64>::new().map(|n| n * 2);
        let b = Scalar::<i64>::new().map(|n| n * 2);
        assert_ne!(a.key_part(), b.key_part());
        assert_eq!(a.decode(rows(vec![json!({ "n": 4 })])).unwrap(), 8);
    }
}
