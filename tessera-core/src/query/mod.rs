//! Live Queries
//!
//! A [`LiveQueryDef`] describes a query without running it. It is cheap to
//! create and clone, and identified by a [`QueryKey`]. Resolving it in a
//! [`QueryContext`] yields an [`RcRef`] to a shared live graph node:
//!
//! - [`query_db`]: a SQL select over the read model. Its thunk reads the
//!   table ref of every table the SQL uses, runs the select and decodes the
//!   rows with a [`ResultSchema`].
//! - [`query_db_fn`]: the same, with SQL derived from other live state.
//! - [`computed`]: a derived value over other live queries.
//! - [`signal`]: a settable value.
//!
//! Definitions with the same key share one node, so many call sites can
//! declare the same query without running its SQL more than once.

mod rc;
mod schema;

use std::any::{type_name, Any};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::GraphError;
use crate::graph::AtomId;
use crate::reactive::{Atom, AtomOptions, Ref, Thunk, Tracker};
use crate::sql::SqlValue;

pub use rc::{QueryContext, RcRef};
pub(crate) use rc::WeakQueryContext;
pub use schema::{FirstRow, Mapped, ResultSchema, Rows, Scalar};

static DEF_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_def_id() -> u64 {
    DEF_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Structural hash identifying a query definition.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryKey([u8; 32]);

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({self})")
    }
}

/// Length-prefixed fields hashed into a [`QueryKey`].
struct KeyHasher(blake3::Hasher);

impl KeyHasher {
    fn new(kind: &str) -> Self {
        let mut hasher = Self(blake3::Hasher::new());
        hasher.field(kind.as_bytes());
        hasher
    }

    fn field(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    fn value(&mut self, value: &SqlValue) -> &mut Self {
        match value {
            SqlValue::Null => self.field(b"n"),
            SqlValue::Integer(v) => self.field(b"i").field(&v.to_le_bytes()),
            SqlValue::Real(v) => self.field(b"r").field(&v.to_bits().to_le_bytes()),
            SqlValue::Text(v) => self.field(b"t").field(v.as_bytes()),
            SqlValue::Blob(v) => self.field(b"b").field(v),
        }
    }

    fn finish(&self) -> QueryKey {
        QueryKey(*self.0.finalize().as_bytes())
    }
}

/// What kind of node a definition creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Db,
    Computed,
    Signal,
}

/// The graph node behind a live query.
pub enum QueryAtom<T> {
    Ref(Ref<T>),
    Thunk(Thunk<T>),
}

impl<T> Atom<T> for QueryAtom<T> {
    fn id(&self) -> AtomId {
        match self {
            QueryAtom::Ref(r) => r.id(),
            QueryAtom::Thunk(t) => t.id(),
        }
    }
}

impl<T> Clone for QueryAtom<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for QueryAtom<T> {}

impl<T> fmt::Debug for QueryAtom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryAtom::Ref(r) => fmt::Debug::fmt(r, f),
            QueryAtom::Thunk(t) => fmt::Debug::fmt(t, f),
        }
    }
}

/// A resolved live query. Read it through a tracker or
/// [`Runtime::compute`](crate::reactive::Runtime::compute).
pub struct LiveQuery<T> {
    atom: QueryAtom<T>,
    key: QueryKey,
}

impl<T> LiveQuery<T> {
    pub fn atom(&self) -> QueryAtom<T> {
        self.atom
    }

    pub fn key(&self) -> QueryKey {
        self.key
    }
}

impl<T> Atom<T> for LiveQuery<T> {
    fn id(&self) -> AtomId {
        self.atom.id()
    }
}

impl<T> Clone for LiveQuery<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for LiveQuery<T> {}

impl<T> fmt::Debug for LiveQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("key", &self.key)
            .field("atom", &self.atom)
            .finish()
    }
}

/// SQL text, bind values and optionally the tables it reads.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryInput {
    pub sql: String,
    pub bind_values: Vec<SqlValue>,
    /// Tables read. When `None`, they are derived from the SQL text.
    pub tables: Option<Vec<String>>,
}

impl QueryInput {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bind_values: Vec::new(),
            tables: None,
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.bind_values.push(value.into());
        self
    }

    pub fn tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = Some(tables.into_iter().map(Into::into).collect());
        self
    }
}

impl From<&str> for QueryInput {
    fn from(sql: &str) -> Self {
        QueryInput::new(sql)
    }
}

/// Reads available to computed queries and dynamic query inputs.
///
/// Live queries read through [`query`](Self::query) stay alive for as long
/// as the reading node depends on them.
pub struct QueryGet<'t, 'a> {
    tracker: &'t mut Tracker<'a>,
    ctx: &'t QueryContext,
    held: Vec<Box<dyn Any>>,
}

impl QueryGet<'_, '_> {
    /// Read any atom.
    pub fn get<T: 'static>(&mut self, atom: &impl Atom<T>) -> Result<Rc<T>, GraphError> {
        self.tracker.get(atom)
    }

    /// Read another live query.
    pub fn query<T: 'static>(&mut self, def: &LiveQueryDef<T>) -> Result<Rc<T>, GraphError> {
        let live = self.ctx.make(def);
        let value = self.tracker.get(&*live);
        self.held.push(Box::new(live));
        value
    }
}

type HeldRefs = Rc<RefCell<Vec<Box<dyn Any>>>>;

/// Run `f` with a [`QueryGet`], then swap the live queries it read into
/// `held`. On failure the previous ones are kept too.
fn with_held<R>(
    ctx: &QueryContext,
    tracker: &mut Tracker<'_>,
    held: &HeldRefs,
    f: impl FnOnce(&mut QueryGet<'_, '_>) -> Result<R, GraphError>,
) -> Result<R, GraphError> {
    let mut get = QueryGet {
        tracker,
        ctx,
        held: Vec::new(),
    };
    let result = f(&mut get);
    let fresh = get.held;
    let stale = match &result {
        Ok(_) => std::mem::replace(&mut *held.borrow_mut(), fresh),
        Err(_) => {
            held.borrow_mut().extend(fresh);
            Vec::new()
        }
    };
    // References no longer read are released outside the borrow
    drop(stale);
    result
}

fn upgrade(ctx: &WeakQueryContext, label: &str) -> Result<QueryContext, GraphError> {
    ctx.upgrade()
        .ok_or_else(|| GraphError::computation(label, "query context was dropped"))
}

type CreateFn<T> = dyn Fn(&QueryContext, &str) -> QueryAtom<T>;
type InputFn = dyn Fn(&mut QueryGet<'_, '_>) -> Result<QueryInput, GraphError>;

enum QuerySource {
    Static(QueryInput),
    Dynamic(Rc<InputFn>),
}

/// A query definition. Resolve it with [`make`](Self::make).
pub struct LiveQueryDef<T> {
    base: QueryKey,
    key: QueryKey,
    label: String,
    kind: QueryKind,
    create: Rc<CreateFn<T>>,
    seed: Option<Rc<RefCell<T>>>,
}

impl<T: 'static> LiveQueryDef<T> {
    fn new(base: QueryKey, unique: bool, label: String, kind: QueryKind, create: Rc<CreateFn<T>>) -> Self {
        let key = if unique {
            let mut hasher = KeyHasher::new("unique");
            hasher.field(&base.0).field(&next_def_id().to_le_bytes());
            hasher.finish()
        } else {
            base
        };
        Self {
            base,
            key,
            label,
            kind,
            create,
            seed: None,
        }
    }

    pub fn key(&self) -> QueryKey {
        self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    /// Label used for the node in errors, logs and devtools. Does not change the key.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Key the definition by `deps` instead of its identity, so that
    /// separately created definitions with equal deps share a node.
    pub fn with_deps(mut self, deps: &str) -> Self {
        let mut hasher = KeyHasher::new("deps");
        hasher.field(&self.base.0).field(deps.as_bytes());
        self.key = hasher.finish();
        self
    }

    pub fn make(&self, ctx: &QueryContext) -> RcRef<T> {
        ctx.make(self)
    }

    pub(crate) fn create(&self, ctx: &QueryContext) -> QueryAtom<T> {
        (self.create)(ctx, &self.label)
    }

    pub(crate) fn seed(&self) -> Option<&Rc<RefCell<T>>> {
        self.seed.as_ref()
    }
}

impl<T> Clone for LiveQueryDef<T> {
    fn clone(&self) -> Self {
        Self {
            base: self.base,
            key: self.key,
            label: self.label.clone(),
            kind: self.kind,
            create: Rc::clone(&self.create),
            seed: self.seed.clone(),
        }
    }
}

impl<T> fmt::Debug for LiveQueryDef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQueryDef")
            .field("key", &self.key)
            .field("label", &self.label)
            .field("kind", &self.kind)
            .finish()
    }
}

fn db_thunk<S: ResultSchema>(
    ctx: &QueryContext,
    label: &str,
    source: Rc<QuerySource>,
    schema: Rc<S>,
) -> QueryAtom<S::Output> {
    let weak = ctx.downgrade();
    let held = HeldRefs::default();
    let name = label.to_string();
    let meta = match &*source {
        QuerySource::Static(input) => serde_json::json!({ "kind": "db", "sql": input.sql }),
        QuerySource::Dynamic(_) => serde_json::json!({ "kind": "db" }),
    };

    let thunk = ctx.runtime().make_thunk(
        move |tracker| {
            let ctx = upgrade(&weak, &name)?;
            let input = match &*source {
                QuerySource::Static(input) => input.clone(),
                QuerySource::Dynamic(f) => with_held(&ctx, tracker, &held, |get| f(get))?,
            };

            let read_model = ctx.read_model();
            let tables = read_model
                .resolve_tables(&input.sql, input.tables.as_deref())
                .map_err(|err| GraphError::computation(name.as_str(), err))?;
            for table in &tables {
                tracker.get(table)?;
            }

            let rows = read_model
                .select(&input.sql, &input.bind_values)
                .map_err(|err| GraphError::computation(name.as_str(), err))?;
            tracing::trace!(query = %name, rows = rows.len(), "query executed");
            schema
                .decode(rows)
                .map_err(|err| GraphError::computation(name.as_str(), err))
        },
        AtomOptions::new().label(label).structural_eq().meta(meta),
    );
    QueryAtom::Thunk(thunk)
}

/// A SQL query over the read model.
///
/// Equal SQL, bind values, tables and result schema share one live node.
pub fn query_db<S: ResultSchema>(input: impl Into<QueryInput>, schema: S) -> LiveQueryDef<S::Output> {
    let input = input.into();
    let mut hasher = KeyHasher::new("db");
    hasher.field(input.sql.as_bytes());
    for value in &input.bind_values {
        hasher.value(value);
    }
    if let Some(tables) = &input.tables {
        for table in tables {
            hasher.field(table.to_lowercase().as_bytes());
        }
    }
    hasher
        .field(schema.key_part().as_bytes())
        .field(type_name::<S::Output>().as_bytes());

    let label = input.sql.clone();
    let source = Rc::new(QuerySource::Static(input));
    let schema = Rc::new(schema);
    LiveQueryDef::new(
        hasher.finish(),
        false,
        label,
        QueryKind::Db,
        Rc::new(move |ctx: &QueryContext, label: &str| {
            db_thunk(ctx, label, Rc::clone(&source), Rc::clone(&schema))
        }),
    )
}

/// A SQL query whose input is derived from other live state.
///
/// Each definition is distinct unless keyed with
/// [`with_deps`](LiveQueryDef::with_deps).
pub fn query_db_fn<S, F>(input: F, schema: S) -> LiveQueryDef<S::Output>
where
    S: ResultSchema,
    F: Fn(&mut QueryGet<'_, '_>) -> Result<QueryInput, GraphError> + 'static,
{
    let mut hasher = KeyHasher::new("db_fn");
    hasher
        .field(schema.key_part().as_bytes())
        .field(type_name::<S::Output>().as_bytes());

    let source = Rc::new(QuerySource::Dynamic(Rc::new(input)));
    let schema = Rc::new(schema);
    LiveQueryDef::new(
        hasher.finish(),
        true,
        "db_fn".to_string(),
        QueryKind::Db,
        Rc::new(move |ctx: &QueryContext, label: &str| {
            db_thunk(ctx, label, Rc::clone(&source), Rc::clone(&schema))
        }),
    )
}

/// A value derived from other live queries and atoms.
pub fn computed<T, F>(compute: F) -> LiveQueryDef<T>
where
    T: PartialEq + 'static,
    F: Fn(&mut QueryGet<'_, '_>) -> Result<T, GraphError> + 'static,
{
    let mut hasher = KeyHasher::new("computed");
    hasher.field(type_name::<T>().as_bytes());

    let compute = Rc::new(compute);
    LiveQueryDef::new(
        hasher.finish(),
        true,
        "computed".to_string(),
        QueryKind::Computed,
        Rc::new(move |ctx: &QueryContext, label: &str| {
            let weak = ctx.downgrade();
            let held = HeldRefs::default();
            let name = label.to_string();
            let compute = Rc::clone(&compute);
            let thunk = ctx.runtime().make_thunk(
                move |tracker| {
                    let ctx = upgrade(&weak, &name)?;
                    with_held(&ctx, tracker, &held, |get| compute(get))
                },
                AtomOptions::new()
                    .label(label)
                    .structural_eq()
                    .meta(serde_json::json!({ "kind": "computed" })),
            );
            QueryAtom::Thunk(thunk)
        }),
    )
}

/// A settable value, written with [`Store::set_signal`](crate::store::Store::set_signal).
///
/// While the signal is not live, writes update the value it starts from.
pub fn signal<T>(initial: T) -> LiveQueryDef<T>
where
    T: Clone + PartialEq + 'static,
{
    let mut hasher = KeyHasher::new("signal");
    hasher.field(type_name::<T>().as_bytes());

    let seed = Rc::new(RefCell::new(initial));
    let create_seed = Rc::clone(&seed);
    let mut def = LiveQueryDef::new(
        hasher.finish(),
        true,
        "signal".to_string(),
        QueryKind::Signal,
        Rc::new(move |ctx: &QueryContext, label: &str| {
            let value = create_seed.borrow().clone();
            let atom = ctx.runtime().make_ref(
                value,
                AtomOptions::new()
                    .label(label)
                    .structural_eq()
                    .meta(serde_json::json!({ "kind": "signal" })),
            );
            QueryAtom::Ref(atom)
        }),
    );
    def.seed = Some(seed);
    def
}
