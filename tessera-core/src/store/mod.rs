//! Store
//!
//! The [`Store`] ties the pieces together: a SQL read model derived from an
//! event log, a reactive graph over it, and live queries on top.
//!
//! # How It Works
//!
//! 1. `build` creates the schema's tables, registers one table ref per table
//!    and replays the event log into the read model.
//!
//! 2. `commit` sequences events, materializes them in one transaction,
//!    appends them to the log and writes the table refs of every table the
//!    batch touched, in one batch.
//!
//! 3. Queries read the table refs of the tables they select from, so a
//!    commit dirties exactly the queries that depend on what it wrote.
//!    Subscriptions are effects over a query and run their callback whenever
//!    the query's result actually changes.
//!
//! 4. A materialization failure shuts the store down: the read model may no
//!    longer match the log, so further commits and subscriptions are
//!    refused. The cause is published on [`Store::shutdown_signal`].
//!
//! The store is single-threaded. Async tasks reach it through the
//! [`InboxSender`].

mod commit;
mod config;
mod inbox;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexSet;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{GraphError, MaterializeError, StoreError};
use crate::event::{Event, EventLog, EventSequenceNumber, MemoryEventLog, PartialEvent};
use crate::query::{LiveQueryDef, QueryAtom, QueryContext};
use crate::reactive::{
    AtomOptions, Effect, EffectsWrapper, GraphObserver, RecentRefreshes, RefUpdate, Runtime, TracingObserver,
};
use crate::read_model::ReadModel;
use crate::schema::Schema;
use crate::sql::{Row, SqlEngine, SqlValue, SqliteEngine};

use commit::{Origin, Pipeline};

pub use config::StoreConfig;
pub use inbox::{InboxClosed, InboxSender};

use inbox::Inbox;

/// Options for one commit.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Apply the events but leave the table refs alone. The tables are
    /// remembered and written by the next [`Store::manual_refresh`].
    pub skip_refresh: bool,
    pub label: Option<String>,
}

impl CommitOptions {
    pub fn skip_refresh() -> Self {
        Self {
            skip_refresh: true,
            label: None,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// What a commit applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommitReport {
    pub seq_nums: Vec<EventSequenceNumber>,
    /// Tables written by the batch, in first-write order.
    pub write_tables: Vec<String>,
    /// Whether dependent queries were refreshed.
    pub refreshed: bool,
}

/// Events collected by [`Store::commit_batch`].
#[derive(Debug, Default)]
pub struct CommitBatch {
    events: Vec<PartialEvent>,
}

impl CommitBatch {
    pub fn push(&mut self, event: PartialEvent) -> &mut Self {
        self.events.push(event);
        self
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = PartialEvent>) -> &mut Self {
        self.events.extend(events);
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Options for [`Store::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Do not call the callback for the current value, only for changes.
    pub skip_initial_run: bool,
    pub label: Option<String>,
}

/// A point-in-time summary of the store, e.g. for devtools.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStatus {
    pub store_id: String,
    pub head: EventSequenceNumber,
    pub tables: Vec<String>,
    pub live_queries: usize,
    pub graph_nodes: usize,
    /// Tables written by `skip_refresh` commits and not refreshed yet.
    pub pending_refresh: Vec<String>,
    pub shutdown: Option<String>,
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    runtime: Runtime,
    effect: Effect,
    query: Option<Box<dyn Any>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }

    pub fn effect(&self) -> Effect {
        self.effect
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Detach the effect first so the query loses its last reader
        self.runtime.destroy(self.effect.id());
        drop(self.query.take());
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("effect", &self.effect).finish()
    }
}

/// Builder for a [`Store`].
pub struct StoreBuilder {
    schema: Schema,
    engine: Box<dyn SqlEngine>,
    config: StoreConfig,
    event_log: Option<Box<dyn EventLog>>,
    effects_wrapper: Option<EffectsWrapper>,
    observer: Option<Rc<dyn GraphObserver>>,
}

impl StoreBuilder {
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Log to append committed events to and replay at startup.
    /// Defaults to a fresh [`MemoryEventLog`].
    pub fn event_log(mut self, log: impl EventLog + 'static) -> Self {
        self.event_log = Some(Box::new(log));
        self
    }

    /// Hook wrapping every batch of subscription callbacks.
    pub fn effects_wrapper(mut self, wrapper: impl Fn(&mut dyn FnMut()) + 'static) -> Self {
        self.effects_wrapper = Some(Rc::new(wrapper));
        self
    }

    /// Additional graph observer. Refreshes are always traced and recorded
    /// in [`Store::recent_refreshes`].
    pub fn observer(mut self, observer: impl GraphObserver + 'static) -> Self {
        self.observer = Some(Rc::new(observer));
        self
    }

    pub fn build(self) -> Result<Store, StoreError> {
        let StoreBuilder {
            schema,
            engine,
            config,
            event_log,
            effects_wrapper,
            observer,
        } = self;
        config.validate()?;

        let span = tracing::info_span!("store_boot", store_id = %config.store_id);
        let _enter = span.enter();

        let recent = RecentRefreshes::new(config.recent_refreshes_capacity);
        let mut runtime = Runtime::builder();
        runtime = match observer {
            Some(extra) => runtime.observer(((TracingObserver, recent.clone()), extra)),
            None => runtime.observer((TracingObserver, recent.clone())),
        };
        if let Some(wrapper) = effects_wrapper {
            runtime = runtime.effects_wrapper(move |run: &mut dyn FnMut()| wrapper(run));
        }
        let runtime = runtime.build();

        let read_model = Rc::new(ReadModel::new(&runtime, engine, &schema)?);
        let event_log = event_log.unwrap_or_else(|| Box::new(MemoryEventLog::new()));

        let mut replayed = event_log.events()?;
        if !replayed.is_empty() {
            let pipeline = Pipeline {
                read_model: &read_model,
                schema: &schema,
                verify_hashes: config.verify_materializer_hashes,
            };
            pipeline
                .apply(&mut replayed, Origin::Replay, None)
                .map_err(|err| StoreError::Materialize(Arc::new(err)))?;
        }

        let ctx = QueryContext::new(runtime.clone(), Rc::clone(&read_model));
        let (inbox_sender, inbox) = Inbox::channel(config.inbox_capacity);
        let (shutdown, _) = watch::channel(None);

        tracing::info!(
            tables = read_model.table_names().count(),
            replayed = replayed.len(),
            head = %event_log.head(),
            "store ready"
        );

        Ok(Store {
            config,
            schema,
            runtime,
            ctx,
            read_model,
            event_log: RefCell::new(event_log),
            pending_refresh: RefCell::new(IndexSet::new()),
            committing: Cell::new(false),
            shutdown,
            inbox,
            inbox_sender,
            recent,
        })
    }
}

/// Marks a commit in progress for as long as it lives.
struct CommitGuard<'a>(&'a Cell<bool>);

impl<'a> CommitGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Result<Self, StoreError> {
        if flag.replace(true) {
            return Err(StoreError::ReentrantCommit);
        }
        Ok(Self(flag))
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// An event-sourced SQL store with live queries.
pub struct Store {
    config: StoreConfig,
    schema: Schema,
    runtime: Runtime,
    ctx: QueryContext,
    read_model: Rc<ReadModel>,
    event_log: RefCell<Box<dyn EventLog>>,
    pending_refresh: RefCell<IndexSet<String>>,
    committing: Cell<bool>,
    shutdown: watch::Sender<Option<Arc<MaterializeError>>>,
    inbox: Inbox,
    inbox_sender: InboxSender,
    recent: RecentRefreshes,
}

impl Store {
    pub fn builder(schema: Schema, engine: impl SqlEngine + 'static) -> StoreBuilder {
        StoreBuilder {
            schema,
            engine: Box::new(engine),
            config: StoreConfig::default(),
            event_log: None,
            effects_wrapper: None,
            observer: None,
        }
    }

    /// A store over an in-memory SQLite database with default settings.
    pub fn in_memory(schema: Schema) -> Result<Store, StoreError> {
        Self::builder(schema, SqliteEngine::open_in_memory()?).build()
    }

    // ------------------------------------------------------------------
    // Commits
    // ------------------------------------------------------------------

    pub fn commit(&self, events: impl IntoIterator<Item = PartialEvent>) -> Result<CommitReport, StoreError> {
        self.commit_with_options(CommitOptions::default(), events)
    }

    /// Commit `events` atomically: either all of them are applied and logged,
    /// or none are.
    pub fn commit_with_options(
        &self,
        options: CommitOptions,
        events: impl IntoIterator<Item = PartialEvent>,
    ) -> Result<CommitReport, StoreError> {
        self.ensure_running()?;
        let _guard = CommitGuard::enter(&self.committing)?;

        let partials: Vec<PartialEvent> = events.into_iter().collect();
        if partials.is_empty() {
            return Ok(CommitReport::default());
        }

        let span = tracing::info_span!(
            "commit",
            events = partials.len(),
            label = options.label.as_deref().unwrap_or("")
        );
        let _enter = span.enter();

        let mut seq_num = self.event_log.borrow().head();
        let mut events: Vec<Event> = partials
            .into_iter()
            .map(|partial| {
                seq_num = seq_num.next_global();
                Event {
                    name: partial.name,
                    args: partial.args,
                    seq_num,
                    client_id: self.config.client_id.clone(),
                    session_id: self.config.session_id.clone(),
                    materializer_hash: None,
                }
            })
            .collect();

        self.apply(&mut events, Origin::Local, options.skip_refresh)
    }

    /// Collect events with `f` and commit them as one batch.
    pub fn commit_batch(
        &self,
        options: CommitOptions,
        f: impl FnOnce(&mut CommitBatch),
    ) -> Result<CommitReport, StoreError> {
        let mut batch = CommitBatch::default();
        f(&mut batch);
        self.commit_with_options(options, batch.events)
    }

    /// Apply events committed elsewhere. Events at or before the log head
    /// were already applied and are skipped.
    pub fn apply_pulled(&self, events: Vec<Event>) -> Result<CommitReport, StoreError> {
        self.ensure_running()?;
        let _guard = CommitGuard::enter(&self.committing)?;

        let mut head = self.event_log.borrow().head();
        let mut events: Vec<Event> = events
            .into_iter()
            .filter(|event| {
                let fresh = event.seq_num > head;
                if fresh {
                    head = event.seq_num;
                }
                fresh
            })
            .collect();
        if events.is_empty() {
            return Ok(CommitReport::default());
        }

        let span = tracing::info_span!("apply_pulled", events = events.len());
        let _enter = span.enter();
        self.apply(&mut events, Origin::Pulled, false)
    }

    fn apply(&self, events: &mut [Event], origin: Origin, skip_refresh: bool) -> Result<CommitReport, StoreError> {
        let pipeline = Pipeline {
            read_model: &self.read_model,
            schema: &self.schema,
            verify_hashes: self.config.verify_materializer_hashes,
        };
        let tables = {
            let mut log = self.event_log.borrow_mut();
            pipeline.apply(events, origin, Some(&mut **log))
        };
        let tables = match tables {
            Ok(tables) => tables,
            Err(err) => return Err(self.shut_down(err)),
        };

        let report = CommitReport {
            seq_nums: events.iter().map(|event| event.seq_num).collect(),
            write_tables: tables.iter().cloned().collect(),
            refreshed: !skip_refresh,
        };

        if skip_refresh {
            tracing::debug!(tables = tables.len(), "refresh deferred");
            self.pending_refresh.borrow_mut().extend(tables);
        } else if let Err(source) = self.refresh_tables(tables) {
            tracing::warn!(error = %source, "commit applied, refresh failed");
            return Err(StoreError::Refresh {
                report: Box::new(report),
                source,
            });
        }
        Ok(report)
    }

    /// Write the table refs of `tables` in one batch. Effects run before this
    /// returns; the first failing one is reported.
    fn refresh_tables(&self, tables: IndexSet<String>) -> Result<(), GraphError> {
        let updates: Vec<RefUpdate> = tables
            .iter()
            .filter_map(|table| self.read_model.table_ref(table))
            .map(|table_ref| RefUpdate::new(&table_ref, ()))
            .collect();
        if updates.is_empty() {
            return Ok(());
        }
        self.runtime.set_refs(updates)?;
        Ok(())
    }

    /// Refresh everything written by `skip_refresh` commits since the last
    /// refresh.
    pub fn manual_refresh(&self) -> Result<(), StoreError> {
        let _guard = CommitGuard::enter(&self.committing)?;
        let tables = std::mem::take(&mut *self.pending_refresh.borrow_mut());
        tracing::debug!(tables = tables.len(), "manual refresh");
        Ok(self.refresh_tables(tables)?)
    }

    fn ensure_running(&self) -> Result<(), StoreError> {
        match &*self.shutdown.borrow() {
            Some(cause) => Err(StoreError::Shutdown {
                cause: Arc::clone(cause),
            }),
            None => Ok(()),
        }
    }

    fn shut_down(&self, err: MaterializeError) -> StoreError {
        let cause = Arc::new(err);
        tracing::error!(
            store_id = %self.config.store_id,
            error = %cause,
            hash_mismatch = cause.is_hash_mismatch(),
            "materialization failed, shutting down"
        );
        self.shutdown.send_replace(Some(Arc::clone(&cause)));
        StoreError::Materialize(cause)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Evaluate `def` once without subscribing.
    ///
    /// Reuses the live node when the query is already subscribed.
    pub fn query<T: 'static>(&self, def: &LiveQueryDef<T>) -> Result<Rc<T>, StoreError> {
        let live = self.ctx.make(def);
        let value = self.runtime.compute(&*live)?;
        Ok(value)
    }

    /// Run `on_update` with the query's value now and after every commit
    /// that changes it.
    pub fn subscribe<T, F>(
        &self,
        def: &LiveQueryDef<T>,
        on_update: F,
        options: SubscribeOptions,
    ) -> Result<Subscription, StoreError>
    where
        T: 'static,
        F: FnMut(&T) + 'static,
    {
        self.ensure_running()?;

        let query = self.ctx.make(def);
        let live = query.live();
        let skip_next = Cell::new(options.skip_initial_run);
        let on_update = RefCell::new(on_update);
        let label = options
            .label
            .unwrap_or_else(|| format!("subscribe:{}", def.label()));

        let effect = self.runtime.make_effect(
            move |tracker| {
                let value = tracker.get(&live)?;
                if !skip_next.replace(false) {
                    let mut on_update = on_update.borrow_mut();
                    (*on_update)(&*value);
                }
                Ok(())
            },
            AtomOptions::new().label(label),
        );

        let subscription = Subscription {
            runtime: self.runtime.clone(),
            effect,
            query: Some(Box::new(query)),
        };
        // A failed first run drops the subscription and detaches everything
        self.runtime.run_effect(&effect)?;
        Ok(subscription)
    }

    /// Set the value of a signal. Dependents refresh immediately.
    pub fn set_signal<T>(&self, def: &LiveQueryDef<T>, value: T) -> Result<(), StoreError>
    where
        T: Clone + 'static,
    {
        let Some(seed) = def.seed() else {
            return Err(StoreError::NotASignal {
                label: def.label().to_string(),
            });
        };
        *seed.borrow_mut() = value.clone();
        if let Some(QueryAtom::Ref(signal)) = self.ctx.live_atom(def) {
            self.runtime.set_ref(&signal, value)?;
        }
        Ok(())
    }

    /// Raw one-shot select against the read model. Not tracked.
    pub fn select(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        Ok(self.read_model.select(sql, params)?)
    }

    // ------------------------------------------------------------------
    // Inbox
    // ------------------------------------------------------------------

    pub fn inbox_sender(&self) -> InboxSender {
        self.inbox_sender.clone()
    }

    /// Apply the pulled batches waiting in the inbox, one result per batch.
    ///
    /// A failed batch does not discard the ones after it: they are still
    /// applied, unless the failure shut the store down, in which case they
    /// stay queued.
    pub fn drain_inbox(&self) -> Result<Vec<Result<CommitReport, StoreError>>, StoreError> {
        // Refuse before taking anything off the queue
        self.ensure_running()?;
        if self.committing.get() {
            return Err(StoreError::ReentrantCommit);
        }

        let mut results = Vec::new();
        while let Some(batch) = self.inbox.try_next() {
            let result = self.apply_pulled(batch);
            let fatal = matches!(&result, Err(err) if err.is_fatal());
            results.push(result);
            if fatal {
                break;
            }
        }
        Ok(results)
    }

    /// Wait for the next pulled batch and apply it.
    pub async fn recv_inbox(&self) -> Result<CommitReport, StoreError> {
        self.ensure_running()?;
        if self.committing.get() {
            return Err(StoreError::ReentrantCommit);
        }
        match self.inbox.recv().await {
            Some(batch) => self.apply_pulled(batch),
            // The store holds a sender, so the channel outlives every wait
            None => Ok(CommitReport::default()),
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Receives the fatal cause once the store shuts down.
    pub fn shutdown_signal(&self) -> watch::Receiver<Option<Arc<MaterializeError>>> {
        self.shutdown.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.borrow().is_some()
    }

    pub fn status(&self) -> StoreStatus {
        StoreStatus {
            store_id: self.config.store_id.clone(),
            head: self.event_log.borrow().head(),
            tables: self.read_model.table_names().map(str::to_string).collect(),
            live_queries: self.ctx.live_count(),
            graph_nodes: self.runtime.node_count(),
            pending_refresh: self.pending_refresh.borrow().iter().cloned().collect(),
            shutdown: self.shutdown.borrow().as_ref().map(|cause| cause.to_string()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn context(&self) -> &QueryContext {
        &self.ctx
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn recent_refreshes(&self) -> &RecentRefreshes {
        &self.recent
    }

    /// Events in the log, oldest first.
    pub fn events(&self) -> Result<Vec<Event>, StoreError> {
        Ok(self.event_log.borrow().events()?)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("store_id", &self.config.store_id)
            .field("live_queries", &self.ctx.live_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
