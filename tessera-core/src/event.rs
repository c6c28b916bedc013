//! Events and the Event Log
//!
//! Events are immutable, named records with JSON args. Application code
//! creates [`PartialEvent`]s through [`EventDef::make`](crate::schema::EventDef::make);
//! the store sequences them into [`Event`]s when they are committed and
//! appends them to an [`EventLog`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EventLogError;
use crate::materialize::MaterializerHash;

/// Position of an event in the log.
///
/// `global` orders events across all clients. `client` numbers events a
/// client created on top of the same global position before they were
/// confirmed; confirmed events have `client == 0`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EventSequenceNumber {
    pub global: u64,
    pub client: u32,
}

impl EventSequenceNumber {
    /// Position before the first event.
    pub const ROOT: Self = Self { global: 0, client: 0 };

    pub fn new(global: u64, client: u32) -> Self {
        Self { global, client }
    }

    pub fn next_global(self) -> Self {
        Self {
            global: self.global + 1,
            client: 0,
        }
    }

    pub fn next_client(self) -> Self {
        Self {
            global: self.global,
            client: self.client + 1,
        }
    }
}

impl fmt::Display for EventSequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.client == 0 {
            write!(f, "e{}", self.global)
        } else {
            write!(f, "e{}+{}", self.global, self.client)
        }
    }
}

/// An event that has not been sequenced yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialEvent {
    pub name: String,
    pub args: serde_json::Value,
}

impl PartialEvent {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// A committed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub args: serde_json::Value,
    pub seq_num: EventSequenceNumber,
    pub client_id: String,
    pub session_id: String,
    /// Hash of the statements the originating client materialized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materializer_hash: Option<MaterializerHash>,
}

impl Event {
    pub fn decode_args<A: DeserializeOwned>(&self) -> Result<A, serde_json::Error> {
        A::deserialize(&self.args)
    }

    pub fn partial(&self) -> PartialEvent {
        PartialEvent::new(self.name.clone(), self.args.clone())
    }
}

/// Durable storage for committed events.
pub trait EventLog {
    /// Append events in order. Called inside the commit transaction.
    fn append(&mut self, events: &[Event]) -> Result<(), EventLogError>;

    /// Sequence number of the last appended event.
    fn head(&self) -> EventSequenceNumber;

    /// All events in log order.
    fn events(&self) -> Result<Vec<Event>, EventLogError>;
}

/// In-memory event log. Clones share the same events.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log pre-filled with `events`, e.g. to simulate a restart.
    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            events: Arc::new(Mutex::new(events)),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl EventLog for MemoryEventLog {
    fn append(&mut self, events: &[Event]) -> Result<(), EventLogError> {
        let mut log = self.events.lock();
        if let (Some(last), Some(first)) = (log.last(), events.first()) {
            if first.seq_num <= last.seq_num {
                return Err(EventLogError::new(format!(
                    "event {} does not follow head {}",
                    first.seq_num, last.seq_num
                )));
            }
        }
        log.extend_from_slice(events);
        Ok(())
    }

    fn head(&self) -> EventSequenceNumber {
        self.events
            .lock()
            .last()
            .map_or(EventSequenceNumber::ROOT, |event| event.seq_num)
    }

    fn events(&self) -> Result<Vec<Event>, EventLogError> {
        Ok(self.snapshot())
    }
}
