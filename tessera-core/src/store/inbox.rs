//! Inbox
//!
//! Async tasks (sync pulls, background imports) run outside the store. They
//! hand finished batches of events to the store through an [`InboxSender`];
//! the store applies them on its own thread with
//! [`Store::drain_inbox`](super::Store::drain_inbox) or
//! [`Store::recv_inbox`](super::Store::recv_inbox). A batch is never applied
//! partially or interleaved with a commit.

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::event::Event;

/// The store was dropped; the batch was not delivered.
#[derive(Debug, Error)]
#[error("store inbox is closed")]
pub struct InboxClosed(pub Vec<Event>);

/// Sending half of a store's inbox. `Send`, cheap to clone.
#[derive(Debug, Clone)]
pub struct InboxSender {
    tx: mpsc::Sender<Vec<Event>>,
}

impl InboxSender {
    /// Deliver a batch, waiting while the inbox is full.
    pub async fn send(&self, events: Vec<Event>) -> Result<(), InboxClosed> {
        self.tx.send(events).await.map_err(|err| InboxClosed(err.0))
    }

    /// Deliver a batch without waiting. A full inbox hands the batch back.
    pub fn try_send(&self, events: Vec<Event>) -> Result<(), mpsc::error::TrySendError<Vec<Event>>> {
        self.tx.try_send(events)
    }
}

pub(crate) struct Inbox {
    rx: Mutex<mpsc::Receiver<Vec<Event>>>,
}

impl Inbox {
    pub(crate) fn channel(capacity: usize) -> (InboxSender, Inbox) {
        let (tx, rx) = mpsc::channel(capacity);
        (InboxSender { tx }, Inbox { rx: Mutex::new(rx) })
    }

    /// The next batch if one is ready now.
    ///
    /// `None` while a `recv` is waiting on the receiver.
    pub(crate) fn try_next(&self) -> Option<Vec<Event>> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    pub(crate) async fn recv(&self) -> Option<Vec<Event>> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batches_arrive_in_order() {
        let (sender, inbox) = Inbox::channel(4);
        sender.send(Vec::new()).await.unwrap();
        sender.try_send(Vec::new()).unwrap();

        assert!(inbox.try_next().is_some());
        assert!(inbox.try_next().is_some());
        assert!(inbox.try_next().is_none());
    }

    #[tokio::test]
    async fn full_inbox_hands_the_batch_back() {
        let (sender, inbox) = Inbox::channel(1);
        sender.try_send(Vec::new()).unwrap();
        assert!(sender.try_send(Vec::new()).is_err());

        assert!(inbox.recv().await.is_some());
        sender.try_send(Vec::new()).unwrap();
    }

    #[tokio::test]
    async fn closed_inbox_returns_the_batch() {
        let (sender, inbox) = Inbox::channel(1);
        drop(inbox);
        let err = sender.send(Vec::new()).await.unwrap_err();
        assert!(err.0.is_empty());
    }
}
