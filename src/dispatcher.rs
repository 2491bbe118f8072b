//! # Dispatcher
//!
//! The only state shared between connection tasks and the host: an unbounded multi-producer,
//! single-consumer queue of [`Event`]s.
//!
//! Every connection task owns an [`EventSender`] clone. The host owns the [`Dispatcher`] and
//! empties it from its tick with [`Dispatcher::drain`], which never blocks. Events sent by one
//! connection are received in the order they were sent; events from different connections
//! interleave in enqueue order. No event is delivered twice, and none is lost while the
//! dispatcher is alive.
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::connection::Connection;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    fn next() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// One decoded text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The connection the message arrived on.
    pub connection: Connection,
    pub id: MessageId,
    /// The decoded text payload.
    pub data: String,
}

impl Message {
    /// Deserializes the message text as JSON.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.data)
    }
}

/// A connection lifecycle notification or a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The handshake succeeded and the connection is open.
    Open(Connection),
    /// A text message was received.
    Message(Message),
    /// A previously opened connection was closed.
    Close(Connection),
}

impl Event {
    /// The connection this event concerns.
    pub fn connection(&self) -> &Connection {
        match self {
            Self::Open(connection) | Self::Close(connection) => connection,
            Self::Message(message) => &message.connection,
        }
    }
}

/// Producer side of the queue, cloned into every connection task.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: UnboundedSender<Event>,
}

impl EventSender {
    /// Enqueues `event`. Returns `false` if the dispatcher no longer exists.
    pub fn send(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn open(&self, connection: &Connection) -> bool {
        self.send(Event::Open(connection.clone()))
    }

    /// Enqueues a message, assigning it a fresh [`MessageId`].
    pub fn message(&self, connection: &Connection, data: String) -> MessageId {
        let id = MessageId::next();
        self.send(Event::Message(Message {
            connection: connection.clone(),
            id,
            data,
        }));
        id
    }

    pub fn close(&self, connection: &Connection) -> bool {
        self.send(Event::Close(connection.clone()))
    }
}

/// Consumer side of the queue.
#[derive(Debug)]
pub struct Dispatcher {
    tx: UnboundedSender<Event>,
    rx: UnboundedReceiver<Event>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Returns a new producer handle for this queue.
    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Number of events currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Removes and returns every event queued at the time of the call, oldest first.
    ///
    /// Never blocks. Events enqueued while draining are left for the next call, so a busy
    /// producer cannot keep a tick from finishing.
    pub fn drain(&mut self) -> Vec<Event> {
        let queued = self.rx.len();
        let mut events = Vec::with_capacity(queued);

        while events.len() < queued {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        events
    }

    /// Waits up to `timeout` for the next event.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }
}
