//! Client struct definition
//!
//! A connected, logged-in user: identity, transport, current room and the
//! bounded outbound mailbox drained by the connection's writer task.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::trace;

use crate::message::{Envelope, Rendered};
use crate::room::Room;
use crate::types::{ClientId, Transport};

/// Outcome of a non-blocking delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Message is queued for the writer
    Queued,
    /// Mailbox was full, message dropped
    Dropped,
    /// Client is disconnecting, message dropped
    Closed,
}

/// Bounded outbound queue
///
/// Producers never wait: when full, the newest message is dropped.
/// Closing it lets the writer task finish what is queued and stop.
#[derive(Debug)]
pub struct Mailbox {
    sender: Mutex<Option<mpsc::Sender<String>>>,
}

impl Mailbox {
    /// Create a mailbox and the receiver its writer task drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Enqueue without waiting
    pub fn push(&self, msg: String) -> Delivery {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Delivery::Closed;
        };
        match sender.try_send(msg) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Stop accepting messages; the receiver ends after the backlog
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Connected client
///
/// Rooms hold it weakly; the connection handler owns the only strong
/// reference for the lifetime of the connection.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    username: String,
    transport: Transport,
    mailbox: Mailbox,
    /// Room the client is in. Held while moving between rooms so the
    /// transition is observed as one step.
    room: Mutex<Option<Arc<Room>>>,
}

impl Client {
    /// Create a client and the receiver for its writer task
    pub fn new(
        username: String,
        transport: Transport,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (mailbox, rx) = Mailbox::channel(capacity);
        let client = Arc::new(Self {
            id: ClientId::new(),
            username,
            transport,
            mailbox,
            room: Mutex::new(None),
        });
        (client, rx)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Render for this client's transport and enqueue
    pub fn deliver(&self, envelope: &Envelope) -> Delivery {
        self.deliver_rendered(&Rendered::new(envelope))
    }

    /// Enqueue an already rendered envelope
    pub fn deliver_rendered(&self, rendered: &Rendered<'_>) -> Delivery {
        let Some(text) = rendered.for_transport(self.transport) else {
            return Delivery::Dropped;
        };
        let outcome = self.mailbox.push(text.to_string());
        if outcome == Delivery::Dropped {
            trace!("Mailbox full for {} ({}), message dropped", self.username, self.id);
        }
        outcome
    }

    /// Room the client is currently in
    pub fn current_room(&self) -> Option<Arc<Room>> {
        self.room_slot().clone()
    }

    pub(crate) fn room_slot(&self) -> MutexGuard<'_, Option<Arc<Room>>> {
        self.room.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close the mailbox so the writer task drains and exits
    pub fn close(&self) {
        self.mailbox.close();
    }
}
