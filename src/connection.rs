//! Connection handle and send path.
//!
//! A [`Connection`] is a cheap cloneable handle onto a dedicated worker
//! task that owns all per-connection state (outgoing queue, reassembly
//! tables, reply bindings). The handle only assigns request numbers and
//! enqueues commands; every table mutation happens on the worker, so the
//! single-executor invariant holds by construction.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};

use crate::error::{BlipError, Result};
use crate::listener::ConnectionListener;
use crate::message::{Message, PendingReply};
use crate::transport::TransportLink;
use crate::worker::Worker;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one connection, stable for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a connection. Transitions out of `Open` are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting sends and delivering messages.
    Open = 0,
    /// Draining; no new sends are accepted.
    Closing = 1,
    /// Worker has exited and all tables are cleared.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

pub(crate) enum Command {
    Enqueue {
        message: Message,
        reply: Option<oneshot::Sender<Message>>,
    },
    SetListener(Box<dyn ConnectionListener>),
    Close,
}

pub(crate) struct ConnectionCore {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
    next_number: AtomicU32,
    state: AtomicU8,
}

impl ConnectionCore {
    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// One BLIP session over one transport.
#[derive(Clone)]
pub struct Connection {
    core: Arc<ConnectionCore>,
}

impl Connection {
    /// Open a connection over an attached transport and spawn its worker.
    ///
    /// Must be called inside a tokio runtime. The transport driver behind
    /// `transport` performs the actual socket I/O; see [`crate::transport`].
    pub fn open(transport: TransportLink, listener: impl ConnectionListener) -> Connection {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let core = Arc::new(ConnectionCore {
            id: ConnectionId::next(),
            commands,
            next_number: AtomicU32::new(1),
            state: AtomicU8::new(ConnectionState::Open as u8),
        });
        let connection = Connection { core };
        let worker = Worker::new(
            connection.clone(),
            command_rx,
            transport,
            Box::new(listener),
        );
        tokio::spawn(worker.run());
        connection
    }

    /// This connection's identity.
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.core.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.core.state.load(Ordering::Acquire))
    }

    /// Create a new mutable outgoing request.
    ///
    /// Numbers are assigned at creation, starting at 1, and are consumed
    /// even if the request is never sent.
    pub fn new_request(&self) -> Message {
        let number = self.core.next_number.fetch_add(1, Ordering::Relaxed);
        Message::outgoing(self.make_ref(), number)
    }

    /// Enqueue a message for sending, freezing it.
    ///
    /// Returns the [`PendingReply`] placeholder for requests that expect a
    /// reply, `None` for NOREPLY requests and for replies. Fails with
    /// [`BlipError::NotMine`] / [`BlipError::WrongOwner`] on foreign
    /// messages and [`BlipError::ConnectionClosed`] once closing has begun.
    pub fn send_message(&self, mut message: Message) -> Result<Option<PendingReply>> {
        if !message.is_mine() {
            return Err(BlipError::NotMine);
        }
        if message.connection_ref().id() != self.core.id {
            return Err(BlipError::WrongOwner);
        }
        if self.state() != ConnectionState::Open {
            return Err(BlipError::ConnectionClosed);
        }

        message.freeze();
        let wants_reply = message.is_request() && !message.is_no_reply();
        let (reply, pending) = if wants_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(PendingReply::new(message.number(), rx)))
        } else {
            (None, None)
        };

        self.core
            .commands
            .send(Command::Enqueue { message, reply })
            .map_err(|_| BlipError::ConnectionClosed)?;
        Ok(pending)
    }

    /// Replace the connection listener.
    pub fn set_listener(&self, listener: impl ConnectionListener) -> Result<()> {
        self.core
            .commands
            .send(Command::SetListener(Box::new(listener)))
            .map_err(|_| BlipError::ConnectionClosed)
    }

    /// Begin closing: the worker drains partially-sent urgent messages,
    /// fails pending replies, and closes the transport. Idempotent.
    pub fn close(&self) {
        let _ = self.core.commands.send(Command::Close);
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.core.set_state(state);
    }

    pub(crate) fn make_ref(&self) -> ConnectionRef {
        ConnectionRef {
            id: self.core.id,
            core: Arc::downgrade(&self.core),
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.core.id == other.core.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Non-owning back-reference from a message to its connection.
///
/// Holds a `Weak`, so messages never extend the connection's lifetime; the
/// id is kept alongside so equality works after the connection is gone.
#[derive(Clone)]
pub(crate) struct ConnectionRef {
    id: ConnectionId,
    core: Weak<ConnectionCore>,
}

impl ConnectionRef {
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.core.upgrade().map(|core| Connection { core })
    }

    // Reference that never upgrades, for codec and message unit tests.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            id: ConnectionId(0),
            core: Weak::new(),
        }
    }
}
