//! Listener traits for the application surface.
//!
//! All callbacks run on the connection's worker task. They must not block
//! for long, but they may call [`Connection::send_message`] freely: sending
//! only enqueues onto the worker's own channel, so replying from inside
//! `on_request` is the expected pattern.

use crate::connection::Connection;
use crate::message::Message;

/// Receives completed messages on one connection.
///
/// All methods default to doing nothing, so implementations override only
/// what they handle.
pub trait ConnectionListener: Send + Sync + 'static {
    /// A complete incoming request arrived.
    fn on_request(&self, connection: &Connection, request: Message) {
        let _ = (connection, request);
    }

    /// A complete RPY reply arrived for one of our requests.
    fn on_response(&self, connection: &Connection, response: Message) {
        let _ = (connection, response);
    }

    /// A complete ERR reply arrived for one of our requests.
    fn on_error(&self, connection: &Connection, error: Message) {
        let _ = (connection, error);
    }
}

/// Receives the one reply a specific request is waiting for.
///
/// Fires before the connection listener's `on_response` / `on_error` for
/// the same reply.
pub trait ReplyListener: Send + Sync + 'static {
    /// The awaited reply is complete.
    fn on_completed(&self, reply: Message);
}

impl<F> ReplyListener for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn on_completed(&self, reply: Message) {
        self(reply)
    }
}

/// Observes connections as an accepting adapter opens and closes them.
pub trait ServerListener: Send + Sync + 'static {
    /// A new connection was accepted.
    fn connection_opened(&self, connection: &Connection) {
        let _ = connection;
    }

    /// A previously accepted connection closed.
    fn connection_closed(&self, connection: &Connection) {
        let _ = connection;
    }
}

/// Listener that ignores everything, for callers who only await replies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl ConnectionListener for NullListener {}
