//! Transport contract and in-memory test transport.
//!
//! The core relies on very little from its transport: reliable ordered
//! delivery of binary messages, a way to send one, and notifications of
//! inbound messages, closure, and errors. A transport driver (for example a
//! WebSocket client task) owns the socket, drains [`TransportCommand`]s
//! into it, and forwards what the socket produces as [`TransportEvent`]s.
//!
//! # Example
//!
//! ```ignore
//! let (client, server) = blip::transport::pair(64);
//! let conn = Connection::open(client, MyListener);
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;

/// What a transport delivers to the core.
#[derive(Debug)]
pub enum TransportEvent {
    /// One inbound binary message, i.e. one BLIP frame.
    Binary(Bytes),
    /// A text message arrived; the core treats this as fatal.
    Text,
    /// The transport closed.
    Closed {
        /// Close reason, if the transport reported one.
        reason: Option<String>,
    },
    /// The transport failed.
    Error(String),
}

/// What the core asks of a transport.
#[derive(Debug)]
pub enum TransportCommand {
    /// Send one binary message.
    Send(Bytes),
    /// Close the transport.
    Close,
}

/// The two channel ends a transport driver exposes to one connection.
pub struct TransportLink {
    /// Commands from the core to the driver.
    pub commands: mpsc::Sender<TransportCommand>,
    /// Events from the driver to the core.
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Create two connected in-memory endpoints.
///
/// Binary messages sent on one side arrive as events on the other, in
/// order. Closing either side delivers `Closed` to both. `capacity` bounds
/// each direction, providing the same backpressure a socket would. Must be
/// called inside a tokio runtime.
pub fn pair(capacity: usize) -> (TransportLink, TransportLink) {
    let (a_cmd_tx, a_cmd_rx) = mpsc::channel(capacity);
    let (a_evt_tx, a_evt_rx) = mpsc::channel(capacity);
    let (b_cmd_tx, b_cmd_rx) = mpsc::channel(capacity);
    let (b_evt_tx, b_evt_rx) = mpsc::channel(capacity);

    tokio::spawn(shuttle(a_cmd_rx, b_evt_tx.clone(), a_evt_tx.clone()));
    tokio::spawn(shuttle(b_cmd_rx, a_evt_tx, b_evt_tx));

    (
        TransportLink {
            commands: a_cmd_tx,
            events: a_evt_rx,
        },
        TransportLink {
            commands: b_cmd_tx,
            events: b_evt_rx,
        },
    )
}

async fn shuttle(
    mut commands: mpsc::Receiver<TransportCommand>,
    peer: mpsc::Sender<TransportEvent>,
    local: mpsc::Sender<TransportEvent>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            TransportCommand::Send(frame) => {
                if peer.send(TransportEvent::Binary(frame)).await.is_err() {
                    let _ = local
                        .send(TransportEvent::Closed {
                            reason: Some("peer endpoint dropped".to_owned()),
                        })
                        .await;
                    return;
                }
            }
            TransportCommand::Close => break,
        }
    }
    // local close, or the core dropped its command sender
    let _ = peer.send(TransportEvent::Closed { reason: None }).await;
    let _ = local.send(TransportEvent::Closed { reason: None }).await;
}
