//! # blip
//!
//! BLIP is a bidirectional, multiplexed request/response messaging protocol
//! layered over a reliable binary message transport such as WebSocket
//! binary frames. A logical message carries string properties and an opaque
//! body; messages are fragmented into frames and interleaved on a single
//! transport so large or slow messages do not head-of-line-block urgent
//! ones.
//!
//! This crate is the protocol core: the framing codec and the
//! per-connection multiplexer. The transport itself (TLS, handshake,
//! WebSocket mechanics) stays outside, attached through the channel
//! contract in [`transport`].
//!
//! ## Example
//!
//! ```ignore
//! use blip::{Connection, NullListener};
//!
//! #[tokio::main]
//! async fn main() -> blip::Result<()> {
//!     let conn = Connection::open(my_transport_link, NullListener);
//!
//!     let mut request = conn.new_request();
//!     request.set_profile("echo")?;
//!     request.set_body(&b"hello"[..])?;
//!     let reply = request.send()?.expect("reply expected").await?;
//!     println!("got {} body bytes", reply.body().len());
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod flow;
pub mod protocol;
pub mod transport;

mod connection;
mod error;
mod listener;
mod message;
mod worker;

pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{BlipError, Result};
pub use listener::{ConnectionListener, NullListener, ReplyListener, ServerListener};
pub use message::{error_codes, Message, PendingReply};
pub use protocol::{flags, MessageType, MAX_FRAME_SIZE};
