//! Per-message streaming codec.
//!
//! [`MessageEncoder`] turns one frozen outgoing message into a sequence of
//! frames; [`MessageAssembly`] rebuilds one incoming message from its
//! frames. Each instance is owned by the connection worker for exactly one
//! message, so no state is shared across messages.

mod decoder;
mod encoder;
mod gzip;

pub use decoder::MessageAssembly;
pub use encoder::{EncodedFrame, MessageEncoder};
#[cfg(test)]
pub(crate) use gzip::GzipBodyWriter;
