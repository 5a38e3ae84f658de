//! Error types for the BLIP core.

use thiserror::Error;

/// Main error type for all BLIP operations.
///
/// Errors fall into three groups with different propagation rules:
///
/// - **Fatal protocol errors** terminate the connection. They are raised by
///   the decoder or the receive path, logged, and converted into closure;
///   pending replies observe them as [`BlipError::ConnectionClosed`].
/// - **Per-message errors** ([`BlipError::BadErrorCode`]) only surface when
///   the caller asks for the parsed value.
/// - **Caller misuse** errors are returned synchronously at the offending
///   call and never affect the connection.
#[derive(Debug, Error)]
pub enum BlipError {
    /// Varint underflowed the buffer or overflowed 32 bits.
    #[error("malformed varint")]
    BadVarint,

    /// Property block failed validation.
    #[error("malformed property block: {0}")]
    BadProperties(&'static str),

    /// Per-message gzip stream is corrupt.
    #[error("gzip stream error: {0}")]
    BadCompression(String),

    /// Frame ended inside a declared region.
    #[error("frame truncated")]
    ShortFrame,

    /// Type bits are not one of MSG, RPY, ERR, ACKMSG, ACKRPY.
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// Transport delivered a zero-length binary message.
    #[error("empty frame")]
    EmptyFrame,

    /// A request number was reused after its message completed.
    #[error("message number {0} reused after completion")]
    DuplicateMessageNumber(u32),

    /// Message number 0 is reserved and never valid on the wire.
    #[error("message number 0 is reserved")]
    InvalidMessageNumber,

    /// Peer sent a text message on a binary-only protocol.
    #[error("text message received")]
    TextMessageReceived,

    /// The underlying transport reported an error.
    #[error("transport error: {0}")]
    Transport(String),

    /// `Error-Code` property is missing or not an integer.
    #[error("error code is not an integer: {0:?}")]
    BadErrorCode(String),

    /// Message has been frozen by sending it.
    #[error("message is not mutable")]
    Immutable,

    /// Message was received, not created locally.
    #[error("message was not created locally")]
    NotMine,

    /// Message belongs to a different connection.
    #[error("message belongs to a different connection")]
    WrongOwner,

    /// A response cannot be created for this message.
    #[error("cannot reply: {0}")]
    CannotReply(&'static str),

    /// Property key or value cannot be carried on the wire.
    #[error("invalid property string: {0}")]
    BadProperty(&'static str),

    /// Connection is closing or closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl BlipError {
    /// True if this error must terminate the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BlipError::BadVarint
                | BlipError::BadProperties(_)
                | BlipError::BadCompression(_)
                | BlipError::ShortFrame
                | BlipError::UnknownType(_)
                | BlipError::EmptyFrame
                | BlipError::DuplicateMessageNumber(_)
                | BlipError::InvalidMessageNumber
                | BlipError::TextMessageReceived
                | BlipError::Transport(_)
        )
    }
}

/// Result type alias using BlipError.
pub type Result<T> = std::result::Result<T, BlipError>;
