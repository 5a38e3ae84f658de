//! The Message object: properties, body, flags, numbering, reply linkage.
//!
//! A message is mutable only between creation and sending. Sending moves it
//! into the connection worker and freezes it, so the mutable buffer is never
//! visible afterwards. Incoming messages arrive frozen.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::connection::{Connection, ConnectionRef};
use crate::error::{BlipError, Result};
use crate::listener::ReplyListener;
use crate::protocol::{flags, validate_property, MessageType};

/// Well-known integer values for the `Error-Code` property.
pub mod error_codes {
    /// The request was malformed.
    pub const BAD_REQUEST: i32 = 400;
    /// The peer refused the request.
    pub const FORBIDDEN: i32 = 403;
    /// No handler matched the request.
    pub const NOT_FOUND: i32 = 404;
    /// A requested range was not satisfiable.
    pub const BAD_RANGE: i32 = 416;
    /// The handler raised an error.
    pub const HANDLER_FAILED: i32 = 501;
    /// Unclassified failure.
    pub const UNSPECIFIED: i32 = 599;
}

// Error-Domain value for errors the core synthesizes locally.
const BLIP_ERROR_DOMAIN: &str = "BLIP";

/// One logical BLIP message: a property map plus an opaque body.
pub struct Message {
    conn: ConnectionRef,
    number: u32,
    flags: u8,
    properties: HashMap<String, String>,
    body: Bytes,
    mine: bool,
    mutable: bool,
    responded: bool,
    reply_listener: Option<Box<dyn ReplyListener>>,
}

impl Message {
    pub(crate) fn outgoing(conn: ConnectionRef, number: u32) -> Self {
        Self {
            conn,
            number,
            flags: MessageType::Msg as u8,
            properties: HashMap::new(),
            body: Bytes::new(),
            mine: true,
            mutable: true,
            responded: false,
            reply_listener: None,
        }
    }

    pub(crate) fn incoming(
        conn: ConnectionRef,
        number: u32,
        message_flags: u8,
        properties: HashMap<String, String>,
        body: Bytes,
    ) -> Self {
        Self {
            conn,
            number,
            flags: message_flags & !flags::MORECOMING,
            properties,
            body,
            mine: false,
            mutable: false,
            responded: false,
            reply_listener: None,
        }
    }

    // Synthetic ERR delivered to reply listeners when the connection dies.
    pub(crate) fn closed_error(conn: ConnectionRef, number: u32, cause: &str) -> Self {
        let mut properties = HashMap::new();
        properties.insert("Error-Domain".to_owned(), BLIP_ERROR_DOMAIN.to_owned());
        properties.insert(
            "Error-Code".to_owned(),
            error_codes::UNSPECIFIED.to_string(),
        );
        Self {
            conn,
            number,
            flags: MessageType::Err as u8,
            properties,
            body: Bytes::copy_from_slice(cause.as_bytes()),
            mine: false,
            mutable: false,
            responded: false,
            reply_listener: None,
        }
    }

    pub(crate) fn freeze(&mut self) {
        self.mutable = false;
    }

    pub(crate) fn take_reply_listener(&mut self) -> Option<Box<dyn ReplyListener>> {
        self.reply_listener.take()
    }

    pub(crate) fn connection_ref(&self) -> &ConnectionRef {
        &self.conn
    }

    /// The connection this message belongs to, if it is still alive.
    pub fn connection(&self) -> Option<Connection> {
        self.conn.upgrade()
    }

    /// Message number, unique per connection, direction, and type class.
    #[inline]
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Raw flags byte.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// The message type selected by the low flag bits.
    pub fn message_type(&self) -> MessageType {
        MessageType::from_flags(self.flags).expect("message flags carry a valid type")
    }

    /// True if this is a request.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.message_type() == MessageType::Msg
    }

    /// True if this is a successful reply.
    #[inline]
    pub fn is_reply(&self) -> bool {
        self.message_type() == MessageType::Rpy
    }

    /// True if this is an error reply.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.message_type() == MessageType::Err
    }

    /// True if this message was created locally.
    #[inline]
    pub fn is_mine(&self) -> bool {
        self.mine
    }

    /// True while the creator may still mutate this message.
    #[inline]
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// True if the URGENT flag is set.
    #[inline]
    pub fn is_urgent(&self) -> bool {
        flags::has(self.flags, flags::URGENT)
    }

    /// True if the NOREPLY flag is set.
    #[inline]
    pub fn is_no_reply(&self) -> bool {
        flags::has(self.flags, flags::NOREPLY)
    }

    /// True if the COMPRESSED flag is set.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        flags::has(self.flags, flags::COMPRESSED)
    }

    /// The message body.
    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// All properties.
    #[inline]
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Look up one property.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// True if the property exists.
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    /// Value of the `Profile` property.
    pub fn profile(&self) -> Option<&str> {
        self.property("Profile")
    }

    /// Value of the `Content-Type` property.
    pub fn content_type(&self) -> Option<&str> {
        self.property("Content-Type")
    }

    /// Value of the `Error-Domain` property of an ERR message.
    pub fn error_domain(&self) -> Option<&str> {
        self.property("Error-Domain")
    }

    /// Parsed `Error-Code` property of an ERR message.
    ///
    /// Fails with [`BlipError::BadErrorCode`] when the property is missing
    /// or not an integer; the failure affects nothing but this call.
    pub fn error_code(&self) -> Result<i32> {
        let raw = self
            .property("Error-Code")
            .ok_or_else(|| BlipError::BadErrorCode(String::new()))?;
        raw.parse()
            .map_err(|_| BlipError::BadErrorCode(raw.to_owned()))
    }

    fn check_mutable(&self) -> Result<()> {
        if self.mutable {
            Ok(())
        } else {
            Err(BlipError::Immutable)
        }
    }

    /// Set a property, replacing any previous value.
    pub fn set_property(&mut self, name: &str, value: &str) -> Result<()> {
        self.check_mutable()?;
        validate_property(name)?;
        validate_property(value)?;
        self.properties.insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    /// Remove a property if present.
    pub fn remove_property(&mut self, name: &str) -> Result<()> {
        self.check_mutable()?;
        self.properties.remove(name);
        Ok(())
    }

    /// Remove all properties.
    pub fn clear_properties(&mut self) -> Result<()> {
        self.check_mutable()?;
        self.properties.clear();
        Ok(())
    }

    /// Copy every entry of `source` into this message's properties.
    pub fn copy_properties(&mut self, source: &HashMap<String, String>) -> Result<()> {
        self.check_mutable()?;
        for (name, value) in source {
            validate_property(name)?;
            validate_property(value)?;
        }
        for (name, value) in source {
            self.properties.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    /// Set the `Profile` property.
    pub fn set_profile(&mut self, profile: &str) -> Result<()> {
        self.set_property("Profile", profile)
    }

    /// Set the `Content-Type` property.
    pub fn set_content_type(&mut self, content_type: &str) -> Result<()> {
        self.set_property("Content-Type", content_type)
    }

    /// Replace the body.
    pub fn set_body(&mut self, body: impl Into<Bytes>) -> Result<()> {
        self.check_mutable()?;
        self.body = body.into();
        Ok(())
    }

    /// Set or clear the URGENT flag.
    pub fn set_urgent(&mut self, urgent: bool) -> Result<()> {
        self.set_flag(flags::URGENT, urgent)
    }

    /// Set or clear the NOREPLY flag.
    pub fn set_no_reply(&mut self, no_reply: bool) -> Result<()> {
        self.set_flag(flags::NOREPLY, no_reply)
    }

    /// Set or clear the COMPRESSED flag.
    pub fn set_compressed(&mut self, compressed: bool) -> Result<()> {
        self.set_flag(flags::COMPRESSED, compressed)
    }

    fn set_flag(&mut self, flag: u8, on: bool) -> Result<()> {
        self.check_mutable()?;
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
        Ok(())
    }

    /// Attach the listener to invoke when this request's reply completes.
    pub fn set_reply_listener(&mut self, listener: impl ReplyListener) -> Result<()> {
        self.check_mutable()?;
        self.reply_listener = Some(Box::new(listener));
        Ok(())
    }

    /// Turn a mutable reply into an ERR reply with the standard properties.
    pub fn set_error(&mut self, domain: &str, code: i32) -> Result<()> {
        self.check_mutable()?;
        self.flags = (self.flags & !flags::TYPE_MASK) | MessageType::Err as u8;
        self.set_property("Error-Domain", domain)?;
        self.set_property("Error-Code", &code.to_string())
    }

    /// Create the mutable RPY reply to this incoming request.
    ///
    /// Fails with [`BlipError::CannotReply`] if this is not an incoming
    /// request, the request carries NOREPLY, or a response was already
    /// created.
    pub fn new_response(&mut self) -> Result<Message> {
        if !self.is_request() {
            return Err(BlipError::CannotReply("not a request"));
        }
        if self.mine {
            return Err(BlipError::CannotReply("request was sent by us"));
        }
        if self.is_no_reply() {
            return Err(BlipError::CannotReply("request has NOREPLY set"));
        }
        if self.responded {
            return Err(BlipError::CannotReply("response already created"));
        }
        self.responded = true;
        Ok(Self {
            conn: self.conn.clone(),
            number: self.number,
            flags: MessageType::Rpy as u8,
            properties: HashMap::new(),
            body: Bytes::new(),
            mine: true,
            mutable: true,
            responded: false,
            reply_listener: None,
        })
    }

    /// Send this message over its connection.
    ///
    /// Equivalent to [`Connection::send_message`]; fails with
    /// [`BlipError::ConnectionClosed`] if the connection is gone.
    pub fn send(self) -> Result<Option<PendingReply>> {
        let connection = self.conn.upgrade().ok_or(BlipError::ConnectionClosed)?;
        connection.send_message(self)
    }
}

// The reply listener is intentionally not cloned; clones exist to fan a
// completed message out to multiple consumers.
impl Clone for Message {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            number: self.number,
            flags: self.flags,
            properties: self.properties.clone(),
            body: self.body.clone(),
            mine: self.mine,
            mutable: self.mutable,
            responded: self.responded,
            reply_listener: None,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("number", &self.number)
            .field("flags", &self.flags)
            .field("properties", &self.properties.len())
            .field("body_len", &self.body.len())
            .field("mine", &self.mine)
            .field("mutable", &self.mutable)
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.message_type() {
            MessageType::Msg => "MSG",
            MessageType::Rpy => "RPY",
            MessageType::Err => "ERR",
            MessageType::AckMsg => "ACKMSG",
            MessageType::AckRpy => "ACKRPY",
        };
        let direction = if self.mine { "->" } else { "<-" };
        write!(f, "{kind} #{}{direction}, {} bytes", self.number, self.body.len())?;
        if self.is_compressed() {
            write!(f, ", compressed")?;
        }
        if self.is_urgent() {
            write!(f, ", urgent")?;
        }
        if self.is_no_reply() {
            write!(f, ", noreply")?;
        }
        Ok(())
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.conn.id() == other.conn.id() && self.number == other.number
    }
}

impl Eq for Message {}

impl Hash for Message {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.conn.id().hash(state);
        self.number.hash(state);
    }
}

// Messages on different connections are incomparable and deliberately
// report Equal.
impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if self.conn.id() == other.conn.id() {
            Some(self.number.cmp(&other.number))
        } else {
            Some(std::cmp::Ordering::Equal)
        }
    }
}

/// The placeholder returned by sending a request that expects a reply.
///
/// Resolves with the completed reply message, or with
/// [`BlipError::ConnectionClosed`] if the connection dies first. The
/// request's [`ReplyListener`], if any, fires independently of whether this
/// future is awaited.
pub struct PendingReply {
    number: u32,
    rx: oneshot::Receiver<Message>,
}

impl PendingReply {
    pub(crate) fn new(number: u32, rx: oneshot::Receiver<Message>) -> Self {
        Self { number, rx }
    }

    /// Number of the request this reply answers.
    #[inline]
    pub fn number(&self) -> u32 {
        self.number
    }
}

impl Future for PendingReply {
    type Output = Result<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.map_err(|_| BlipError::ConnectionClosed))
    }
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("number", &self.number)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRef;

    fn message(number: u32) -> Message {
        Message::outgoing(ConnectionRef::detached(), number)
    }

    #[test]
    fn test_new_request_defaults() {
        let msg = message(1);
        assert!(msg.is_mine());
        assert!(msg.is_mutable());
        assert!(msg.is_request());
        assert!(msg.properties().is_empty());
        assert!(msg.body().is_empty());
    }

    #[test]
    fn test_mutators_then_freeze() {
        let mut msg = message(1);
        msg.set_profile("echo").unwrap();
        msg.set_body(&b"hello"[..]).unwrap();
        msg.set_urgent(true).unwrap();
        msg.set_compressed(true).unwrap();
        assert!(msg.is_urgent());
        assert!(msg.is_compressed());

        msg.freeze();
        assert!(matches!(msg.set_profile("x"), Err(BlipError::Immutable)));
        assert!(matches!(msg.set_body(&b""[..]), Err(BlipError::Immutable)));
        assert!(matches!(msg.set_urgent(false), Err(BlipError::Immutable)));
        assert!(matches!(msg.remove_property("Profile"), Err(BlipError::Immutable)));
        assert!(matches!(msg.clear_properties(), Err(BlipError::Immutable)));
        // reads still work
        assert_eq!(msg.profile(), Some("echo"));
    }

    #[test]
    fn test_bad_property_strings() {
        let mut msg = message(1);
        assert!(matches!(
            msg.set_property("nul\0key", "v"),
            Err(BlipError::BadProperty(_))
        ));
        assert!(matches!(
            msg.set_property("k", "wide \u{1F600}"),
            Err(BlipError::BadProperty(_))
        ));
        assert!(msg.properties().is_empty());
    }

    #[test]
    fn test_copy_properties_validates_before_writing() {
        let mut msg = message(1);
        msg.set_property("Keep", "me").unwrap();
        let mut source = HashMap::new();
        source.insert("Ok".to_owned(), "fine".to_owned());
        source.insert("Bad".to_owned(), "nul\0".to_owned());
        assert!(msg.copy_properties(&source).is_err());
        // nothing from the bad batch landed
        assert_eq!(msg.properties().len(), 1);
    }

    #[test]
    fn test_error_code_parsing() {
        let mut msg = message(1);
        msg.set_property("Error-Code", "404").unwrap();
        msg.set_property("Error-Domain", "HTTP").unwrap();
        assert_eq!(msg.error_code().unwrap(), 404);
        assert_eq!(msg.error_domain(), Some("HTTP"));

        msg.set_property("Error-Code", "not-a-number").unwrap();
        assert!(matches!(msg.error_code(), Err(BlipError::BadErrorCode(_))));
    }

    #[test]
    fn test_set_error_retypes_reply() {
        let mut msg = message(1);
        msg.set_error("HTTP", error_codes::NOT_FOUND).unwrap();
        assert!(msg.is_error());
        assert_eq!(msg.error_code().unwrap(), 404);
    }

    #[test]
    fn test_new_response_constraints() {
        // own requests cannot be responded to
        let mut mine = message(1);
        assert!(matches!(
            mine.new_response(),
            Err(BlipError::CannotReply(_))
        ));

        // incoming request: exactly one response
        let mut incoming = Message::incoming(
            ConnectionRef::detached(),
            7,
            0,
            HashMap::new(),
            Bytes::new(),
        );
        let response = incoming.new_response().unwrap();
        assert!(response.is_reply());
        assert!(response.is_mine());
        assert!(response.is_mutable());
        assert_eq!(response.number(), 7);
        assert!(matches!(
            incoming.new_response(),
            Err(BlipError::CannotReply("response already created"))
        ));

        // NOREPLY requests cannot be responded to
        let mut noreply = Message::incoming(
            ConnectionRef::detached(),
            8,
            flags::NOREPLY,
            HashMap::new(),
            Bytes::new(),
        );
        assert!(matches!(
            noreply.new_response(),
            Err(BlipError::CannotReply("request has NOREPLY set"))
        ));
    }

    #[test]
    fn test_equality_and_ordering() {
        let a1 = message(1);
        let a2 = message(2);
        assert_ne!(a1, a2);
        assert!(a1 < a2);
        assert_eq!(a1, a1.clone());
    }

    #[test]
    fn test_display_summary() {
        let mut msg = message(3);
        msg.set_body(&b"12345"[..]).unwrap();
        msg.set_urgent(true).unwrap();
        msg.set_no_reply(true).unwrap();
        assert_eq!(msg.to_string(), "MSG #3->, 5 bytes, urgent, noreply");
    }

    #[test]
    fn test_closed_error_shape() {
        let msg = Message::closed_error(ConnectionRef::detached(), 9, "transport reset");
        assert!(msg.is_error());
        assert_eq!(msg.error_domain(), Some("BLIP"));
        assert_eq!(msg.error_code().unwrap(), error_codes::UNSPECIFIED);
        assert_eq!(&msg.body()[..], b"transport reset");
    }
}
