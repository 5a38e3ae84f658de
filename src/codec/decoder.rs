//! Stateful reassembly of one incoming message.

use std::collections::HashMap;

use bytes::{Buf, Bytes};

use super::gzip::GzipBodyWriter;
use crate::error::{BlipError, Result};
use crate::protocol::{decode_properties, flags, read_varint};

// Initial body buffer capacity once the header frame has been parsed.
const BODY_SEED: usize = 128;

/// Rebuilds one message from its frames.
///
/// The connection routes the first frame to
/// [`read_first_frame`](Self::read_first_frame) and later frames to
/// [`read_next_frame`](Self::read_next_frame). The non-MORECOMING flag bits
/// of the first frame are authoritative; changes in later frames are
/// ignored. A frame without MORECOMING completes the message.
pub struct MessageAssembly {
    number: u32,
    flags: u8,
    header_seen: bool,
    properties: HashMap<String, String>,
    body: Vec<u8>,
    gzip: Option<GzipBodyWriter>,
    received: u64,
    complete: bool,
}

impl MessageAssembly {
    /// Start assembling the message with the given number.
    pub fn new(number: u32) -> Self {
        Self {
            number,
            flags: 0,
            header_seen: false,
            properties: HashMap::new(),
            body: Vec::new(),
            gzip: None,
            received: 0,
            complete: false,
        }
    }

    /// The message number this assembly collects.
    #[inline]
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Authoritative message flags, valid once the header frame arrived.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// True once the header frame has been ingested.
    #[inline]
    pub fn has_header(&self) -> bool {
        self.header_seen
    }

    /// True once the final frame has been ingested.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Total wire body bytes ingested so far, for ACK generation.
    #[inline]
    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    /// Ingest the first frame: property block plus leading body chunk.
    ///
    /// `payload` is the frame content after the number and flags varints.
    pub fn read_first_frame(&mut self, frame_flags: u8, mut payload: Bytes) -> Result<()> {
        debug_assert!(!self.header_seen);
        self.flags = frame_flags & !flags::MORECOMING;

        let props_len = read_varint(&mut payload)? as usize;
        if payload.remaining() < props_len {
            return Err(BlipError::ShortFrame);
        }
        let block = payload.split_to(props_len);
        self.properties = decode_properties(&block)?;

        self.body = Vec::with_capacity(BODY_SEED);
        if flags::has(self.flags, flags::COMPRESSED) {
            self.gzip = Some(GzipBodyWriter::new());
        }
        self.header_seen = true;

        self.ingest(payload, !flags::has(frame_flags, flags::MORECOMING))
    }

    /// Ingest a continuation frame: body chunk only.
    pub fn read_next_frame(&mut self, frame_flags: u8, payload: Bytes) -> Result<()> {
        debug_assert!(self.header_seen);
        self.ingest(payload, !flags::has(frame_flags, flags::MORECOMING))
    }

    fn ingest(&mut self, chunk: Bytes, last: bool) -> Result<()> {
        self.received += chunk.len() as u64;
        match &mut self.gzip {
            Some(writer) => {
                writer.write(&chunk)?;
                if last {
                    self.body = writer.finish()?;
                    self.gzip = None;
                }
            }
            None => {
                self.reserve_for(chunk.len(), last);
                self.body.extend_from_slice(&chunk);
            }
        }
        if last {
            self.complete = true;
        }
        Ok(())
    }

    // Grow by doubling, except the final frame reserves the exact remainder
    // so a finished body carries no slack.
    fn reserve_for(&mut self, additional: usize, last: bool) {
        let required = self.body.len() + additional;
        if last {
            if required > self.body.capacity() {
                self.body.reserve_exact(required - self.body.len());
            }
            return;
        }
        let mut capacity = self.body.capacity().max(BODY_SEED);
        while capacity < required {
            capacity *= 2;
        }
        if capacity > self.body.capacity() {
            self.body.reserve_exact(capacity - self.body.len());
        }
    }

    /// Tear down a complete assembly into (flags, properties, body).
    pub fn into_parts(self) -> (u8, HashMap<String, String>, Bytes) {
        debug_assert!(self.complete);
        (self.flags, self.properties, Bytes::from(self.body))
    }
}
