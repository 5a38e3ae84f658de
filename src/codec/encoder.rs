//! Stateful frame encoder for one outgoing message.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use super::gzip::GzipBodyReader;
use crate::error::Result;
use crate::protocol::varint::varint_len;
use crate::protocol::{encode_properties, flags, write_varint};

/// One encoded frame plus the bookkeeping the scheduler needs.
#[derive(Debug)]
pub struct EncodedFrame {
    /// Complete wire frame: header varints, optional property block, chunk.
    pub bytes: Bytes,
    /// Body bytes carried by this frame, for flow-control accounting.
    pub body_len: usize,
    /// True if more frames of this message follow.
    pub more_coming: bool,
}

enum BodySource {
    Plain { body: Bytes, pos: usize },
    Gzip(GzipBodyReader),
}

impl BodySource {
    fn next_chunk(&mut self, max_len: usize) -> Result<Bytes> {
        match self {
            BodySource::Plain { body, pos } => {
                let take = max_len.min(body.len() - *pos);
                let chunk = body.slice(*pos..*pos + take);
                *pos += take;
                Ok(chunk)
            }
            BodySource::Gzip(reader) => reader.next_chunk(max_len),
        }
    }

    fn is_exhausted(&self) -> bool {
        match self {
            BodySource::Plain { body, pos } => *pos >= body.len(),
            BodySource::Gzip(reader) => reader.is_exhausted(),
        }
    }
}

/// Emits the frame sequence for a single frozen message.
///
/// The first call to [`next_frame`](Self::next_frame) produces the header
/// frame carrying the property block plus as much body as fits; later calls
/// produce continuation frames. MORECOMING is set on every frame except the
/// last, so an empty-body message is one frame with MORECOMING clear.
pub struct MessageEncoder {
    number: u32,
    flags: u8,
    properties: Bytes,
    source: BodySource,
    header_sent: bool,
    finished: bool,
}

impl MessageEncoder {
    /// Snapshot a frozen message for framing.
    ///
    /// Fails only if a property string cannot be encoded, which mutation
    /// checks normally rule out earlier.
    pub fn new(
        number: u32,
        message_flags: u8,
        properties: &HashMap<String, String>,
        body: Bytes,
    ) -> Result<Self> {
        let source = if flags::has(message_flags, flags::COMPRESSED) {
            BodySource::Gzip(GzipBodyReader::new(body))
        } else {
            BodySource::Plain { body, pos: 0 }
        };
        Ok(Self {
            number,
            flags: message_flags & !flags::MORECOMING,
            properties: encode_properties(properties)?,
            source,
            header_sent: false,
            finished: false,
        })
    }

    /// The message number frames are emitted under.
    #[inline]
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Message flags without MORECOMING.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// True once the first frame has been produced.
    #[inline]
    pub fn has_started(&self) -> bool {
        self.header_sent
    }

    /// True once the final frame has been produced.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Produce the next frame carrying up to `max_len` body bytes.
    ///
    /// Returns `None` once the message is fully framed.
    pub fn next_frame(&mut self, max_len: usize) -> Result<Option<EncodedFrame>> {
        if self.finished {
            return Ok(None);
        }

        let chunk = self.source.next_chunk(max_len)?;
        let more_coming = !self.source.is_exhausted();
        let mut frame_flags = self.flags;
        if more_coming {
            frame_flags |= flags::MORECOMING;
        }

        let props_len = self.properties.len();
        let mut frame = BytesMut::with_capacity(
            varint_len(self.number) + 2 + varint_len(props_len as u32) + props_len + chunk.len(),
        );
        write_varint(&mut frame, self.number);
        write_varint(&mut frame, u32::from(frame_flags));
        if !self.header_sent {
            write_varint(&mut frame, props_len as u32);
            frame.extend_from_slice(&self.properties);
            self.header_sent = true;
        }
        frame.extend_from_slice(&chunk);

        if !more_coming {
            self.finished = true;
        }
        Ok(Some(EncodedFrame {
            bytes: frame.freeze(),
            body_len: chunk.len(),
            more_coming,
        }))
    }
}
