//! Streaming gzip state for COMPRESSED messages.
//!
//! One reader or writer exists per compressed message and lives inside the
//! codec state, never shared. The property block is not part of the stream;
//! only body bytes are.

use std::io::Write;

use bytes::Bytes;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;

use crate::error::{BlipError, Result};

// Plaintext fed to the encoder per pull, bounding memory while chunking.
const FEED_CHUNK: usize = 16 * 1024;

fn gzip_err(err: std::io::Error) -> BlipError {
    BlipError::BadCompression(err.to_string())
}

/// Compresses an owned body and hands it out in bounded wire chunks.
pub(crate) struct GzipBodyReader {
    encoder: Option<GzEncoder<Vec<u8>>>,
    body: Bytes,
    fed: usize,
    pending: Vec<u8>,
}

impl GzipBodyReader {
    pub fn new(body: Bytes) -> Self {
        Self {
            encoder: Some(GzEncoder::new(Vec::new(), Compression::default())),
            body,
            fed: 0,
            pending: Vec::new(),
        }
    }

    /// Produce up to `max_len` compressed bytes.
    ///
    /// Returns an empty chunk only once the stream is exhausted.
    pub fn next_chunk(&mut self, max_len: usize) -> Result<Bytes> {
        while self.pending.len() < max_len {
            let Some(encoder) = self.encoder.as_mut() else {
                break;
            };
            if self.fed < self.body.len() {
                let end = (self.fed + FEED_CHUNK).min(self.body.len());
                encoder.write_all(&self.body[self.fed..end]).map_err(gzip_err)?;
                self.fed = end;
                let produced = std::mem::take(encoder.get_mut());
                self.pending.extend_from_slice(&produced);
            } else {
                let encoder = self.encoder.take().expect("checked above");
                let tail = encoder.finish().map_err(gzip_err)?;
                self.pending.extend_from_slice(&tail);
            }
        }
        let take = max_len.min(self.pending.len());
        let chunk = Bytes::copy_from_slice(&self.pending[..take]);
        self.pending.drain(..take);
        Ok(chunk)
    }

    /// True once all compressed bytes have been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.encoder.is_none() && self.pending.is_empty()
    }
}

/// Decompresses body chunks as they arrive off the wire.
pub(crate) struct GzipBodyWriter {
    decoder: Option<GzDecoder<Vec<u8>>>,
}

impl GzipBodyWriter {
    pub fn new() -> Self {
        Self {
            decoder: Some(GzDecoder::new(Vec::new())),
        }
    }

    /// Feed one wire chunk into the stream.
    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| BlipError::BadCompression("stream already finished".into()))?;
        decoder.write_all(chunk).map_err(gzip_err)
    }

    /// Finalize the stream and return the decompressed body.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        let decoder = self
            .decoder
            .take()
            .ok_or_else(|| BlipError::BadCompression("stream already finished".into()))?;
        decoder.finish().map_err(gzip_err)
    }
}
