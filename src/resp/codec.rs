//! Pluggable RESP codecs.
//!
//! A [`Codec`] turns commands into wire bytes and pulls complete replies out
//! of a connection's read buffer. Decoding is incremental: when the buffer
//! does not yet hold a whole reply, `decode` returns `Ok(None)` and leaves the
//! buffer untouched so the caller can read more bytes and call again.
//!
//! Two implementations are interchangeable:
//!
//! * [`RespCodec`] parses the front of the buffer in place, copying bulk
//!   payloads out, and advances past the reply.
//! * [`ScanningCodec`] first measures the frame with the allocation-free
//!   [`resp_frame_len`] scanner and only materializes the value once the whole
//!   frame has arrived, splitting exactly that frame off the buffer. Large
//!   replies arriving in many reads are never re-parsed from scratch.

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};
use crate::resp::parser::{parse, parse_slice, resp_frame_len};
use crate::resp::types::RespValue;
use crate::resp::writer::{encode_command_into, encoded_len};

/// Encoder/decoder pair used by a connection.
pub trait Codec: Send + Sync {
    /// Append the encoding of one command (name and arguments) to `buf`.
    fn encode(&self, parts: &[&[u8]], buf: &mut Vec<u8>) {
        buf.reserve(encoded_len(parts.iter().map(|p| p.len())));
        encode_command_into(buf, parts.iter().copied());
    }

    /// Pull one complete reply off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more data is needed; `buf` is unchanged then.
    fn decode(&self, buf: &mut BytesMut) -> Result<Option<RespValue>>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Which codec a connection should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    /// Parse in place, advance past the reply.
    Reference,
    /// Scan frame length first, then parse the exact frame.
    #[default]
    Scanning,
}

impl CodecKind {
    /// Instantiate the codec.
    pub fn build(self) -> Box<dyn Codec> {
        match self {
            Self::Reference => Box::new(RespCodec),
            Self::Scanning => Box::new(ScanningCodec),
        }
    }
}

/// Reference codec: parse in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl Codec for RespCodec {
    fn decode(&self, buf: &mut BytesMut) -> Result<Option<RespValue>> {
        if buf.is_empty() {
            return Ok(None);
        }
        // Parse in place; on Incomplete or error nothing is consumed.
        let (value, consumed) = match parse_slice(&buf[..]) {
            Ok(parsed) => parsed,
            Err(Error::Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };
        buf.advance(consumed);
        Ok(Some(value))
    }

    fn name(&self) -> &'static str {
        "reference"
    }
}

/// Accelerated codec: frame scan, then parse exactly one frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanningCodec;

impl Codec for ScanningCodec {
    fn decode(&self, buf: &mut BytesMut) -> Result<Option<RespValue>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let len = match resp_frame_len(&buf[..]) {
            Ok(len) => len,
            Err(Error::Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };
        let frame = buf.split_to(len).freeze();
        let (value, consumed) = parse(&frame)?;
        debug_assert_eq!(consumed, len);
        Ok(Some(value))
    }

    fn name(&self) -> &'static str {
        "scanning"
    }
}

// ── Tests ──────────────────────────────────────────────────────────
