//! Incremental RESP2 parser.
//!
//! [`parse`] takes a byte buffer and returns `Ok((RespValue, bytes_consumed))`
//! or `Err(Incomplete)` when more data is needed, or `Err(Protocol(…))` on
//! malformed input. Nothing is consumed on `Incomplete`; the caller keeps the
//! buffer, reads more bytes and calls again.
//!
//! The parser uses `Bytes` (ref-counted) buffers to enable **zero-copy**
//! extraction of bulk strings via `buf.slice()`.

use bytes::Bytes;
use crate::error::{Error, Result};
use crate::resp::types::RespValue;
use memchr::memchr;

/// Maximum number of elements accepted in a single array header.
///
/// Guards against `*2147483647\r\n` triggering a huge up-front allocation.
const MAX_ELEMENTS: usize = 16_777_216;

/// Maximum nesting depth for arrays.
const MAX_DEPTH: usize = 512;

/// Parse one RESP value from the front of `buf`.
///
/// Returns `(value, bytes_consumed)` on success.
/// Returns `Err(Incomplete)` when the buffer is too short; read more data
/// and retry.
pub fn parse(buf: &Bytes) -> Result<(RespValue, usize)> {
    parse_at_depth(buf, 0, 0)
}

/// Parse one RESP value from the front of a borrowed slice.
///
/// Only the payload of each bulk string is copied out, so the cost is
/// proportional to the reply, not to whatever follows it in `buf`.
/// Prefer [`parse`] with a pre-existing `Bytes` for zero-copy bulk strings.
pub fn parse_slice(buf: &[u8]) -> Result<(RespValue, usize)> {
    parse_at_depth(buf, 0, 0)
}

/// Where bulk string payloads come from.
trait Input {
    fn raw(&self) -> &[u8];
    fn bulk(&self, start: usize, end: usize) -> Bytes;
}

impl Input for Bytes {
    #[inline]
    fn raw(&self) -> &[u8] {
        self
    }

    #[inline]
    fn bulk(&self, start: usize, end: usize) -> Bytes {
        self.slice(start..end)
    }
}

impl Input for [u8] {
    #[inline]
    fn raw(&self) -> &[u8] {
        self
    }

    #[inline]
    fn bulk(&self, start: usize, end: usize) -> Bytes {
        Bytes::copy_from_slice(&self[start..end])
    }
}

/// Parse the value starting at `at`. Returns the value and the index just
/// past it.
fn parse_at_depth<I: Input + ?Sized>(input: &I, at: usize, depth: usize) -> Result<(RespValue, usize)> {
    let buf = input.raw();
    if buf.len() <= at {
        return Err(Error::Incomplete);
    }
    if depth > MAX_DEPTH {
        return Err(Error::Protocol(format!(
            "RESP nesting deeper than {MAX_DEPTH} levels"
        )));
    }

    match buf[at] {
        b'+' => parse_simple_string(buf, at),
        b'-' => parse_error(buf, at),
        b':' => parse_integer(buf, at),
        b'$' => parse_bulk_string(input, at),
        b'*' => parse_array(input, at, depth),
        other => Err(Error::Protocol(format!(
            "unknown RESP type byte: 0x{other:02x}"
        ))),
    }
}

/// Compute the byte length of one complete RESP frame at the front of `buf`
/// **without allocating** or building a `RespValue` tree.
///
/// Returns `Ok(bytes_consumed)` or `Err(Incomplete)`.
pub fn resp_frame_len(buf: &[u8]) -> Result<usize> {
    frame_len_at_depth(buf, 0)
}

fn frame_len_at_depth(buf: &[u8], depth: usize) -> Result<usize> {
    if buf.is_empty() {
        return Err(Error::Incomplete);
    }
    if depth > MAX_DEPTH {
        return Err(Error::Protocol(format!(
            "RESP nesting deeper than {MAX_DEPTH} levels"
        )));
    }
    match buf[0] {
        b'+' | b'-' | b':' => {
            let (_, next) = read_line(buf, 1)?;
            Ok(next)
        }
        b'$' => {
            let (line, next) = read_line(buf, 1)?;
            let len = parse_int_from_bytes(line)?;
            if len < 0 {
                return Ok(next); // $-1\r\n  null bulk
            }
            let total = next + len as usize + 2;
            if buf.len() < total {
                return Err(Error::Incomplete);
            }
            Ok(total)
        }
        b'*' => {
            let (line, mut next) = read_line(buf, 1)?;
            let count = parse_int_from_bytes(line)?;
            if count < 0 {
                return Ok(next); // *-1\r\n  null array
            }
            check_count(count)?;
            for _ in 0..count {
                next += frame_len_at_depth(&buf[next..], depth + 1)?;
            }
            Ok(next)
        }
        other => Err(Error::Protocol(format!(
            "unknown RESP type byte: 0x{other:02x}"
        ))),
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Find the next `\r\n` in `buf` starting at `offset`.
/// Returns the index of `\r`.
#[inline]
fn find_crlf(buf: &[u8], offset: usize) -> Result<usize> {
    match memchr(b'\r', &buf[offset..]) {
        Some(pos) => {
            let abs = offset + pos;
            if abs + 1 >= buf.len() {
                Err(Error::Incomplete)
            } else if buf[abs + 1] == b'\n' {
                Ok(abs)
            } else {
                Err(Error::Protocol("expected \\n after \\r".into()))
            }
        }
        None => Err(Error::Incomplete),
    }
}

/// Read the line starting at `buf[offset]` up to `\r\n`.
/// Returns `(line_bytes, index_after_crlf)`.
#[inline]
fn read_line(buf: &[u8], offset: usize) -> Result<(&[u8], usize)> {
    let cr = find_crlf(buf, offset)?;
    Ok((&buf[offset..cr], cr + 2))
}

/// Parse an integer from a byte slice (no allocations).
fn parse_int_from_bytes(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Err(Error::Protocol("empty integer".into()));
    }
    let (negative, digits) = match bytes[0] {
        b'-' => (true, &bytes[1..]),
        b'+' => (false, &bytes[1..]),
        _ => (false, bytes),
    };

    if digits.is_empty() {
        return Err(Error::Protocol("integer has no digits".into()));
    }

    // Accumulate as negative so i64::MIN parses without overflow.
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(Error::Protocol(format!(
                "invalid byte in integer: 0x{b:02x}"
            )));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_sub((b - b'0') as i64))
            .ok_or_else(|| Error::Protocol("integer overflow".into()))?;
    }

    if negative {
        Ok(n)
    } else {
        n.checked_neg()
            .ok_or_else(|| Error::Protocol("integer overflow".into()))
    }
}

fn check_count(count: i64) -> Result<()> {
    if count as u64 > MAX_ELEMENTS as u64 {
        return Err(Error::Protocol(format!(
            "array of {count} elements exceeds limit of {MAX_ELEMENTS}"
        )));
    }
    Ok(())
}

// ── Type parsers ──────────────────────────────────────────────────

/// `+<string>\r\n`
fn parse_simple_string(buf: &[u8], at: usize) -> Result<(RespValue, usize)> {
    let (line, next) = read_line(buf, at + 1)?;
    let s = match line {
        b"OK" => "OK".to_string(),
        b"QUEUED" => "QUEUED".to_string(),
        _ => std::str::from_utf8(line)
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 in simple string: {e}")))?
            .to_string(),
    };
    Ok((RespValue::SimpleString(s), next))
}

/// `-<error message>\r\n`
fn parse_error(buf: &[u8], at: usize) -> Result<(RespValue, usize)> {
    let (line, next) = read_line(buf, at + 1)?;
    let s = String::from_utf8_lossy(line).into_owned();
    Ok((RespValue::Error(s), next))
}

/// `:<integer>\r\n`
fn parse_integer(buf: &[u8], at: usize) -> Result<(RespValue, usize)> {
    let (line, next) = read_line(buf, at + 1)?;
    let i = parse_int_from_bytes(line)?;
    Ok((RespValue::Integer(i), next))
}

/// `$<length>\r\n<data>\r\n`  or  `$-1\r\n`
fn parse_bulk_string<I: Input + ?Sized>(input: &I, at: usize) -> Result<(RespValue, usize)> {
    let buf = input.raw();
    let (line, next) = read_line(buf, at + 1)?;
    let len = parse_int_from_bytes(line)?;

    if len < 0 {
        return Ok((RespValue::Null, next));
    }

    let data_end = next + len as usize;
    if buf.len() < data_end + 2 {
        return Err(Error::Incomplete);
    }
    if buf[data_end] != b'\r' || buf[data_end + 1] != b'\n' {
        return Err(Error::Protocol(
            "bulk string not terminated by \\r\\n".into(),
        ));
    }

    let data = input.bulk(next, data_end);
    Ok((RespValue::BulkString(data), data_end + 2))
}

/// `*<count>\r\n<elements>`  or  `*-1\r\n`
fn parse_array<I: Input + ?Sized>(input: &I, at: usize, depth: usize) -> Result<(RespValue, usize)> {
    let (line, mut next) = read_line(input.raw(), at + 1)?;
    let count = parse_int_from_bytes(line)?;

    if count < 0 {
        return Ok((RespValue::NullArray, next));
    }
    check_count(count)?;

    let count = count as usize;
    let mut elements = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let (val, end) = parse_at_depth(input, next, depth + 1)?;
        elements.push(val);
        next = end;
    }
    Ok((RespValue::Array(elements), next))
}

// ── Tests ──────────────────────────────────────────────────────────
