//! RESP serializer.
//!
//! Encodes command arguments into the RESP bulk string array wire format:
//! `*<N>\r\n$<len>\r\narg1\r\n$<len>\r\narg2\r\n…`
//!
//! [`encode_value`] writes reply values and exists for server simulators
//! and round-trip tests.

use crate::resp::types::RespValue;
use itoa::Buffer;

/// Encode a command (list of arguments) into RESP wire format.
///
/// Each argument is treated as a binary-safe bulk string.
///
/// # Example
/// ```
/// let bytes = kvwire::resp::encode_command(&[b"SET", b"key", b"value"]);
/// assert_eq!(bytes, b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n");
/// ```
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(args.iter().map(|a| a.len())));
    encode_command_into(&mut buf, args.iter().copied());
    buf
}

/// Append one encoded command to `buf`.
pub fn encode_command_into<'a, I>(buf: &mut Vec<u8>, args: I)
where
    I: ExactSizeIterator<Item = &'a [u8]>,
{
    let mut itoa_buf = Buffer::new();

    // *<N>\r\n
    buf.push(b'*');
    buf.extend_from_slice(itoa_buf.format(args.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");

    for arg in args {
        // $<len>\r\n<data>\r\n
        buf.push(b'$');
        buf.extend_from_slice(itoa_buf.format(arg.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
}

/// Encode a command from string arguments (convenience wrapper).
pub fn encode_command_str(args: &[&str]) -> Vec<u8> {
    let byte_args: Vec<&[u8]> = args.iter().map(|s| s.as_bytes()).collect();
    encode_command(&byte_args)
}

/// Upper bound of the encoded size of a command with the given argument lengths.
pub(crate) fn encoded_len(arg_lens: impl Iterator<Item = usize>) -> usize {
    let mut cap = 1 + 20 + 2; // '*' + max_digits(usize) + \r\n
    for len in arg_lens {
        cap += 1 + 20 + 2 + len + 2; // '$' + len + \r\n + data + \r\n
    }
    cap
}

/// Encode a reply value into RESP wire format.
pub fn encode_value(value: &RespValue) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value_into(&mut buf, value);
    buf
}

/// Append one encoded reply value to `buf`.
pub fn encode_value_into(buf: &mut Vec<u8>, value: &RespValue) {
    let mut itoa_buf = Buffer::new();
    match value {
        RespValue::SimpleString(s) => {
            buf.push(b'+');
            buf.extend_from_slice(s.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        RespValue::Error(msg) => {
            buf.push(b'-');
            buf.extend_from_slice(msg.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(i) => {
            buf.push(b':');
            buf.extend_from_slice(itoa_buf.format(*i).as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        RespValue::BulkString(data) => {
            buf.push(b'$');
            buf.extend_from_slice(itoa_buf.format(data.len()).as_bytes());
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(data);
            buf.extend_from_slice(b"\r\n");
        }
        RespValue::Array(items) => {
            buf.push(b'*');
            buf.extend_from_slice(itoa_buf.format(items.len()).as_bytes());
            buf.extend_from_slice(b"\r\n");
            for item in items {
                encode_value_into(buf, item);
            }
        }
        RespValue::Null => buf.extend_from_slice(b"$-1\r\n"),
        RespValue::NullArray => buf.extend_from_slice(b"*-1\r\n"),
    }
}

// ── Tests ──────────────────────────────────────────────────────────
