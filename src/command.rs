//! Commands: a normalized name plus binary-safe arguments.
//!
//! ```
//! use kvwire::command::Command;
//!
//! let cmd = Command::new("set").arg("foo").arg(2);
//! assert_eq!(cmd.name(), "SET");
//! assert_eq!(cmd.args().len(), 2);
//! ```

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::resp::codec::Codec;

/// Commands that only read data. A connection failure while waiting for
/// their reply can be retried on a fresh connection without side effects.
pub const READ_ONLY_COMMANDS: &[&str] = &[
    "BITCOUNT", "BITPOS", "DBSIZE", "DUMP", "ECHO", "EXISTS", "GET", "GETBIT",
    "GETRANGE", "HEXISTS", "HGET", "HGETALL", "HKEYS", "HLEN", "HMGET", "HSCAN",
    "HSTRLEN", "HVALS", "INFO", "KEYS", "LINDEX", "LLEN", "LRANGE", "MGET",
    "PING", "PTTL", "RANDOMKEY", "SCAN", "SCARD", "SDIFF", "SINTER",
    "SISMEMBER", "SMEMBERS", "SRANDMEMBER", "SSCAN", "STRLEN", "SUNION", "TIME",
    "TTL", "TYPE", "ZCARD", "ZCOUNT", "ZRANGE", "ZRANGEBYSCORE", "ZRANK",
    "ZREVRANGE", "ZREVRANK", "ZSCAN", "ZSCORE",
];

/// Conversion of a value into one binary-safe command argument.
pub trait ToArg {
    /// Encode this value as a RESP bulk string argument.
    fn to_arg(&self) -> Result<Bytes>;
}

impl ToArg for &str {
    fn to_arg(&self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }
}

impl ToArg for &String {
    fn to_arg(&self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Result<Bytes> {
        Ok(self.clone())
    }
}

impl ToArg for &[u8] {
    fn to_arg(&self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self))
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self))
    }
}

macro_rules! int_to_arg {
    ($($t:ty),*) => {
        $(impl ToArg for $t {
            fn to_arg(&self) -> Result<Bytes> {
                Ok(Bytes::copy_from_slice(itoa::Buffer::new().format(*self).as_bytes()))
            }
        })*
    };
}

int_to_arg!(i32, i64, u16, u32, u64, usize);

impl ToArg for f64 {
    fn to_arg(&self) -> Result<Bytes> {
        if self.is_nan() {
            return Err(Error::Argument("NaN cannot be sent as an argument".into()));
        }
        let s = if self.is_infinite() {
            if *self > 0.0 { "inf".to_string() } else { "-inf".to_string() }
        } else {
            self.to_string()
        };
        Ok(Bytes::from(s))
    }
}

/// One command ready to be encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    args: Vec<Bytes>,
    /// Explicit override of the read-only allowlist.
    retry_safe: Option<bool>,
    /// First argument conversion failure, reported when the command is sent.
    invalid: Option<String>,
}

impl Command {
    /// Start a command. The name is upper-cased.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            args: Vec::new(),
            retry_safe: None,
            invalid: None,
        }
    }

    /// Split a whitespace-separated string into a command (`"SCRIPT LOAD"`).
    pub fn from_str_args(args: &[&str]) -> Self {
        let mut iter = args.iter();
        let mut cmd = Command::new(iter.next().copied().unwrap_or(""));
        for a in iter {
            cmd = cmd.arg(*a);
        }
        cmd
    }

    /// Append one argument.
    pub fn arg<T: ToArg>(mut self, value: T) -> Self {
        self.push_arg(value);
        self
    }

    /// Append several arguments.
    pub fn args_from<T: ToArg>(mut self, values: impl IntoIterator<Item = T>) -> Self {
        for v in values {
            self.push_arg(v);
        }
        self
    }

    /// Append one argument in place.
    pub fn push_arg<T: ToArg>(&mut self, value: T) {
        match value.to_arg() {
            Ok(b) => self.args.push(b),
            Err(e) => {
                if self.invalid.is_none() {
                    self.invalid = Some(e.to_string());
                }
            }
        }
    }

    /// Mark whether this command may be retried on a fresh connection.
    pub fn retry_safe(mut self, safe: bool) -> Self {
        self.retry_safe = Some(safe);
        self
    }

    /// Command name, upper-cased.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments after the name.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Whether the single fresh-connection retry may be applied.
    pub fn is_retry_safe(&self) -> bool {
        self.retry_safe
            .unwrap_or_else(|| READ_ONLY_COMMANDS.contains(&self.name.as_str()))
    }

    /// Fail if the command cannot be put on the wire.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Argument("empty command name".into()));
        }
        if let Some(ref reason) = self.invalid {
            return Err(Error::Argument(format!("{}: {reason}", self.name)));
        }
        Ok(())
    }

    /// Append this command's wire encoding to `buf`.
    pub fn encode_into(&self, codec: &dyn Codec, buf: &mut Vec<u8>) -> Result<()> {
        self.validate()?;
        let mut parts: Vec<&[u8]> = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.name.as_bytes());
        parts.extend(self.args.iter().map(|a| a.as_ref()));
        codec.encode(&parts, buf);
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────
