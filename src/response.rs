//! Caller-facing reply values and per-command response transforms.
//!
//! A raw [`RespValue`] is first turned into a [`Value`] by a [`Decoder`]
//! (bulk strings become text or stay bytes depending on the client's decoding
//! mode), then shaped by the [`ResponseCallback`] registered for the command
//! name in an immutable [`ResponseCallbacks`] table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::resp::types::RespValue;

/// A decoded, caller-facing reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null bulk string or null array.
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Bulk string kept as raw bytes.
    Bytes(Bytes),
    /// Bulk string decoded as text.
    Text(String),
    /// Status line such as `OK` or `PONG`.
    Status(String),
    List(Vec<Value>),
    /// Ordered key/value pairs.
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Text view of `Text`, `Status` and UTF-8 `Bytes`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Status(s) => Some(s),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Byte view of any string-like value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) | Value::Status(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Integer view. String values holding a decimal integer also qualify.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            other => other.as_str().and_then(|s| s.parse().ok()),
        }
    }

    /// Floating-point view.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            other => other.as_str().and_then(parse_float),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Take the elements of a `List`; `Nil` yields an empty list.
    pub fn into_list(self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            Value::Nil => Some(Vec::new()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Value::Text(s) | Value::Status(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

fn parse_float(s: &str) -> Option<f64> {
    match s {
        "inf" | "+inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        _ => s.parse().ok(),
    }
}

// ── Decoding ───────────────────────────────────────────────────────

/// What to do with bulk strings that are not valid in the configured encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingErrors {
    /// Fail the reply with a protocol error.
    Strict,
    /// Substitute U+FFFD for invalid sequences.
    Replace,
    /// Keep the raw bytes.
    #[default]
    Passthrough,
}

/// Converts raw replies into [`Value`]s according to the decoding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Decoder {
    decode_responses: bool,
    errors: EncodingErrors,
}

impl Decoder {
    /// Build a decoder. Only UTF-8 is supported as a text encoding.
    pub fn new(decode_responses: bool, encoding: &str, errors: EncodingErrors) -> Result<Self> {
        check_encoding(encoding)?;
        Ok(Self { decode_responses, errors })
    }

    /// Decoder that leaves bulk strings as bytes.
    pub fn raw() -> Self {
        Self::default()
    }

    pub fn decodes_text(&self) -> bool {
        self.decode_responses
    }

    /// Convert one reply. Error replies anywhere in the tree become
    /// [`Error::Redis`].
    pub fn value(&self, resp: RespValue) -> Result<Value> {
        match resp {
            RespValue::SimpleString(s) => Ok(Value::Status(s)),
            RespValue::Error(msg) => Err(Error::redis(msg)),
            RespValue::Integer(i) => Ok(Value::Int(i)),
            RespValue::BulkString(b) => self.bulk(b),
            RespValue::Array(items) => items
                .into_iter()
                .map(|item| self.value(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            RespValue::Null | RespValue::NullArray => Ok(Value::Nil),
        }
    }

    fn bulk(&self, b: Bytes) -> Result<Value> {
        if !self.decode_responses {
            return Ok(Value::Bytes(b));
        }
        match std::str::from_utf8(&b) {
            Ok(s) => Ok(Value::Text(s.to_string())),
            Err(e) => match self.errors {
                EncodingErrors::Strict => {
                    Err(Error::Protocol(format!("reply is not valid utf-8: {e}")))
                }
                EncodingErrors::Replace => Ok(Value::Text(String::from_utf8_lossy(&b).into_owned())),
                EncodingErrors::Passthrough => Ok(Value::Bytes(b)),
            },
        }
    }
}

/// Accept the spellings of UTF-8; anything else is an argument error.
pub fn check_encoding(encoding: &str) -> Result<()> {
    match encoding.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" | "utf_8" => Ok(()),
        other => Err(Error::Argument(format!("unsupported encoding: {other}"))),
    }
}

// ── Transforms ─────────────────────────────────────────────────────

/// Pure reply transform applied after decoding.
pub type ResponseCallback = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Immutable table from command name to transform. Commands without an entry
/// pass their reply through unchanged.
#[derive(Clone, Default)]
pub struct ResponseCallbacks {
    table: HashMap<String, ResponseCallback>,
}

impl fmt::Debug for ResponseCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.table.keys().collect();
        names.sort();
        f.debug_struct("ResponseCallbacks").field("commands", &names).finish()
    }
}

const STATUS_OK_COMMANDS: &[&str] = &[
    "AUTH", "FLUSHALL", "FLUSHDB", "HMSET", "LSET", "LTRIM", "MSET", "PSETEX",
    "RENAME", "SELECT", "SET", "SETEX", "UNWATCH", "WATCH",
];

const INT_BOOL_COMMANDS: &[&str] = &[
    "EXPIRE", "EXPIREAT", "HSETNX", "MOVE", "MSETNX", "PERSIST", "PEXPIRE",
    "PEXPIREAT", "RENAMENX", "SETNX", "SISMEMBER", "SMOVE",
];

const FLOAT_COMMANDS: &[&str] = &["HINCRBYFLOAT", "INCRBYFLOAT", "ZINCRBY", "ZSCORE"];

impl ResponseCallbacks {
    /// Table with no transforms.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The stock table for common commands.
    pub fn defaults() -> Self {
        let status_ok: ResponseCallback = Arc::new(status_ok_to_bool);
        let int_bool: ResponseCallback = Arc::new(int_to_bool);
        let float: ResponseCallback = Arc::new(to_float);

        let mut table: HashMap<String, ResponseCallback> = HashMap::new();
        for name in STATUS_OK_COMMANDS {
            table.insert((*name).to_string(), status_ok.clone());
        }
        for name in INT_BOOL_COMMANDS {
            table.insert((*name).to_string(), int_bool.clone());
        }
        for name in FLOAT_COMMANDS {
            table.insert((*name).to_string(), float.clone());
        }
        table.insert("PING".into(), Arc::new(pong_to_bool));
        table.insert("HGETALL".into(), Arc::new(pairs_to_map));
        Self { table }
    }

    /// Return a copy of this table with `name` mapped to `callback`.
    pub fn with<F>(mut self, name: &str, callback: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.table.insert(name.to_ascii_uppercase(), Arc::new(callback));
        self
    }

    /// Return a copy of this table without an entry for `name`.
    pub fn without(mut self, name: &str) -> Self {
        self.table.remove(&name.to_ascii_uppercase());
        self
    }

    pub fn get(&self, name: &str) -> Option<&ResponseCallback> {
        self.table.get(name)
    }

    /// Apply the transform for `name` (already upper-cased), or identity.
    pub fn apply(&self, name: &str, value: Value) -> Result<Value> {
        match self.table.get(name) {
            Some(cb) => cb(value),
            None => Ok(value),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

fn status_ok_to_bool(v: Value) -> Result<Value> {
    Ok(match v {
        Value::Status(s) => Value::Bool(s == "OK"),
        other => other,
    })
}

fn pong_to_bool(v: Value) -> Result<Value> {
    Ok(match v {
        Value::Status(s) => Value::Bool(s == "PONG"),
        other => other,
    })
}

fn int_to_bool(v: Value) -> Result<Value> {
    Ok(match v {
        Value::Int(i) => Value::Bool(i != 0),
        other => other,
    })
}

fn to_float(v: Value) -> Result<Value> {
    match v {
        Value::Nil => Ok(Value::Nil),
        other => other
            .as_float()
            .map(Value::Float)
            .ok_or_else(|| Error::Protocol(format!("expected a float reply, got {other}"))),
    }
}

fn pairs_to_map(v: Value) -> Result<Value> {
    match v {
        Value::List(items) => {
            if items.len() % 2 != 0 {
                return Err(Error::Protocol(format!(
                    "expected an even number of elements, got {}",
                    items.len()
                )));
            }
            let mut pairs = Vec::with_capacity(items.len() / 2);
            let mut iter = items.into_iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                pairs.push((k, v));
            }
            Ok(Value::Map(pairs))
        }
        other => Ok(other),
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &'static [u8]) -> RespValue {
        RespValue::BulkString(Bytes::from_static(s))
    }

    #[test]
    fn raw_decoder_keeps_bytes() {
        let v = Decoder::raw().value(bulk(b"2")).unwrap();
        assert_eq!(v, Value::Bytes(Bytes::from_static(b"2")));
    }

    #[test]
    fn text_decoder_decodes_bulk() {
        let d = Decoder::new(true, "UTF-8", EncodingErrors::Strict).unwrap();
        assert_eq!(d.value(bulk(b"hi")).unwrap(), Value::Text("hi".into()));
    }

    #[test]
    fn both_nulls_become_nil() {
        let d = Decoder::raw();
        assert_eq!(d.value(RespValue::Null).unwrap(), Value::Nil);
        assert_eq!(d.value(RespValue::NullArray).unwrap(), Value::Nil);
    }

    #[test]
    fn nested_error_fails_the_reply() {
        let reply = RespValue::Array(vec![RespValue::Integer(1), RespValue::Error("ERR x".into())]);
        assert!(matches!(Decoder::raw().value(reply), Err(Error::Redis { .. })));
    }

    #[test]
    fn invalid_utf8_per_policy() {
        let data = bulk(&[0xff, b'a']);
        let strict = Decoder::new(true, "utf8", EncodingErrors::Strict).unwrap();
        assert!(matches!(strict.value(data.clone()), Err(Error::Protocol(_))));

        let replace = Decoder::new(true, "utf8", EncodingErrors::Replace).unwrap();
        assert_eq!(replace.value(data.clone()).unwrap(), Value::Text("\u{fffd}a".into()));

        let pass = Decoder::new(true, "utf8", EncodingErrors::Passthrough).unwrap();
        assert!(matches!(pass.value(data).unwrap(), Value::Bytes(_)));
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        assert!(matches!(
            Decoder::new(true, "latin-1", EncodingErrors::Strict),
            Err(Error::Argument(_))
        ));
    }

    #[test]
    fn default_table_shapes_common_commands() {
        let cb = ResponseCallbacks::defaults();
        assert_eq!(cb.apply("SET", Value::Status("OK".into())).unwrap(), Value::Bool(true));
        assert_eq!(cb.apply("SET", Value::Nil).unwrap(), Value::Nil);
        assert_eq!(cb.apply("PING", Value::Status("PONG".into())).unwrap(), Value::Bool(true));
        assert_eq!(cb.apply("EXPIRE", Value::Int(0)).unwrap(), Value::Bool(false));
        assert_eq!(
            cb.apply("INCRBYFLOAT", Value::Text("10.5".into())).unwrap(),
            Value::Float(10.5)
        );
        assert_eq!(
            cb.apply("GET", Value::Text("2".into())).unwrap(),
            Value::Text("2".into())
        );
    }

    #[test]
    fn hgetall_becomes_map() {
        let cb = ResponseCallbacks::defaults();
        let list = Value::List(vec!["a".into(), "1".into(), "b".into(), "2".into()]);
        assert_eq!(
            cb.apply("HGETALL", list).unwrap(),
            Value::Map(vec![("a".into(), "1".into()), ("b".into(), "2".into())])
        );
        let odd = Value::List(vec!["a".into()]);
        assert!(cb.apply("HGETALL", odd).is_err());
    }

    #[test]
    fn override_replaces_single_entry() {
        let base = ResponseCallbacks::defaults();
        let custom = base.clone().with("get", |v| Ok(Value::Int(v.as_int().unwrap_or(-1))));
        assert_eq!(custom.apply("GET", Value::Text("7".into())).unwrap(), Value::Int(7));
        // original table untouched
        assert_eq!(base.apply("GET", Value::Text("7".into())).unwrap(), Value::Text("7".into()));
        assert_eq!(custom.len(), base.len() + 1);

        let stripped = base.without("set");
        assert_eq!(
            stripped.apply("SET", Value::Status("OK".into())).unwrap(),
            Value::Status("OK".into())
        );
    }

    #[test]
    fn value_views() {
        assert_eq!(Value::Text("12".into()).as_int(), Some(12));
        assert_eq!(Value::Bytes(Bytes::from_static(b"1.5")).as_float(), Some(1.5));
        assert_eq!(Value::Text("inf".into()).as_float(), Some(f64::INFINITY));
        assert_eq!(Value::Status("OK".into()).as_str(), Some("OK"));
        assert_eq!(Value::Nil.into_list(), Some(vec![]));
        assert_eq!(Value::List(vec![Value::Int(1), Value::Nil]).to_string(), "[1, nil]");
    }
}
