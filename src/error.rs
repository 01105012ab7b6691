use std::io;

// ── Error taxonomy ─────────────────────────────────────────────────
//
//  Error
//  ├── Connection        transport failed to connect / write / read
//  ├── Timeout           deadline exceeded (connection is marked broken)
//  ├── Protocol          malformed RESP data
//  ├── Redis             server error reply, classified by RedisErrorKind
//  ├── Aborted           EXEC returned a null array (watched key changed)
//  ├── MasterNotFound    ┐ sentinel discovery exhausted every candidate;
//  ├── ReplicaNotFound   ┘ narrowings of the connection-failure family
//  ├── Argument          a value could not be turned into a command argument
//  ├── PoolExhausted     no connection became available within pool timeout
//  └── Usage             API misuse (closed pubsub, worker without handlers…)

/// Structured Redis error kinds for programmatic matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisErrorKind {
    /// Generic ERR
    Err,
    /// WRONGTYPE Operation against a key holding the wrong kind of value
    WrongType,
    /// NOSCRIPT No matching script
    NoScript,
    /// EXECABORT Transaction discarded because of previous errors
    ExecAbort,
    /// LOADING Redis is loading the dataset in memory
    Loading,
    /// READONLY You can't write against a read only replica
    ReadOnly,
    /// BUSY Redis is busy running a script
    Busy,
    /// Any other Redis error prefix
    Other(String),
}

impl RedisErrorKind {
    /// Parse from a Redis error message string (e.g. "WRONGTYPE Operation against…").
    pub fn from_error_msg(msg: &str) -> (Self, String) {
        let kind = if msg.starts_with("WRONGTYPE") {
            Self::WrongType
        } else if msg.starts_with("NOSCRIPT") {
            Self::NoScript
        } else if msg.starts_with("EXECABORT") {
            Self::ExecAbort
        } else if msg.starts_with("LOADING") {
            Self::Loading
        } else if msg.starts_with("READONLY") {
            Self::ReadOnly
        } else if msg.starts_with("BUSY") {
            Self::Busy
        } else if msg.starts_with("ERR") {
            Self::Err
        } else {
            // Extract first word as error kind
            let prefix = msg.split_whitespace().next().unwrap_or("UNKNOWN");
            Self::Other(prefix.to_string())
        };
        (kind, msg.to_string())
    }

    /// The short error-code token as sent by the server.
    pub fn code(&self) -> &str {
        match self {
            Self::Err => "ERR",
            Self::WrongType => "WRONGTYPE",
            Self::NoScript => "NOSCRIPT",
            Self::ExecAbort => "EXECABORT",
            Self::Loading => "LOADING",
            Self::ReadOnly => "READONLY",
            Self::Busy => "BUSY",
            Self::Other(code) => code,
        }
    }
}

/// All error variants for kvwire.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// TCP / Unix socket level errors
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),
    /// Connect or read deadline exceeded
    #[error("timeout: {0}")]
    Timeout(String),
    /// RESP protocol parse errors
    #[error("protocol error: {0}")]
    Protocol(String),
    /// RESP parser needs more data. Control flow, not a real failure.
    #[error("incomplete RESP message")]
    Incomplete,
    /// Redis returned an error reply with structured kind
    #[error("redis error: {message}")]
    Redis {
        kind: RedisErrorKind,
        message: String,
    },
    /// A transaction was aborted because a watched key changed.
    #[error("transaction aborted: watched key changed before EXEC")]
    Aborted,
    /// No sentinel could name a reachable master.
    #[error("master not found: {0}")]
    MasterNotFound(String),
    /// Neither a replica nor the fallback master could be reached.
    #[error("replica not found: {0}")]
    ReplicaNotFound(String),
    /// A command argument could not be serialized.
    #[error("invalid argument: {0}")]
    Argument(String),
    /// Pool timeout elapsed with every connection checked out.
    #[error("connection pool exhausted (max size: {max_size})")]
    PoolExhausted { max_size: usize },
    /// The API was used in a way the current state does not allow.
    #[error("usage error: {0}")]
    Usage(String),
}

impl Error {
    /// Create a Redis error from a raw error message, auto-parsing the kind.
    pub fn redis(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let (kind, message) = RedisErrorKind::from_error_msg(&msg);
        Self::Redis { kind, message }
    }

    /// Transport-level failures: the connection that produced them is unusable.
    ///
    /// Sentinel not-found conditions are included since they narrow the
    /// "could not get a working connection" family.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Timeout(_)
                | Self::MasterNotFound(_)
                | Self::ReplicaNotFound(_)
        )
    }

    /// Failures eligible for the single fresh-connection retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Returns the server error kind for response errors.
    pub fn redis_kind(&self) -> Option<&RedisErrorKind> {
        match self {
            Self::Redis { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Check if this is a NOSCRIPT cache miss.
    pub fn is_no_script(&self) -> bool {
        matches!(self.redis_kind(), Some(RedisErrorKind::NoScript))
    }

    /// Check if this is a READONLY reply (write sent to a demoted master).
    pub fn is_read_only(&self) -> bool {
        matches!(self.redis_kind(), Some(RedisErrorKind::ReadOnly))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_error_kind_err() {
        let (kind, msg) = RedisErrorKind::from_error_msg("ERR unknown command 'FOO'");
        assert_eq!(kind, RedisErrorKind::Err);
        assert_eq!(msg, "ERR unknown command 'FOO'");
    }

    #[test]
    fn test_redis_error_kind_wrongtype() {
        let (kind, _) =
            RedisErrorKind::from_error_msg("WRONGTYPE Operation against a key holding wrong type");
        assert_eq!(kind, RedisErrorKind::WrongType);
    }

    #[test]
    fn test_redis_error_kind_noscript() {
        let (kind, _) = RedisErrorKind::from_error_msg("NOSCRIPT No matching script");
        assert_eq!(kind, RedisErrorKind::NoScript);
        assert_eq!(kind.code(), "NOSCRIPT");
    }

    #[test]
    fn test_redis_error_kind_execabort() {
        let (kind, _) = RedisErrorKind::from_error_msg(
            "EXECABORT Transaction discarded because of previous errors.",
        );
        assert_eq!(kind, RedisErrorKind::ExecAbort);
    }

    #[test]
    fn test_redis_error_kind_readonly() {
        let (kind, _) =
            RedisErrorKind::from_error_msg("READONLY You can't write against a read only replica");
        assert_eq!(kind, RedisErrorKind::ReadOnly);
    }

    #[test]
    fn test_redis_error_kind_other() {
        let (kind, _) = RedisErrorKind::from_error_msg("CUSTOMPREFIX something happened");
        assert_eq!(kind, RedisErrorKind::Other("CUSTOMPREFIX".to_string()));
        assert_eq!(kind.code(), "CUSTOMPREFIX");
    }

    #[test]
    fn test_error_display() {
        let err = Error::Connection(io::Error::new(io::ErrorKind::Other, "refused"));
        assert!(err.to_string().contains("connection error"));

        let err = Error::Protocol("bad input".into());
        assert_eq!(err.to_string(), "protocol error: bad input");

        let err = Error::redis("ERR unknown command");
        assert_eq!(err.to_string(), "redis error: ERR unknown command");

        let err = Error::Timeout("3s exceeded".into());
        assert_eq!(err.to_string(), "timeout: 3s exceeded");

        let err = Error::MasterNotFound("mymaster".into());
        assert_eq!(err.to_string(), "master not found: mymaster");

        let err = Error::PoolExhausted { max_size: 4 };
        assert_eq!(err.to_string(), "connection pool exhausted (max size: 4)");
    }

    #[test]
    fn test_connection_failure_family() {
        assert!(Error::Timeout("x".into()).is_connection_failure());
        assert!(Error::MasterNotFound("m".into()).is_connection_failure());
        assert!(Error::ReplicaNotFound("m".into()).is_connection_failure());
        assert!(!Error::redis("ERR nope").is_connection_failure());
        assert!(!Error::Aborted.is_connection_failure());

        // not-found is fatal to discovery, never retried by the executor
        assert!(!Error::MasterNotFound("m".into()).is_retryable());
        assert!(Error::Timeout("x".into()).is_retryable());
    }

    #[test]
    fn test_no_script_helpers() {
        let err = Error::redis("NOSCRIPT No matching script. Please use EVAL.");
        assert!(err.is_no_script());
        assert!(!err.is_read_only());
        assert!(!Error::Aborted.is_no_script());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "refused");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Connection(_)));
    }
}
