//! Server-side script caching.
//!
//! Scripts are invoked by SHA-1 digest. When the server reports that it does
//! not know the digest, the body is loaded with `SCRIPT LOAD` and the
//! invocation is retried exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tracing::debug;

use crate::command::{Command, ToArg};
use crate::connection::conn::RedisConnection;
use crate::error::{Error, Result};
use crate::executor::CommandExecutor;
use crate::resp::types::RespValue;
use crate::response::Value;

/// Lowercase hex SHA-1 of a script body, as the server computes it.
pub fn sha1_hex(body: &[u8]) -> String {
    sha1_smol::Sha1::from(body).digest().to_string()
}

/// Keys and arguments for one script invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptCall {
    keys: Vec<Bytes>,
    args: Vec<Bytes>,
    invalid: Option<String>,
}

impl ScriptCall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a key (`KEYS[n]` in the script).
    pub fn key<T: ToArg>(mut self, key: T) -> Self {
        match key.to_arg() {
            Ok(b) => self.keys.push(b),
            Err(e) => {
                self.invalid.get_or_insert(e.to_string());
            }
        }
        self
    }

    /// Append an argument (`ARGV[n]` in the script).
    pub fn arg<T: ToArg>(mut self, arg: T) -> Self {
        match arg.to_arg() {
            Ok(b) => self.args.push(b),
            Err(e) => {
                self.invalid.get_or_insert(e.to_string());
            }
        }
        self
    }

    pub fn keys(&self) -> &[Bytes] {
        &self.keys
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// `EVALSHA sha numkeys key… arg…`
    pub fn evalsha(&self, sha: &str) -> Result<Command> {
        if let Some(ref reason) = self.invalid {
            return Err(Error::Argument(format!("EVALSHA: {reason}")));
        }
        Ok(Command::new("EVALSHA")
            .arg(sha)
            .arg(self.keys.len())
            .args_from(self.keys.iter().cloned())
            .args_from(self.args.iter().cloned()))
    }
}

struct ScriptInner {
    body: Bytes,
    sha: String,
    /// Whether the server is believed to have the body cached.
    assumed_loaded: AtomicBool,
    executor: CommandExecutor,
}

/// A registered script bound to a default executor. Cheap to clone.
#[derive(Clone)]
pub struct Script {
    inner: Arc<ScriptInner>,
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script").field("sha", &self.inner.sha).finish()
    }
}

impl Script {
    fn new(body: Bytes, executor: CommandExecutor) -> Self {
        let sha = sha1_hex(&body);
        Self {
            inner: Arc::new(ScriptInner {
                body,
                sha,
                assumed_loaded: AtomicBool::new(true),
                executor,
            }),
        }
    }

    /// Hex digest used as the server-side cache key.
    pub fn sha(&self) -> &str {
        &self.inner.sha
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    /// False between a cache-miss reply and the reload that follows it.
    pub fn assumed_loaded(&self) -> bool {
        self.inner.assumed_loaded.load(Ordering::Acquire)
    }

    /// Invoke on the default executor.
    pub async fn invoke(&self, call: &ScriptCall) -> Result<Value> {
        self.invoke_with(call, &self.inner.executor).await
    }

    /// Invoke on `executor`: EVALSHA, and on NOSCRIPT load the body and
    /// retry once. Other errors propagate untouched.
    pub async fn invoke_with(&self, call: &ScriptCall, executor: &CommandExecutor) -> Result<Value> {
        let cmd = call.evalsha(self.sha())?;
        match executor.execute(&cmd).await {
            Err(e) if e.is_no_script() => {
                self.inner.assumed_loaded.store(false, Ordering::Release);
                debug!(sha = self.sha(), "script not cached on server, loading");
                self.load(executor).await?;
                executor.execute(&cmd).await
            }
            other => other,
        }
    }

    /// `SCRIPT LOAD` through a pooled connection.
    pub async fn load(&self, executor: &CommandExecutor) -> Result<()> {
        let reply = executor.execute_raw(&self.load_command()).await?;
        self.check_loaded(reply)
    }

    /// `SCRIPT LOAD` on a connection the caller holds.
    pub async fn load_on(&self, conn: &mut RedisConnection) -> Result<()> {
        let reply = conn.execute(&self.load_command()).await?;
        if let RespValue::Error(msg) = reply {
            return Err(Error::redis(msg));
        }
        self.check_loaded(reply)
    }

    fn load_command(&self) -> Command {
        Command::new("SCRIPT").arg("LOAD").arg(self.inner.body.clone())
    }

    fn check_loaded(&self, reply: RespValue) -> Result<()> {
        match reply.as_str() {
            Some(sha) if sha.eq_ignore_ascii_case(self.sha()) => {
                self.inner.assumed_loaded.store(true, Ordering::Release);
                Ok(())
            }
            _ => Err(Error::Protocol(format!(
                "SCRIPT LOAD returned an unexpected reply ({}) for {}",
                reply.type_name(),
                self.sha()
            ))),
        }
    }
}

/// Registry of scripts by digest, bound to one default executor.
pub struct ScriptCache {
    executor: CommandExecutor,
    scripts: SyncMutex<HashMap<String, Script>>,
}

impl ScriptCache {
    pub fn new(executor: CommandExecutor) -> Self {
        Self {
            executor,
            scripts: SyncMutex::new(HashMap::new()),
        }
    }

    /// Register a body. Registering the same body twice returns the same
    /// handle.
    pub fn register(&self, body: impl Into<Bytes>) -> Script {
        let body = body.into();
        let sha = sha1_hex(&body);
        self.scripts
            .lock()
            .entry(sha)
            .or_insert_with(|| Script::new(body, self.executor.clone()))
            .clone()
    }

    pub fn get(&self, sha: &str) -> Option<Script> {
        self.scripts.lock().get(sha).cloned()
    }

    pub fn len(&self) -> usize {
        self.scripts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.lock().is_empty()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
