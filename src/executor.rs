//! The single-command path: acquire, send, receive, release, transform.

use std::sync::Arc;

use tracing::warn;

use crate::command::Command;
use crate::config::ConnectionConfig;
use crate::connection::conn::RedisConnection;
use crate::connection::pool::{ConnectionPool, ConnectionSource};
use crate::error::{Error, Result};
use crate::resp::types::RespValue;
use crate::response::{Decoder, ResponseCallbacks, Value};

/// Executes commands over a pool. Cheap to clone; clones share the pool and
/// the transform table.
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    pool: ConnectionPool,
    decoder: Decoder,
    callbacks: Arc<ResponseCallbacks>,
}

impl CommandExecutor {
    /// Executor over a new pool for `config`, with the default transforms.
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        Self::with_pool(ConnectionPool::new(config), ResponseCallbacks::defaults())
    }

    /// Executor over an existing pool.
    pub fn with_pool(pool: ConnectionPool, callbacks: ResponseCallbacks) -> Result<Self> {
        let decoder = pool.config().decoder()?;
        Ok(Self {
            pool,
            decoder,
            callbacks: Arc::new(callbacks),
        })
    }

    /// Same pool, different transform table.
    pub fn with_callbacks(&self, callbacks: ResponseCallbacks) -> Self {
        Self {
            pool: self.pool.clone(),
            decoder: self.decoder,
            callbacks: Arc::new(callbacks),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn decoder(&self) -> Decoder {
        self.decoder
    }

    pub fn callbacks(&self) -> &ResponseCallbacks {
        &self.callbacks
    }

    /// Execute one command and shape its reply.
    pub async fn execute(&self, cmd: &Command) -> Result<Value> {
        let raw = self.execute_raw(cmd).await?;
        self.shape(cmd, raw)
    }

    /// Execute one command and return the undecoded reply. Error replies
    /// come back as [`Error::Redis`].
    ///
    /// A connection or timeout failure is retried once on a freshly
    /// established connection when `retry_on_timeout` is set and the command
    /// is retry-safe.
    pub async fn execute_raw(&self, cmd: &Command) -> Result<RespValue> {
        cmd.validate()?;
        let mut guard = self.pool.get().await?;
        match self.execute_on(guard.conn()?, cmd).await {
            Err(e) if e.is_retryable() && self.may_retry(cmd) => {
                drop(guard);
                warn!(command = cmd.name(), error = %e, "retrying on a fresh connection");
                let mut fresh = self.pool.get_fresh().await?;
                self.execute_on(fresh.conn()?, cmd).await
            }
            other => other,
        }
    }

    /// Run one command on a connection the caller already holds.
    pub async fn execute_on(&self, conn: &mut RedisConnection, cmd: &Command) -> Result<RespValue> {
        let reply = conn.execute(cmd).await?;
        self.check_reply(conn, reply)
    }

    /// Turn an error reply into an error. A READONLY reply means the server
    /// was demoted: drop the connection and forget the cached master.
    pub(crate) fn check_reply(&self, conn: &mut RedisConnection, reply: RespValue) -> Result<RespValue> {
        match reply {
            RespValue::Error(msg) => {
                let err = Error::redis(msg);
                if err.is_read_only() {
                    conn.mark_broken();
                    self.pool.source().report_read_only();
                }
                Err(err)
            }
            other => Ok(other),
        }
    }

    /// Decode a raw reply and apply the transform for `cmd`.
    pub fn shape(&self, cmd: &Command, raw: RespValue) -> Result<Value> {
        let value = self.decoder.value(raw)?;
        self.callbacks.apply(cmd.name(), value)
    }

    pub(crate) fn may_retry(&self, cmd: &Command) -> bool {
        self.pool.config().retry_on_timeout && cmd.is_retry_safe()
    }

    /// Whether this executor talks to a sentinel-managed master.
    pub fn is_sentinel_master(&self) -> bool {
        matches!(self.pool.source(), ConnectionSource::SentinelMaster { .. })
    }
}

// ── Tests ──────────────────────────────────────────────────────────
