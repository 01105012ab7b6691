//! Batched and transactional command execution.
//!
//! Commands are queued locally and sent in one write when the pipeline runs.
//! A run monopolizes one pooled connection. In transactional mode the batch
//! is wrapped in `MULTI`/`EXEC`; the `QUEUED` acknowledgements are consumed
//! and the real results come from the `EXEC` reply.
//!
//! `watch` pins a connection for optimistic locking. Until `multi` is called
//! the pipeline can run commands immediately on that connection
//! ([`Pipeline::execute_command`]), e.g. to read the watched keys.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::command::Command;
use crate::connection::conn::RedisConnection;
use crate::connection::pool::PoolGuard;
use crate::error::{Error, Result};
use crate::executor::CommandExecutor;
use crate::resp::types::RespValue;
use crate::response::Value;
use crate::script::{Script, ScriptCall};

struct Queued {
    cmd: Command,
    /// Set for script invocations, which need their body on the server.
    script: Option<Script>,
}

/// An ordered batch of commands.
pub struct Pipeline {
    executor: CommandExecutor,
    queue: Vec<Queued>,
    transaction: bool,
    explicit_multi: bool,
    watching: bool,
    /// Connection pinned by `watch`.
    conn: Option<PoolGuard>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("queued", &self.queue.len())
            .field("transaction", &self.is_transaction())
            .field("watching", &self.watching)
            .finish()
    }
}

impl Pipeline {
    pub fn new(executor: CommandExecutor, transaction: bool) -> Self {
        Self {
            executor,
            queue: Vec::new(),
            transaction,
            explicit_multi: false,
            watching: false,
            conn: None,
        }
    }

    /// Queue a command. Nothing is sent until the pipeline runs.
    pub fn cmd(&mut self, cmd: Command) -> &mut Self {
        self.queue.push(Queued { cmd, script: None });
        self
    }

    /// Queue a script invocation. The body is loaded on the pipeline's
    /// connection before the batch runs if the server does not have it.
    pub fn invoke_script(&mut self, script: &Script, call: &ScriptCall) -> Result<&mut Self> {
        let cmd = call.evalsha(script.sha())?;
        self.queue.push(Queued {
            cmd,
            script: Some(script.clone()),
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether the batch will be wrapped in `MULTI`/`EXEC`.
    pub fn is_transaction(&self) -> bool {
        self.transaction || self.explicit_multi
    }

    pub fn is_watching(&self) -> bool {
        self.watching
    }

    /// `WATCH` keys on a connection pinned to this pipeline.
    pub async fn watch(&mut self, keys: &[&str]) -> Result<()> {
        if self.explicit_multi {
            return Err(Error::Usage("WATCH cannot be issued after MULTI".into()));
        }
        if keys.is_empty() {
            return Err(Error::Argument("WATCH needs at least one key".into()));
        }
        if self.conn.is_none() {
            self.conn = Some(self.executor.pool().get().await?);
        }
        let Some(guard) = self.conn.as_mut() else {
            return Err(Error::Usage("pipeline has no connection".into()));
        };
        let cmd = Command::new("WATCH").args_from(keys.iter().copied());
        match self.executor.execute_on(guard.conn()?, &cmd).await {
            Ok(reply) if reply.is_status("OK") => {
                self.watching = true;
                Ok(())
            }
            Ok(reply) => {
                guard.discard();
                self.conn = None;
                self.watching = false;
                Err(Error::Protocol(format!("unexpected WATCH reply: {}", reply.type_name())))
            }
            Err(e) => {
                if e.is_connection_failure() || !self.watching {
                    self.conn = None;
                    self.watching = false;
                }
                Err(e)
            }
        }
    }

    /// Drop every watch and release the pinned connection.
    pub async fn unwatch(&mut self) -> Result<()> {
        let was_watching = std::mem::replace(&mut self.watching, false);
        let Some(mut guard) = self.conn.take() else {
            return Ok(());
        };
        if was_watching {
            if let Err(e) = self.executor.execute_on(guard.conn()?, &Command::new("UNWATCH")).await {
                guard.discard();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Start buffering a transaction after `watch`.
    pub fn multi(&mut self) -> Result<()> {
        if self.explicit_multi {
            return Err(Error::Usage("MULTI calls cannot be nested".into()));
        }
        if !self.queue.is_empty() {
            return Err(Error::Usage(
                "commands are already queued; call multi() before queueing".into(),
            ));
        }
        self.explicit_multi = true;
        Ok(())
    }

    /// Run one command right away on the watched connection.
    pub async fn execute_command(&mut self, cmd: &Command) -> Result<Value> {
        if !self.watching || self.explicit_multi {
            return Err(Error::Usage(
                "immediate commands need an active WATCH and no MULTI".into(),
            ));
        }
        let Some(guard) = self.conn.as_mut() else {
            return Err(Error::Usage("pipeline has no connection".into()));
        };
        cmd.validate()?;
        match self.executor.execute_on(guard.conn()?, cmd).await {
            Ok(raw) => self.executor.shape(cmd, raw),
            Err(e) => {
                if e.is_connection_failure() {
                    // the watch died with the connection
                    self.conn = None;
                    self.watching = false;
                }
                Err(e)
            }
        }
    }

    /// Run the batch; the first failing command's error is returned.
    ///
    /// A transaction whose watched keys changed fails with
    /// [`Error::Aborted`] and yields no results.
    pub async fn execute(&mut self) -> Result<Vec<Value>> {
        self.execute_all().await?.into_iter().collect()
    }

    /// Run the batch and return one result per queued command, in order.
    ///
    /// The outer error covers failures of the batch as a whole: transport,
    /// abort, or a transaction rejected because a command failed to queue.
    /// The pipeline is reset afterwards either way.
    pub async fn execute_all(&mut self) -> Result<Vec<Result<Value>>> {
        let outcome = if self.queue.is_empty() {
            Ok(Vec::new())
        } else {
            self.run().await
        };
        self.reset().await;
        outcome
    }

    /// Clear the queue and transaction state; `UNWATCH` if needed and
    /// release the pinned connection.
    pub async fn reset(&mut self) {
        self.queue.clear();
        self.explicit_multi = false;
        if let Some(mut guard) = self.conn.take() {
            if self.watching {
                let unwatch = Command::new("UNWATCH");
                if let Ok(conn) = guard.conn() {
                    if self.executor.execute_on(conn, &unwatch).await.is_err() {
                        guard.discard();
                    }
                }
            }
        }
        self.watching = false;
    }

    async fn run(&mut self) -> Result<Vec<Result<Value>>> {
        for q in &self.queue {
            q.cmd.validate()?;
        }
        let mut guard = match self.conn.take() {
            Some(guard) => guard,
            None => self.executor.pool().get().await?,
        };
        let outcome = match self.run_on(guard.conn()?).await {
            Err(e) if self.may_retry(&e) => {
                drop(guard);
                warn!(commands = self.queue.len(), error = %e, "retrying pipeline on a fresh connection");
                guard = self.executor.pool().get_fresh().await?;
                self.run_on(guard.conn()?).await
            }
            other => other,
        };
        if self.is_transaction() {
            // EXEC drops every watch on the server
            self.watching = false;
        }
        self.conn = Some(guard);
        outcome
    }

    async fn run_on(&self, conn: &mut RedisConnection) -> Result<Vec<Result<Value>>> {
        self.load_scripts(conn).await?;
        if self.is_transaction() {
            self.run_transaction(conn).await
        } else {
            self.run_batch(conn).await
        }
    }

    fn may_retry(&self, err: &Error) -> bool {
        !self.is_transaction()
            && !self.watching
            && err.is_retryable()
            && self.executor.pool().config().retry_on_timeout
            && self.queue.iter().all(|q| q.cmd.is_retry_safe())
    }

    /// Make sure every queued script is cached on this connection's server.
    async fn load_scripts(&self, conn: &mut RedisConnection) -> Result<()> {
        let mut seen = HashSet::new();
        let scripts: Vec<&Script> = self
            .queue
            .iter()
            .filter_map(|q| q.script.as_ref())
            .filter(|s| seen.insert(s.sha().to_string()))
            .collect();
        if scripts.is_empty() {
            return Ok(());
        }
        let exists = Command::new("SCRIPT")
            .arg("EXISTS")
            .args_from(scripts.iter().map(|s| s.sha()));
        let flags = self
            .executor
            .execute_on(conn, &exists)
            .await?
            .into_array()
            .unwrap_or_default();
        for (i, script) in scripts.iter().enumerate() {
            if flags.get(i).and_then(RespValue::as_int) != Some(1) {
                debug!(sha = script.sha(), "loading script before pipeline");
                script.load_on(conn).await?;
            }
        }
        Ok(())
    }

    async fn run_batch(&self, conn: &mut RedisConnection) -> Result<Vec<Result<Value>>> {
        conn.send_commands(self.queue.iter().map(|q| &q.cmd)).await?;
        let mut results = Vec::with_capacity(self.queue.len());
        for q in &self.queue {
            let raw = conn.read_response().await?;
            results.push(self.result_for(conn, &q.cmd, raw));
        }
        Ok(results)
    }

    async fn run_transaction(&self, conn: &mut RedisConnection) -> Result<Vec<Result<Value>>> {
        let multi = Command::new("MULTI");
        let exec = Command::new("EXEC");
        let batch = std::iter::once(&multi)
            .chain(self.queue.iter().map(|q| &q.cmd))
            .chain(std::iter::once(&exec));
        conn.send_commands(batch).await?;

        let multi_reply = conn.read_response().await?;
        let mut queue_error = None;
        for _ in &self.queue {
            let ack = conn.read_response().await?;
            if let Err(e) = self.executor.check_reply(conn, ack) {
                queue_error.get_or_insert(e);
            }
        }
        let exec_reply = conn.read_response().await?;

        if let RespValue::Error(msg) = multi_reply {
            return Err(Error::redis(msg));
        }
        let n = self.queue.len();
        match exec_reply {
            RespValue::NullArray | RespValue::Null => Err(Error::Aborted),
            RespValue::Error(msg) => Err(queue_error.unwrap_or_else(|| Error::redis(msg))),
            RespValue::Array(items) if items.len() == n => Ok(items
                .into_iter()
                .zip(&self.queue)
                .map(|(raw, q)| self.result_for(conn, &q.cmd, raw))
                .collect()),
            RespValue::Array(items) => {
                conn.mark_broken();
                Err(Error::Protocol(format!(
                    "EXEC returned {} results for {n} commands",
                    items.len()
                )))
            }
            other => {
                conn.mark_broken();
                Err(Error::Protocol(format!("unexpected EXEC reply: {}", other.type_name())))
            }
        }
    }

    fn result_for(&self, conn: &mut RedisConnection, cmd: &Command, raw: RespValue) -> Result<Value> {
        let raw = self.executor.check_reply(conn, raw)?;
        self.executor.shape(cmd, raw)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // A connection with live watches must not go back to the pool.
        if self.watching {
            if let Some(guard) = self.conn.as_mut() {
                guard.discard();
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
