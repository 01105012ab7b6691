//! Blocking client facade.
//!
//! Wraps the async core with a synchronous API, bridging every call through
//! [`runtime::block_on`]. These types must not be used from inside an async
//! context; use [`CommandExecutor`], [`Pipeline`], [`PubSub`] and friends
//! directly there.

use std::sync::Arc;
use std::time::Duration;

use crate::command::{Command, ToArg};
use crate::config::{Address, ConnectionConfig, Topology};
use crate::error::Result;
use crate::executor::CommandExecutor;
use crate::pipeline::Pipeline;
use crate::pubsub::{Listen, Message, PubSub, PubSubStatus, PubSubWorker};
use crate::resp::types::RespValue;
use crate::response::Value;
use crate::runtime::block_on;
use crate::script::{Script, ScriptCache, ScriptCall};
use crate::sentinel::SentinelTopology;

// ── Redis ──────────────────────────────────────────────────────────

/// A synchronous client backed by a connection pool.
///
/// Standalone configurations talk to one server; sentinel configurations
/// follow the master of the configured service. Connections are opened
/// lazily, on the first command.
#[derive(Clone)]
pub struct Redis {
    executor: CommandExecutor,
    scripts: Arc<ScriptCache>,
}

impl std::fmt::Debug for Redis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redis").field("pool", self.executor.pool()).finish()
    }
}

impl Redis {
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let executor = if matches!(config.topology, Topology::Sentinel { .. }) {
            let (topology, service) = SentinelTopology::from_config(&config)?;
            topology.master_for(&service, config)?
        } else {
            CommandExecutor::new(config)?
        };
        Ok(Self::from_executor(executor))
    }

    /// Client for a `redis://`, `unix://` or `redis+sentinel://` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        Self::new(ConnectionConfig::from_url(url)?)
    }

    pub fn from_executor(executor: CommandExecutor) -> Self {
        let scripts = Arc::new(ScriptCache::new(executor.clone()));
        Self { executor, scripts }
    }

    /// A client sharing this one's pool, with `callback` shaping the replies
    /// of `name`.
    pub fn with_response_callback<F>(&self, name: &str, callback: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        let callbacks = self.executor.callbacks().clone().with(name, callback);
        Self::from_executor(self.executor.with_callbacks(callbacks))
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Execute one command and return its shaped reply.
    pub fn execute(&self, cmd: &Command) -> Result<Value> {
        block_on(self.executor.execute(cmd))?
    }

    /// Execute one command and return the reply as decoded from the wire.
    pub fn execute_raw(&self, cmd: &Command) -> Result<RespValue> {
        block_on(self.executor.execute_raw(cmd))?
    }

    pub fn ping(&self) -> Result<bool> {
        Ok(match self.execute(&Command::new("PING"))? {
            Value::Bool(b) => b,
            other => other.as_str() == Some("PONG"),
        })
    }

    pub fn get<K: ToArg>(&self, key: K) -> Result<Value> {
        self.execute(&Command::new("GET").arg(key))
    }

    /// `SET key value`; false when the server did not store the value.
    pub fn set<K: ToArg, V: ToArg>(&self, key: K, value: V) -> Result<bool> {
        let reply = self.execute(&Command::new("SET").arg(key).arg(value))?;
        Ok(match reply {
            Value::Bool(b) => b,
            Value::Nil => false,
            other => other.as_str() == Some("OK"),
        })
    }

    /// Publish `message`; returns the number of receiving subscribers.
    pub fn publish<C: ToArg, M: ToArg>(&self, channel: C, message: M) -> Result<i64> {
        let reply = self.execute(&Command::new("PUBLISH").arg(channel).arg(message))?;
        Ok(reply.as_int().unwrap_or(0))
    }

    pub fn pipeline(&self, transaction: bool) -> RedisPipeline {
        RedisPipeline {
            inner: Pipeline::new(self.executor.clone(), transaction),
        }
    }

    /// Subscriber on a private connection to the same server.
    pub fn pubsub(&self) -> Result<RedisPubSub> {
        self.pubsub_with(false)
    }

    /// Subscriber that optionally hides (un)subscribe confirmations.
    pub fn pubsub_with(&self, ignore_subscribe_messages: bool) -> Result<RedisPubSub> {
        Ok(RedisPubSub {
            inner: PubSub::for_executor(&self.executor, ignore_subscribe_messages)?,
        })
    }

    /// Register a script body; the same body always yields the same handle.
    pub fn register_script(&self, body: &str) -> RedisScript {
        RedisScript {
            inner: self.scripts.register(body.to_string()),
        }
    }
}

// ── Pipeline ───────────────────────────────────────────────────────

/// A synchronous pipeline or transaction.
#[derive(Debug)]
pub struct RedisPipeline {
    inner: Pipeline,
}

impl RedisPipeline {
    /// Queue a command.
    pub fn cmd(&mut self, cmd: Command) -> &mut Self {
        self.inner.cmd(cmd);
        self
    }

    /// Queue a script invocation.
    pub fn invoke_script(&mut self, script: &RedisScript, call: &ScriptCall) -> Result<&mut Self> {
        self.inner.invoke_script(&script.inner, call)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn watch(&mut self, keys: &[&str]) -> Result<()> {
        block_on(self.inner.watch(keys))?
    }

    pub fn unwatch(&mut self) -> Result<()> {
        block_on(self.inner.unwatch())?
    }

    pub fn multi(&mut self) -> Result<()> {
        self.inner.multi()
    }

    /// Run a command now, on the watched connection.
    pub fn execute_command(&mut self, cmd: &Command) -> Result<Value> {
        block_on(self.inner.execute_command(cmd))?
    }

    /// Run the batch; the first failing command's error is returned.
    pub fn execute(&mut self) -> Result<Vec<Value>> {
        block_on(self.inner.execute())?
    }

    /// Run the batch; one result per queued command.
    pub fn execute_all(&mut self) -> Result<Vec<Result<Value>>> {
        block_on(self.inner.execute_all())?
    }

    pub fn reset(&mut self) -> Result<()> {
        block_on(self.inner.reset())
    }
}

// ── PubSub ─────────────────────────────────────────────────────────

/// A synchronous subscriber.
#[derive(Debug, Clone)]
pub struct RedisPubSub {
    inner: PubSub,
}

impl RedisPubSub {
    pub fn subscribe(&self, channels: &[&str]) -> Result<()> {
        block_on(self.inner.subscribe(channels))?
    }

    pub fn subscribe_with<F>(&self, channel: &str, handler: F) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        block_on(self.inner.subscribe_with(channel, handler))?
    }

    pub fn psubscribe(&self, patterns: &[&str]) -> Result<()> {
        block_on(self.inner.psubscribe(patterns))?
    }

    pub fn psubscribe_with<F>(&self, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        block_on(self.inner.psubscribe_with(pattern, handler))?
    }

    pub fn unsubscribe(&self, channels: &[&str]) -> Result<()> {
        block_on(self.inner.unsubscribe(channels))?
    }

    pub fn punsubscribe(&self, patterns: &[&str]) -> Result<()> {
        block_on(self.inner.punsubscribe(patterns))?
    }

    /// One timed check for a reply; see [`PubSub::get_message`].
    pub fn get_message(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        block_on(self.inner.get_message(timeout))?
    }

    /// Blocking iterator over messages; ends when the subscriber is closed.
    pub fn listen(&self) -> Messages {
        Messages {
            inner: self.inner.listen(),
            done: false,
        }
    }

    /// Dispatch messages to their handlers on a background task.
    pub fn run_in_thread(&self, sleep: Duration) -> Result<RedisPubSubWorker> {
        Ok(RedisPubSubWorker {
            inner: self.inner.run_in_thread(sleep)?,
        })
    }

    pub fn close(&self) -> Result<()> {
        block_on(self.inner.close())
    }

    pub fn channels(&self) -> Vec<String> {
        self.inner.channels()
    }

    pub fn patterns(&self) -> Vec<String> {
        self.inner.patterns()
    }

    pub fn status(&self) -> PubSubStatus {
        self.inner.status()
    }
}

/// Iterator returned by [`RedisPubSub::listen`].
pub struct Messages {
    inner: Listen,
    done: bool,
}

impl Iterator for Messages {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match block_on(self.inner.next()) {
            Ok(item) => item,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Handle to a background dispatch loop.
#[derive(Debug)]
pub struct RedisPubSubWorker {
    inner: PubSubWorker,
}

impl RedisPubSubWorker {
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Wait for the loop to exit after [`stop`](Self::stop).
    pub fn join(self) -> Result<()> {
        block_on(self.inner.join())?
    }
}

// ── Scripts ────────────────────────────────────────────────────────

/// A registered script.
#[derive(Debug, Clone)]
pub struct RedisScript {
    inner: Script,
}

impl RedisScript {
    pub fn sha(&self) -> &str {
        self.inner.sha()
    }

    /// Invoke on the client that registered the script.
    pub fn call(&self, call: &ScriptCall) -> Result<Value> {
        block_on(self.inner.invoke(call))?
    }

    /// Invoke on another client.
    pub fn call_with(&self, call: &ScriptCall, client: &Redis) -> Result<Value> {
        block_on(self.inner.invoke_with(call, &client.executor))?
    }
}

// ── Sentinel ───────────────────────────────────────────────────────

/// Synchronous access to sentinel discovery.
#[derive(Debug, Clone)]
pub struct RedisSentinel {
    topology: Arc<SentinelTopology>,
    config: ConnectionConfig,
}

impl RedisSentinel {
    /// `config` supplies timeouts for the sentinels and credentials, db and
    /// pool settings for the clients returned by `master_for`/`slave_for`.
    pub fn new(sentinels: Vec<Address>, config: ConnectionConfig) -> Result<Self> {
        let topology = Arc::new(SentinelTopology::new(sentinels, &config)?);
        Ok(Self { topology, config })
    }

    pub fn sentinels(&self) -> Vec<Address> {
        self.topology.sentinels()
    }

    pub fn discover_master(&self, service: &str) -> Result<Address> {
        block_on(self.topology.discover_master(service))?
    }

    pub fn discover_replicas(&self, service: &str) -> Result<Vec<Address>> {
        block_on(self.topology.discover_replicas(service))?
    }

    /// Client following the master of `service`.
    pub fn master_for(&self, service: &str) -> Result<Redis> {
        let executor = self.topology.master_for(service, self.config.clone())?;
        Ok(Redis::from_executor(executor))
    }

    /// Client reading from replicas of `service`.
    pub fn slave_for(&self, service: &str) -> Result<Redis> {
        let executor = self.topology.slave_for(service, self.config.clone())?;
        Ok(Redis::from_executor(executor))
    }
}

// ── Tests ──────────────────────────────────────────────────────────
