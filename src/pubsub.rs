//! Publish/subscribe over a private, non-pooled connection.
//!
//! The subscription set (channels and patterns, each with an optional
//! handler) is the source of truth. The connection is opened lazily on the
//! first subscribe; when it is lost, the next read or subscribe opens a new
//! one and replays the whole set before delivery resumes. Messages published
//! while disconnected are lost.
//!
//! ```text
//! idle ──subscribe──▶ subscribed ──conn lost──▶ disconnected
//!  ▲                     │   ▲                      │
//!  └──unsubscribe all────┘   └──────reconnect───────┘
//!          any state ──close──▶ closed
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::command::Command;
use crate::config::ConnectionConfig;
use crate::connection::conn::RedisConnection;
use crate::connection::pool::ConnectionSource;
use crate::error::{Error, Result};
use crate::executor::CommandExecutor;
use crate::resp::types::RespValue;
use crate::response::{Decoder, Value};
use crate::runtime;

/// How long one step of [`Listen::next`] waits before re-checking for close.
const LISTEN_POLL: Duration = Duration::from_millis(100);

/// Tag of a pub/sub push reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    Message,
    PMessage,
    Pong,
}

impl MessageKind {
    fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            "psubscribe" => Self::PSubscribe,
            "punsubscribe" => Self::PUnsubscribe,
            "message" => Self::Message,
            "pmessage" => Self::PMessage,
            "pong" => Self::Pong,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::PSubscribe => "psubscribe",
            Self::PUnsubscribe => "punsubscribe",
            Self::Message => "message",
            Self::PMessage => "pmessage",
            Self::Pong => "pong",
        }
    }

    /// (Un)subscribe confirmations.
    pub fn is_confirmation(&self) -> bool {
        matches!(
            self,
            Self::Subscribe | Self::Unsubscribe | Self::PSubscribe | Self::PUnsubscribe
        )
    }
}

/// One decoded push reply.
///
/// For confirmations `data` is the number of active subscriptions on the
/// connection; for messages it is the published payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub channel: Value,
    /// Matched pattern, for `pmessage` only.
    pub pattern: Option<Value>,
    pub data: Value,
}

impl Message {
    /// Interpret a decoded reply as a push message.
    pub fn from_value(value: Value) -> Option<Self> {
        let mut items = match value {
            Value::List(items) => items.into_iter(),
            _ => return None,
        };
        let kind = MessageKind::parse(items.next()?.as_str()?)?;
        let message = match kind {
            MessageKind::PMessage => {
                let pattern = items.next()?;
                let channel = items.next()?;
                let data = items.next()?;
                Message { kind, channel, pattern: Some(pattern), data }
            }
            MessageKind::Pong => Message {
                kind,
                channel: Value::Nil,
                pattern: None,
                data: items.next().unwrap_or(Value::Nil),
            },
            _ => {
                let channel = items.next()?;
                let data = items.next()?;
                Message { kind, channel, pattern: None, data }
            }
        };
        Some(message)
    }

    /// Channel name as text, when it is valid UTF-8.
    pub fn channel_name(&self) -> Option<&str> {
        self.channel.as_str()
    }
}

/// Callback invoked for messages on a channel or pattern.
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubSubStatus {
    /// No subscriptions.
    Idle,
    /// Subscriptions active on an open connection.
    Subscribed,
    /// Subscriptions retained, connection lost; the next read reconnects.
    Disconnected,
    /// Terminal.
    Closed,
}

#[derive(Default)]
struct Subscriptions {
    channels: HashMap<String, Option<MessageHandler>>,
    patterns: HashMap<String, Option<MessageHandler>>,
}

impl Subscriptions {
    fn map(&mut self, patterns: bool) -> &mut HashMap<String, Option<MessageHandler>> {
        if patterns {
            &mut self.patterns
        } else {
            &mut self.channels
        }
    }

    fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }
}

struct Inner {
    config: ConnectionConfig,
    source: ConnectionSource,
    decoder: Decoder,
    ignore_subscribe_messages: bool,
    subs: SyncMutex<Subscriptions>,
    conn: Mutex<Option<RedisConnection>>,
    connected: AtomicBool,
    closed: AtomicBool,
    /// Wakes readers parked on the connection when `close` runs.
    closing: Notify,
}

/// A subscriber. Clones share the subscription set and the connection.
#[derive(Clone)]
pub struct PubSub {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("status", &self.status())
            .field("channels", &self.channels())
            .field("patterns", &self.patterns())
            .finish()
    }
}

impl PubSub {
    /// Subscriber whose connection comes from `source`.
    pub fn new(config: ConnectionConfig, source: ConnectionSource, ignore_subscribe_messages: bool) -> Result<Self> {
        let decoder = config.decoder()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                source,
                decoder,
                ignore_subscribe_messages,
                subs: SyncMutex::new(Subscriptions::default()),
                conn: Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                closing: Notify::new(),
            }),
        })
    }

    /// Subscriber reaching the same server as `executor`'s pool.
    pub fn for_executor(executor: &CommandExecutor, ignore_subscribe_messages: bool) -> Result<Self> {
        let pool = executor.pool();
        Self::new(pool.config().clone(), pool.source().clone(), ignore_subscribe_messages)
    }

    pub async fn subscribe(&self, channels: &[&str]) -> Result<()> {
        self.add(false, channels.iter().map(|c| (c.to_string(), None)).collect())
            .await
    }

    /// Subscribe to `channel`, dispatching its messages to `handler`.
    pub async fn subscribe_with<F>(&self, channel: &str, handler: F) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(handler);
        self.add(false, vec![(channel.to_string(), Some(handler))]).await
    }

    pub async fn psubscribe(&self, patterns: &[&str]) -> Result<()> {
        self.add(true, patterns.iter().map(|p| (p.to_string(), None)).collect())
            .await
    }

    /// Subscribe to `pattern`, dispatching its messages to `handler`.
    pub async fn psubscribe_with<F>(&self, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(handler);
        self.add(true, vec![(pattern.to_string(), Some(handler))]).await
    }

    /// Remove the named channels, or every channel when `channels` is empty.
    pub async fn unsubscribe(&self, channels: &[&str]) -> Result<()> {
        self.remove(false, channels).await
    }

    /// Remove the named patterns, or every pattern when `patterns` is empty.
    pub async fn punsubscribe(&self, patterns: &[&str]) -> Result<()> {
        self.remove(true, patterns).await
    }

    /// Check once for a pending reply, waiting at most `wait` (`None` waits
    /// until one arrives).
    ///
    /// Returns `Ok(None)` when nothing arrived, when a handler consumed the
    /// message, or when a confirmation was suppressed. A lost connection is
    /// replaced and the subscription set replayed; that call also returns
    /// `Ok(None)`.
    pub async fn get_message(&self, wait: Option<Duration>) -> Result<Option<Message>> {
        // registered before the closed check so a concurrent close is never missed
        let closing = self.inner.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();
        self.ensure_open()?;
        let reply = {
            let mut slot = tokio::select! {
                slot = self.inner.conn.lock() => slot,
                _ = &mut closing => return Ok(None),
            };
            if slot.is_none() {
                if self.inner.subs.lock().is_empty() {
                    return Ok(None);
                }
                *slot = Some(self.connect_and_replay().await?);
            }
            let Some(conn) = slot.as_mut() else {
                return Ok(None);
            };
            let read = tokio::select! {
                read = conn.try_read_response(wait) => read,
                _ = &mut closing => return Ok(None),
            };
            match read {
                Ok(Some(reply)) => reply,
                Ok(None) => return Ok(None),
                Err(e) => {
                    warn!(error = %e, "pubsub connection lost, resubscribing");
                    *slot = None;
                    self.inner.connected.store(false, Ordering::Release);
                    *slot = Some(self.connect_and_replay().await?);
                    return Ok(None);
                }
            }
        };
        self.dispatch(reply)
    }

    /// Blocking lazy sequence of messages.
    pub fn listen(&self) -> Listen {
        Listen { pubsub: self.clone() }
    }

    /// Run the read-and-dispatch loop on a background task until stopped.
    ///
    /// Every tracked channel and pattern must have a handler, since nobody
    /// else would see their messages.
    pub fn run_in_thread(&self, sleep: Duration) -> Result<PubSubWorker> {
        self.ensure_open()?;
        {
            let subs = self.inner.subs.lock();
            let unhandled = subs
                .channels
                .iter()
                .chain(subs.patterns.iter())
                .find(|(_, handler)| handler.is_none());
            if let Some((name, _)) = unhandled {
                return Err(Error::Usage(format!(
                    "{name:?} has no handler; every subscription needs one to run in the background"
                )));
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let pubsub = self.clone();
        let sleep = sleep.max(Duration::from_millis(1));
        let task = async move {
            while !flag.load(Ordering::Acquire) && !pubsub.is_closed() {
                match pubsub.get_message(Some(sleep)).await {
                    Ok(Some(message)) => {
                        trace!(kind = message.kind.as_str(), "worker dropped unhandled message");
                    }
                    Ok(None) => {
                        if pubsub.status() == PubSubStatus::Idle {
                            tokio::time::sleep(sleep).await;
                        }
                    }
                    Err(e) => {
                        if pubsub.is_closed() {
                            break;
                        }
                        warn!(error = %e, "pubsub worker read failed");
                        tokio::time::sleep(sleep).await;
                    }
                }
            }
            debug!("pubsub worker stopped");
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle.spawn(task),
            Err(_) => runtime::spawn(task)?,
        };
        Ok(PubSubWorker { stop, handle })
    }

    /// Unsubscribe from everything, drop the connection, and enter the
    /// terminal state. A reader blocked in [`get_message`](Self::get_message)
    /// is woken and returns `Ok(None)`.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.closing.notify_waiters();
        let mut slot = self.inner.conn.lock().await;
        if let Some(mut conn) = slot.take() {
            let bye = [Command::new("UNSUBSCRIBE"), Command::new("PUNSUBSCRIBE")];
            if let Err(e) = conn.send_commands(bye.iter()).await {
                debug!(error = %e, "unsubscribe on close failed");
            }
            conn.disconnect().await;
        }
        self.inner.connected.store(false, Ordering::Release);
        *self.inner.subs.lock() = Subscriptions::default();
    }

    /// Subscribed channel names, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.subs.lock().channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Subscribed patterns, sorted.
    pub fn patterns(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.subs.lock().patterns.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn status(&self) -> PubSubStatus {
        if self.is_closed() {
            PubSubStatus::Closed
        } else if self.inner.subs.lock().is_empty() {
            PubSubStatus::Idle
        } else if self.inner.connected.load(Ordering::Acquire) {
            PubSubStatus::Subscribed
        } else {
            PubSubStatus::Disconnected
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Usage("pubsub is closed".into()));
        }
        Ok(())
    }

    async fn add(&self, patterns: bool, entries: Vec<(String, Option<MessageHandler>)>) -> Result<()> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Err(Error::Argument("nothing to subscribe to".into()));
        }
        let names: Vec<String> = entries.iter().map(|(name, _)| name.clone()).collect();
        {
            let mut subs = self.inner.subs.lock();
            subs.map(patterns).extend(entries);
        }

        let mut slot = self.inner.conn.lock().await;
        if let Some(conn) = slot.as_mut() {
            let verb = if patterns { "PSUBSCRIBE" } else { "SUBSCRIBE" };
            match conn.send_command(&Command::new(verb).args_from(names.iter())).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "pubsub connection lost while subscribing"),
            }
            *slot = None;
            self.inner.connected.store(false, Ordering::Release);
        }
        // a new connection picks the new entries up with the rest of the set
        *slot = Some(self.connect_and_replay().await?);
        Ok(())
    }

    async fn remove(&self, patterns: bool, names: &[&str]) -> Result<()> {
        self.ensure_open()?;
        {
            let mut subs = self.inner.subs.lock();
            let map = subs.map(patterns);
            if names.is_empty() {
                map.clear();
            } else {
                for name in names {
                    map.remove(*name);
                }
            }
        }
        let mut slot = self.inner.conn.lock().await;
        if let Some(conn) = slot.as_mut() {
            let verb = if patterns { "PUNSUBSCRIBE" } else { "UNSUBSCRIBE" };
            let cmd = Command::new(verb).args_from(names.iter().copied());
            if let Err(e) = conn.send_command(&cmd).await {
                // the next connection only replays what is left
                warn!(error = %e, "pubsub connection lost while unsubscribing");
                *slot = None;
                self.inner.connected.store(false, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Open a connection and subscribe it to the whole current set.
    async fn connect_and_replay(&self) -> Result<RedisConnection> {
        let mut conn = self.inner.source.open(&self.inner.config).await?;
        let (channels, patterns) = {
            let subs = self.inner.subs.lock();
            (
                subs.channels.keys().cloned().collect::<Vec<_>>(),
                subs.patterns.keys().cloned().collect::<Vec<_>>(),
            )
        };
        let mut cmds = Vec::with_capacity(2);
        if !channels.is_empty() {
            cmds.push(Command::new("SUBSCRIBE").args_from(channels.iter()));
        }
        if !patterns.is_empty() {
            cmds.push(Command::new("PSUBSCRIBE").args_from(patterns.iter()));
        }
        if !cmds.is_empty() {
            conn.send_commands(cmds.iter()).await?;
        }
        self.inner.connected.store(true, Ordering::Release);
        debug!(
            addr = %conn.addr(),
            channels = channels.len(),
            patterns = patterns.len(),
            "pubsub connected, subscriptions replayed"
        );
        Ok(conn)
    }

    fn dispatch(&self, reply: RespValue) -> Result<Option<Message>> {
        let value = self.inner.decoder.value(reply)?;
        let Some(message) = Message::from_value(value) else {
            return Err(Error::Protocol("unexpected reply on a pubsub connection".into()));
        };
        match message.kind {
            MessageKind::Message | MessageKind::PMessage => {
                let handler = {
                    let subs = self.inner.subs.lock();
                    let (map, key) = match message.kind {
                        MessageKind::PMessage => (&subs.patterns, message.pattern.as_ref()),
                        _ => (&subs.channels, Some(&message.channel)),
                    };
                    key.and_then(Value::as_str)
                        .and_then(|name| map.get(name).cloned().flatten())
                };
                match handler {
                    Some(handler) => {
                        handler(&message);
                        Ok(None)
                    }
                    None => Ok(Some(message)),
                }
            }
            kind if kind.is_confirmation() && self.inner.ignore_subscribe_messages => Ok(None),
            _ => Ok(Some(message)),
        }
    }
}

/// Lazy message sequence. Each [`next`](Listen::next) advances until one
/// message is available; the sequence ends when the subscriber is closed.
/// Not meant to be shared between consumers.
pub struct Listen {
    pubsub: PubSub,
}

impl Listen {
    pub async fn next(&mut self) -> Option<Result<Message>> {
        loop {
            if self.pubsub.is_closed() {
                return None;
            }
            match self.pubsub.get_message(Some(LISTEN_POLL)).await {
                Ok(Some(message)) => return Some(Ok(message)),
                Ok(None) => {
                    if self.pubsub.status() == PubSubStatus::Idle {
                        tokio::time::sleep(LISTEN_POLL).await;
                    }
                }
                Err(_) if self.pubsub.is_closed() => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Handle to a background dispatch loop.
#[derive(Debug)]
pub struct PubSubWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl PubSubWorker {
    /// Ask the loop to stop after its current iteration.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Wait for the loop to finish.
    pub async fn join(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| Error::Usage(format!("pubsub worker failed: {e}")))
    }
}

// ── Tests ──────────────────────────────────────────────────────────
