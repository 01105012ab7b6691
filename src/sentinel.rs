//! Master/replica discovery through sentinels.
//!
//! Every sentinel endpoint gets a one-connection executor. Answers are cached
//! per service for a short TTL; pools bound to a service resolve the endpoint
//! each time they open a new connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tracing::{debug, warn};

use crate::command::Command;
use crate::config::{Address, ConnectionConfig, Topology};
use crate::connection::conn::RedisConnection;
use crate::connection::pool::{ConnectionPool, ConnectionSource};
use crate::error::{Error, Result};
use crate::executor::CommandExecutor;
use crate::response::{ResponseCallbacks, Value};

/// Replica flags that make a replica unusable.
const UNHEALTHY_FLAGS: &[&str] = &["s_down", "o_down", "disconnected"];

#[derive(Default)]
struct Cached {
    master: Option<(Address, Instant)>,
    replicas: Option<(Vec<Address>, Instant)>,
}

/// A set of sentinels and what they last said about each service.
pub struct SentinelTopology {
    /// Sentinel endpoints; the last one that answered sits at the front.
    nodes: SyncMutex<Vec<(Address, CommandExecutor)>>,
    cache: SyncMutex<HashMap<String, Cached>>,
    ttl: Duration,
    /// Spreads replica connections across the replica list.
    rotation: AtomicUsize,
}

impl std::fmt::Debug for SentinelTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let addrs: Vec<String> = self.nodes.lock().iter().map(|(a, _)| a.to_string()).collect();
        f.debug_struct("SentinelTopology")
            .field("sentinels", &addrs)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SentinelTopology {
    /// Topology over `sentinels`. Timeouts, codec and cache TTL come from
    /// `config`; credentials and db do not apply to sentinels.
    pub fn new(sentinels: Vec<Address>, config: &ConnectionConfig) -> Result<Self> {
        if sentinels.is_empty() {
            return Err(Error::Argument("no sentinel addresses".into()));
        }
        let mut nodes = Vec::with_capacity(sentinels.len());
        for addr in sentinels {
            let node_config = ConnectionConfig {
                address: addr.clone(),
                username: None,
                password: None,
                db: 0,
                topology: Topology::Standalone,
                max_connections: 1,
                retry_on_timeout: false,
                decode_responses: false,
                ..config.clone()
            };
            let pool = ConnectionPool::new(node_config);
            nodes.push((addr, CommandExecutor::with_pool(pool, ResponseCallbacks::empty())?));
        }
        Ok(Self {
            nodes: SyncMutex::new(nodes),
            cache: SyncMutex::new(HashMap::new()),
            ttl: config.sentinel_cache_ttl(),
            rotation: AtomicUsize::new(0),
        })
    }

    /// Topology described by a `Topology::Sentinel` config, plus its service.
    pub fn from_config(config: &ConnectionConfig) -> Result<(Arc<Self>, String)> {
        match &config.topology {
            Topology::Sentinel { service, sentinels } => {
                let topology = Self::new(sentinels.clone(), config)?;
                Ok((Arc::new(topology), service.clone()))
            }
            Topology::Standalone => Err(Error::Argument(
                "configuration does not describe a sentinel topology".into(),
            )),
        }
    }

    /// Sentinel addresses in query order.
    pub fn sentinels(&self) -> Vec<Address> {
        self.nodes.lock().iter().map(|(a, _)| a.clone()).collect()
    }

    /// Current master of `service`: cached if fresh, else the first sentinel
    /// that names one.
    pub async fn discover_master(&self, service: &str) -> Result<Address> {
        if let Some(addr) = self.cached_master(service) {
            return Ok(addr);
        }
        let cmd = Command::new("SENTINEL").arg("get-master-addr-by-name").arg(service);
        for (sentinel, exec) in self.snapshot() {
            match exec.execute(&cmd).await {
                Ok(reply) => match parse_master(reply) {
                    Some(master) => {
                        debug!(service, sentinel = %sentinel, master = %master, "sentinel resolved master");
                        self.promote(&sentinel);
                        self.cache.lock().entry(service.to_string()).or_default().master =
                            Some((master.clone(), Instant::now()));
                        return Ok(master);
                    }
                    None => debug!(service, sentinel = %sentinel, "sentinel does not know the service"),
                },
                Err(e) => warn!(service, sentinel = %sentinel, error = %e, "sentinel query failed"),
            }
        }
        Err(Error::MasterNotFound(format!("no sentinel named a master for {service:?}")))
    }

    /// Healthy replicas of `service`: cached if fresh, else the list from the
    /// first sentinel that answers.
    pub async fn discover_replicas(&self, service: &str) -> Result<Vec<Address>> {
        if let Some(list) = self.cached_replicas(service) {
            return Ok(list);
        }
        let replicas = Command::new("SENTINEL").arg("replicas").arg(service);
        let slaves = Command::new("SENTINEL").arg("slaves").arg(service);
        for (sentinel, exec) in self.snapshot() {
            let reply = match exec.execute(&replicas).await {
                // older sentinels only know the legacy spelling
                Err(Error::Redis { .. }) => exec.execute(&slaves).await,
                other => other,
            };
            match reply {
                Ok(reply) => {
                    let list = parse_replicas(reply);
                    debug!(service, sentinel = %sentinel, count = list.len(), "sentinel listed replicas");
                    self.promote(&sentinel);
                    self.cache.lock().entry(service.to_string()).or_default().replicas =
                        Some((list.clone(), Instant::now()));
                    return Ok(list);
                }
                Err(e) => warn!(service, sentinel = %sentinel, error = %e, "sentinel query failed"),
            }
        }
        Err(Error::ReplicaNotFound(format!("no sentinel listed replicas for {service:?}")))
    }

    /// Forget what the sentinels said about `service`.
    pub fn invalidate(&self, service: &str) {
        if self.cache.lock().remove(service).is_some() {
            debug!(service, "sentinel cache invalidated");
        }
    }

    /// Open a connection to the current master. An unreachable master
    /// triggers one fresh discovery; a different answer is tried once.
    pub async fn connect_master(&self, service: &str, config: &ConnectionConfig) -> Result<RedisConnection> {
        let addr = self.discover_master(service).await?;
        let err = match RedisConnection::connect_to(&addr, config).await {
            Ok(conn) => return Ok(conn),
            Err(e) if e.is_connection_failure() => e,
            Err(e) => return Err(e),
        };
        warn!(service, master = %addr, error = %err, "master unreachable, asking sentinels again");
        self.invalidate(service);
        let fresh = self.discover_master(service).await?;
        if fresh == addr {
            return Err(Error::MasterNotFound(format!(
                "master {addr} of {service:?} is unreachable: {err}"
            )));
        }
        RedisConnection::connect_to(&fresh, config).await.map_err(|e| {
            if e.is_connection_failure() {
                Error::MasterNotFound(format!("master {fresh} of {service:?} is unreachable: {e}"))
            } else {
                e
            }
        })
    }

    /// Open a connection to some replica, trying each in turn, then the
    /// master.
    pub async fn connect_replica(&self, service: &str, config: &ConnectionConfig) -> Result<RedisConnection> {
        let replicas = match self.discover_replicas(service).await {
            Ok(list) => list,
            Err(e) => {
                warn!(service, error = %e, "replica discovery failed");
                Vec::new()
            }
        };
        let n = replicas.len();
        let start = self.rotation.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            let addr = &replicas[(start + i) % n];
            match RedisConnection::connect_to(addr, config).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_connection_failure() => {
                    warn!(service, replica = %addr, error = %e, "replica unreachable");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(service, "no replica reachable, falling back to master");
        self.connect_master(service, config).await.map_err(|e| {
            if e.is_connection_failure() {
                Error::ReplicaNotFound(format!("no replica or master of {service:?} is reachable: {e}"))
            } else {
                e
            }
        })
    }

    /// Executor whose pool follows the master of `service`.
    pub fn master_for(self: &Arc<Self>, service: &str, config: ConnectionConfig) -> Result<CommandExecutor> {
        let source = ConnectionSource::SentinelMaster {
            topology: self.clone(),
            service: service.to_string(),
        };
        CommandExecutor::with_pool(ConnectionPool::with_source(config, source), ResponseCallbacks::defaults())
    }

    /// Executor whose pool connects to replicas of `service`.
    pub fn slave_for(self: &Arc<Self>, service: &str, config: ConnectionConfig) -> Result<CommandExecutor> {
        let source = ConnectionSource::SentinelReplica {
            topology: self.clone(),
            service: service.to_string(),
        };
        CommandExecutor::with_pool(ConnectionPool::with_source(config, source), ResponseCallbacks::defaults())
    }

    fn snapshot(&self) -> Vec<(Address, CommandExecutor)> {
        self.nodes.lock().clone()
    }

    fn promote(&self, sentinel: &Address) {
        let mut nodes = self.nodes.lock();
        if let Some(pos) = nodes.iter().position(|(a, _)| a == sentinel) {
            if pos > 0 {
                let node = nodes.remove(pos);
                nodes.insert(0, node);
            }
        }
    }

    fn cached_master(&self, service: &str) -> Option<Address> {
        let cache = self.cache.lock();
        match cache.get(service)?.master {
            Some((ref addr, at)) if at.elapsed() < self.ttl => Some(addr.clone()),
            _ => None,
        }
    }

    fn cached_replicas(&self, service: &str) -> Option<Vec<Address>> {
        let cache = self.cache.lock();
        match cache.get(service)?.replicas {
            Some((ref list, at)) if at.elapsed() < self.ttl => Some(list.clone()),
            _ => None,
        }
    }
}

/// `[host, port]`, or nil when the service is unknown.
fn parse_master(reply: Value) -> Option<Address> {
    let items = reply.into_list()?;
    match items.as_slice() {
        [host, port] => {
            let port = port.as_str()?.parse().ok()?;
            Some(Address::tcp(host.as_str()?, port))
        }
        _ => None,
    }
}

/// One flat `[key, value, key, value, …]` list per replica.
fn parse_replicas(reply: Value) -> Vec<Address> {
    let entries = reply.into_list().unwrap_or_default();
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(fields) = entry.into_list() else { continue };
        let mut ip = None;
        let mut port = None;
        let mut flags = "";
        for pair in fields.chunks(2) {
            if let [k, v] = pair {
                match k.as_str() {
                    Some("ip") => ip = v.as_str(),
                    Some("port") => port = v.as_str().and_then(|p| p.parse::<u16>().ok()),
                    Some("flags") => flags = v.as_str().unwrap_or(""),
                    _ => {}
                }
            }
        }
        if flags.split(',').any(|f| UNHEALTHY_FLAGS.contains(&f)) {
            continue;
        }
        if let (Some(ip), Some(port)) = (ip, port) {
            out.push(Address::tcp(ip, port));
        }
    }
    out
}

// ── Tests ──────────────────────────────────────────────────────────
