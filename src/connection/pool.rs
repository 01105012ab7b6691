//! Async connection pool.
//!
//! Uses a semaphore for max size control and a deque for idle connection reuse.
//! The idle queue uses `parking_lot::Mutex` (sync, held very briefly) so
//! connections can be returned in `Drop` without needing async.
//!
//! Every connection is in exactly one place: checked out inside a
//! [`PoolGuard`] (holding one semaphore permit) or parked in the idle deque.
//! Broken connections are dropped on release instead of being parked.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::{Address, ConnectionConfig};
use crate::connection::conn::RedisConnection;
use crate::error::{Error, Result};
use crate::sentinel::SentinelTopology;

/// Pending result of [`ConnectionSource::open`].
pub type OpenFuture<'a> = Pin<Box<dyn Future<Output = Result<RedisConnection>> + Send + 'a>>;

/// Where new connections for a pool come from.
#[derive(Clone)]
pub enum ConnectionSource {
    /// A fixed address.
    Direct(Address),
    /// Whatever the sentinels currently report as master of `service`.
    SentinelMaster {
        topology: Arc<SentinelTopology>,
        service: String,
    },
    /// Any reachable replica of `service`, falling back to the master.
    SentinelReplica {
        topology: Arc<SentinelTopology>,
        service: String,
    },
}

impl fmt::Debug for ConnectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(addr) => write!(f, "Direct({addr})"),
            Self::SentinelMaster { service, .. } => write!(f, "SentinelMaster({service})"),
            Self::SentinelReplica { service, .. } => write!(f, "SentinelReplica({service})"),
        }
    }
}

impl ConnectionSource {
    /// Establish one new connection.
    ///
    /// Sentinel-backed sources resolve the endpoint here, so a failover is
    /// picked up the next time a fresh connection is needed. Discovery runs
    /// over the sentinels' own pools, which land back in this function, so
    /// the future is boxed to give the recursion a nameable type.
    pub fn open<'a>(&'a self, config: &'a ConnectionConfig) -> OpenFuture<'a> {
        Box::pin(async move {
            match self {
                Self::Direct(addr) => RedisConnection::connect_to(addr, config).await,
                Self::SentinelMaster { topology, service } => {
                    topology.connect_master(service, config).await
                }
                Self::SentinelReplica { topology, service } => {
                    topology.connect_replica(service, config).await
                }
            }
        })
    }

    /// The server answered READONLY: the cached master is stale.
    pub fn report_read_only(&self) {
        if let Self::SentinelMaster { topology, service } = self {
            topology.invalidate(service);
        }
    }
}

struct PoolInner {
    /// Idle connections ready for reuse (sync mutex, held very briefly).
    idle: SyncMutex<VecDeque<RedisConnection>>,
    /// One permit per connection that may be checked out.
    semaphore: Arc<Semaphore>,
    config: ConnectionConfig,
    source: ConnectionSource,
    max_size: usize,
    opened: AtomicU64,
}

impl PoolInner {
    /// Park a connection, or drop it if it cannot be trusted.
    fn release(&self, conn: RedisConnection) {
        if conn.is_broken() {
            warn!(addr = %conn.addr(), "discarding broken connection");
            return;
        }
        if let Some(limit) = self.config.idle_timeout() {
            if conn.idle_for() > limit {
                return; // Drop stale connection
            }
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_size {
            idle.push_back(conn);
        }
    }
}

/// Bounded pool of connections sharing one configuration. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("source", &self.inner.source)
            .field("max_size", &self.inner.max_size)
            .field("in_use", &self.in_use())
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl ConnectionPool {
    /// Pool for the configured address.
    pub fn new(config: ConnectionConfig) -> Self {
        let source = ConnectionSource::Direct(config.address.clone());
        Self::with_source(config, source)
    }

    /// Pool whose connections come from `source`.
    pub fn with_source(config: ConnectionConfig, source: ConnectionSource) -> Self {
        let max_size = config.max_connections.max(1);
        Self {
            inner: Arc::new(PoolInner {
                idle: SyncMutex::new(VecDeque::with_capacity(max_size)),
                semaphore: Arc::new(Semaphore::new(max_size)),
                config,
                source,
                max_size,
                opened: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn source(&self) -> &ConnectionSource {
        &self.inner.source
    }

    /// Check out a connection: a live idle one if possible, else a new
    /// one. Waits for a free slot according to the pool timeout policy.
    ///
    /// Every idle connection gets a non-blocking liveness check; long-idle
    /// ones are also pinged when a health check interval is configured.
    pub async fn get(&self) -> Result<PoolGuard> {
        let permit = self.acquire_permit().await?;

        while let Some(mut conn) = self.take_idle() {
            if !conn.is_alive() {
                debug!(addr = %conn.addr(), "idle connection closed by the server");
                continue;
            }
            if self.needs_health_check(&conn) {
                match conn.ping().await {
                    Ok(true) => {}
                    _ => {
                        debug!(addr = %conn.addr(), "idle connection failed health check");
                        continue;
                    }
                }
            }
            return Ok(self.guard(conn, permit));
        }

        let conn = self.open().await?;
        Ok(self.guard(conn, permit))
    }

    /// Check out a newly established connection, bypassing the idle deque.
    pub async fn get_fresh(&self) -> Result<PoolGuard> {
        let permit = self.acquire_permit().await?;
        let conn = self.open().await?;
        Ok(self.guard(conn, permit))
    }

    /// Drop every idle connection.
    pub fn disconnect(&self) {
        let drained: Vec<RedisConnection> = self.inner.idle.lock().drain(..).collect();
        debug!(count = drained.len(), "dropping idle connections");
    }

    /// Number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Configured ceiling.
    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Free checkout slots.
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.max_size - self.available()
    }

    /// Connections established over the pool's lifetime.
    pub fn connections_opened(&self) -> u64 {
        self.inner.opened.load(Ordering::Relaxed)
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        let sem = self.inner.semaphore.clone();
        let max_size = self.inner.max_size;
        match self.inner.config.pool_timeout() {
            None => sem.acquire_owned().await.map_err(|_| closed()),
            Some(limit) if limit.is_zero() => sem
                .try_acquire_owned()
                .map_err(|_| Error::PoolExhausted { max_size }),
            Some(limit) => match tokio::time::timeout(limit, sem.acquire_owned()).await {
                Ok(permit) => permit.map_err(|_| closed()),
                Err(_) => Err(Error::PoolExhausted { max_size }),
            },
        }
    }

    /// Take a connection from the idle queue (LIFO for cache warmth),
    /// skipping ones that sat idle too long.
    fn take_idle(&self) -> Option<RedisConnection> {
        let mut idle = self.inner.idle.lock();
        let limit = self.inner.config.idle_timeout();
        while let Some(conn) = idle.pop_back() {
            match limit {
                Some(limit) if conn.idle_for() > limit => continue, // Drop stale connection
                _ => return Some(conn),
            }
        }
        None
    }

    fn needs_health_check(&self, conn: &RedisConnection) -> bool {
        self.inner
            .config
            .health_check_interval()
            .is_some_and(|interval| conn.idle_for() > interval)
    }

    async fn open(&self) -> Result<RedisConnection> {
        let conn = self.inner.source.open(&self.inner.config).await?;
        self.inner.opened.fetch_add(1, Ordering::Relaxed);
        debug!(addr = %conn.addr(), source = ?self.inner.source, "pool opened connection");
        Ok(conn)
    }

    fn guard(&self, conn: RedisConnection, permit: OwnedSemaphorePermit) -> PoolGuard {
        PoolGuard {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        }
    }
}

fn closed() -> Error {
    Error::Usage("connection pool closed".into())
}

/// RAII checkout. Returns the connection to the pool on drop, or discards
/// it if it was marked broken.
pub struct PoolGuard {
    conn: Option<RedisConnection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PoolGuard {
    /// Access the underlying connection. Only fails once the guard has
    /// handed its connection back.
    pub fn conn(&mut self) -> Result<&mut RedisConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Usage("connection already released".into()))
    }

    /// Make sure the connection is not returned to the pool.
    pub fn discard(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.mark_broken();
        }
    }
}

impl fmt::Debug for PoolGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolGuard").field("conn", &self.conn).finish()
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
