//! One async connection to a server over TCP or a Unix socket.
//!
//! The connection owns its transport, a pluggable [`Codec`] and a read
//! buffer. Any I/O failure, protocol violation or read timeout marks it
//! broken: a broken connection is never at a trustworthy reply boundary and
//! must be discarded by its holder.

use std::io;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use crate::command::Command;
use crate::config::{Address, ConnectionConfig};
use crate::error::{Error, Result};
use crate::resp::codec::Codec;
use crate::resp::types::RespValue;

/// Initial read buffer capacity (64 KB).
const DEFAULT_BUF_CAPACITY: usize = 64 * 1024;

enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Transport {
    async fn open(addr: &Address) -> io::Result<Self> {
        match addr {
            Address::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true).ok(); // Disable Nagle for low latency
                Ok(Transport::Tcp(stream))
            }
            #[cfg(unix)]
            Address::Unix(path) => Ok(Transport::Unix(UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            Address::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.write_all(data).await,
            #[cfg(unix)]
            Transport::Unix(s) => s.write_all(data).await,
        }
    }

    async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read_buf(buf).await,
            #[cfg(unix)]
            Transport::Unix(s) => s.read_buf(buf).await,
        }
    }

    /// Non-blocking read; `WouldBlock` when nothing is pending.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.try_read(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.try_read(buf),
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.shutdown().await,
            #[cfg(unix)]
            Transport::Unix(s) => s.shutdown().await,
        }
    }
}

/// A single connection. Owned by exactly one holder at a time.
pub struct RedisConnection {
    transport: Transport,
    addr: Address,
    codec: Box<dyn Codec>,
    /// Data read from the socket but not yet decoded.
    buf: BytesMut,
    /// Scratch buffer for encoded commands.
    write_buf: Vec<u8>,
    max_buf_size: usize,
    read_timeout: Option<Duration>,
    broken: bool,
    /// Timestamp of last successful I/O (for idle checks).
    pub last_used: Instant,
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("addr", &self.addr)
            .field("codec", &self.codec.name())
            .field("broken", &self.broken)
            .finish()
    }
}

impl RedisConnection {
    /// Connect to the configured address and run the handshake.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        Self::connect_to(&config.address, config).await
    }

    /// Connect to `addr` using the timeouts, codec and credentials of `config`.
    pub async fn connect_to(addr: &Address, config: &ConnectionConfig) -> Result<Self> {
        let timeout = config.connect_timeout();
        let transport = match tokio::time::timeout(timeout, Transport::open(addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "connection to {addr} timed out after {timeout:?}"
                )));
            }
        };

        let mut conn = Self {
            transport,
            addr: addr.clone(),
            codec: config.codec.build(),
            buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: Vec::new(),
            max_buf_size: config.max_buffer_size,
            read_timeout: config.read_timeout(),
            broken: false,
            last_used: Instant::now(),
        };
        conn.init(config.username.as_deref(), config.password.as_deref(), config.db)
            .await?;
        debug!(addr = %addr, codec = conn.codec.name(), "connection established");
        Ok(conn)
    }

    /// Server address.
    pub fn addr(&self) -> &Address {
        &self.addr
    }

    /// Whether the connection must be discarded.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Flag the connection as unusable.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Check an idle connection without waiting or a round trip.
    ///
    /// An idle connection has nothing to read, so end of stream, a pending
    /// socket error or unsolicited bytes all mean it can no longer be used;
    /// it is marked broken then.
    pub fn is_alive(&mut self) -> bool {
        if self.broken {
            return false;
        }
        let mut scratch = [0u8; 1];
        let alive = matches!(
            self.transport.try_read(&mut scratch),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock
        ) && self.buf.is_empty();
        if !alive {
            self.broken = true;
        }
        alive
    }

    /// Time since the last successful I/O.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Send raw bytes to the server.
    pub async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        if let Err(e) = self.transport.write_all(data).await {
            self.broken = true;
            return Err(e.into());
        }
        self.last_used = Instant::now();
        Ok(())
    }

    /// Encode and send one command.
    pub async fn send_command(&mut self, cmd: &Command) -> Result<()> {
        self.send_commands(std::iter::once(cmd)).await
    }

    /// Encode several commands into one write.
    ///
    /// Nothing is written if any command fails to encode.
    pub async fn send_commands<'a, I>(&mut self, cmds: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Command>,
    {
        let mut out = std::mem::take(&mut self.write_buf);
        out.clear();
        for cmd in cmds {
            if let Err(e) = cmd.encode_into(self.codec.as_ref(), &mut out) {
                self.write_buf = out;
                return Err(e);
            }
        }
        let result = self.send_raw(&out).await;
        self.write_buf = out;
        result
    }

    /// Read one complete reply, bounded by the read timeout.
    ///
    /// Error replies are returned as [`RespValue::Error`] values. A timeout,
    /// I/O failure or protocol violation marks the connection broken.
    pub async fn read_response(&mut self) -> Result<RespValue> {
        let result = match self.read_timeout {
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, self.read_frame()).await;
                match outcome {
                    Ok(r) => r,
                    Err(_) => Err(Error::Timeout(format!(
                        "read from {} timed out after {limit:?}",
                        self.addr
                    ))),
                }
            }
            None => self.read_frame().await,
        };
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// Poll for one reply, waiting at most `wait` (`None` waits forever).
    ///
    /// Returns `Ok(None)` when nothing arrived in time. Unlike
    /// [`read_response`](Self::read_response), running out of time here is
    /// not a failure and leaves the connection usable: no partial frame is
    /// consumed from the buffer.
    pub async fn try_read_response(&mut self, wait: Option<Duration>) -> Result<Option<RespValue>> {
        let result = match wait {
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, self.read_frame()).await;
                match outcome {
                    Ok(r) => r.map(Some),
                    Err(_) => Ok(None),
                }
            }
            None => self.read_frame().await.map(Some),
        };
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// Send a command and read its reply.
    pub async fn execute(&mut self, cmd: &Command) -> Result<RespValue> {
        self.send_command(cmd).await?;
        self.read_response().await
    }

    /// Send a command given as strings and read its reply.
    pub async fn execute_str(&mut self, args: &[&str]) -> Result<RespValue> {
        self.execute(&Command::from_str_args(args)).await
    }

    /// AUTH handshake.
    pub async fn auth(&mut self, username: Option<&str>, password: &str) -> Result<()> {
        let response = match username {
            Some(user) => self.execute_str(&["AUTH", user, password]).await?,
            None => self.execute_str(&["AUTH", password]).await?,
        };
        expect_ok("AUTH", response)
    }

    /// Select a database index.
    pub async fn select_db(&mut self, db: u16) -> Result<()> {
        if db == 0 {
            return Ok(()); // Default, no need to send
        }
        let response = self.execute(&Command::new("SELECT").arg(u32::from(db))).await?;
        expect_ok("SELECT", response)
    }

    /// Send PING and verify the reply.
    pub async fn ping(&mut self) -> Result<bool> {
        let response = self.execute_str(&["PING"]).await?;
        Ok(response.is_status("PONG"))
    }

    /// Authenticate and select the database.
    pub async fn init(&mut self, username: Option<&str>, password: Option<&str>, db: u16) -> Result<()> {
        if let Some(pass) = password {
            self.auth(username, pass).await?;
        }
        self.select_db(db).await
    }

    /// Close the transport.
    pub async fn disconnect(mut self) {
        let _ = self.transport.shutdown().await;
        debug!(addr = %self.addr, "connection closed");
    }

    async fn read_frame(&mut self) -> Result<RespValue> {
        loop {
            if let Some(value) = self.codec.decode(&mut self.buf)? {
                self.last_used = Instant::now();
                return Ok(value);
            }
            self.fill_buf().await?;
        }
    }

    async fn fill_buf(&mut self) -> Result<()> {
        if self.buf.capacity() - self.buf.len() < 4096 {
            let new_cap = (self.buf.capacity() * 2).max(DEFAULT_BUF_CAPACITY);
            if new_cap > self.max_buf_size {
                if self.buf.capacity() >= self.max_buf_size {
                    return Err(Error::Protocol(format!(
                        "reply too large: buffer would exceed {} bytes",
                        self.max_buf_size
                    )));
                }
                self.buf.reserve(self.max_buf_size - self.buf.len());
            } else {
                self.buf.reserve(new_cap - self.buf.len());
            }
        }
        let n = self.transport.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(Error::Connection(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
        Ok(())
    }
}

fn expect_ok(what: &str, response: RespValue) -> Result<()> {
    match response {
        RespValue::SimpleString(ref s) if s == "OK" => Ok(()),
        RespValue::Error(msg) => Err(Error::redis(msg)),
        other => Err(Error::Protocol(format!(
            "unexpected {what} response: {}",
            other.type_name()
        ))),
    }
}

// ── Tests ──────────────────────────────────────────────────────────
