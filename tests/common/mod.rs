//! Shared helpers for integration tests.
//!
//! [`Sim`] is an in-process server speaking the wire protocol with just
//! enough behaviour for the engine's scenarios: strings, WATCH/MULTI/EXEC,
//! pub/sub with glob patterns, a script cache, and sentinel replies. It runs
//! on its own runtime thread so both async and blocking tests can use it.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use kvwire::config::{Address, ConnectionConfig};
use kvwire::resp::parser::parse_slice;
use kvwire::resp::types::RespValue;
use kvwire::resp::writer::encode_value_into;
use kvwire::script::sha1_hex;

type Args = Vec<Vec<u8>>;

#[derive(Default)]
struct Keyspace {
    values: HashMap<Vec<u8>, Vec<u8>>,
    /// Bumped on every write; WATCH compares these.
    versions: HashMap<Vec<u8>, u64>,
}

impl Keyspace {
    fn touch(&mut self, key: &[u8]) {
        *self.versions.entry(key.to_vec()).or_default() += 1;
    }

    fn version(&self, key: &[u8]) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }
}

struct Subscriber {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    channels: HashSet<Vec<u8>>,
    patterns: HashSet<Vec<u8>>,
}

impl Subscriber {
    fn count(&self) -> i64 {
        (self.channels.len() + self.patterns.len()) as i64
    }
}

#[derive(Default)]
struct SentinelView {
    masters: HashMap<String, (String, u16)>,
    replicas: HashMap<String, Vec<(String, u16, String)>>,
}

struct State {
    keys: Mutex<Keyspace>,
    scripts: Mutex<HashMap<String, Vec<u8>>>,
    subscribers: Mutex<HashMap<usize, Subscriber>>,
    sentinel: Mutex<SentinelView>,
    log: Mutex<Vec<(usize, Args)>>,
    kill: broadcast::Sender<()>,
    accepted: AtomicUsize,
    open: AtomicUsize,
    busy: AtomicUsize,
    max_busy: AtomicUsize,
}

/// Handle to a running simulator.
#[derive(Clone)]
pub struct Sim {
    port: u16,
    state: Arc<State>,
}

impl Sim {
    pub fn start() -> Sim {
        init_tracing();
        let (kill, _) = broadcast::channel(4);
        let state = Arc::new(State {
            keys: Mutex::new(Keyspace::default()),
            scripts: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            sentinel: Mutex::new(SentinelView::default()),
            log: Mutex::new(Vec::new()),
            kill,
            accepted: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            max_busy: AtomicUsize::new(0),
        });
        let (port_tx, port_rx) = std::sync::mpsc::channel();
        let shared = state.clone();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .expect("simulator runtime");
            rt.block_on(async move {
                let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
                port_tx
                    .send(listener.local_addr().expect("local addr").port())
                    .expect("report port");
                while let Ok((socket, _)) = listener.accept().await {
                    let id = shared.accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(socket, shared.clone(), id));
                }
            });
        });
        let port = port_rx.recv().expect("simulator port");
        Sim { port, state }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> Address {
        Address::tcp("127.0.0.1", self.port)
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout_ms: 1000,
            read_timeout_ms: 5000,
            ..ConnectionConfig::tcp("127.0.0.1", self.port)
        }
    }

    /// Every command received so far, as text.
    pub fn log(&self) -> Vec<Vec<String>> {
        self.state
            .log
            .lock()
            .iter()
            .map(|(_, args)| args.iter().map(|a| String::from_utf8_lossy(a).into_owned()).collect())
            .collect()
    }

    /// Received commands whose name is `name`, with the connection id.
    pub fn commands(&self, name: &str) -> Vec<(usize, Vec<String>)> {
        self.state
            .log
            .lock()
            .iter()
            .filter(|(_, args)| args[0].eq_ignore_ascii_case(name.as_bytes()))
            .map(|(id, args)| {
                (*id, args.iter().map(|a| String::from_utf8_lossy(a).into_owned()).collect())
            })
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.log.lock().clear();
    }

    /// Close every open client connection.
    pub fn kill_connections(&self) {
        let _ = self.state.kill.send(());
    }

    pub fn connections_accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn connections_open(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Highest number of connections that were executing a command at once.
    pub fn max_concurrent_commands(&self) -> usize {
        self.state.max_busy.load(Ordering::SeqCst)
    }

    /// Write a key behind the clients' backs.
    pub fn set(&self, key: &str, value: &str) {
        let mut keys = self.state.keys.lock();
        keys.values.insert(key.as_bytes().to_vec(), value.as_bytes().to_vec());
        keys.touch(key.as_bytes());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.state
            .keys
            .lock()
            .values
            .get(key.as_bytes())
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn flush_scripts(&self) {
        self.state.scripts.lock().clear();
    }

    pub fn script_count(&self) -> usize {
        self.state.scripts.lock().len()
    }

    /// What `SENTINEL get-master-addr-by-name service` answers.
    pub fn set_master(&self, service: &str, addr: &Address) {
        if let Address::Tcp { host, port } = addr {
            self.state
                .sentinel
                .lock()
                .masters
                .insert(service.to_string(), (host.clone(), *port));
        }
    }

    /// What `SENTINEL replicas service` answers: `(host, port, flags)`.
    pub fn set_replicas(&self, service: &str, replicas: Vec<(Address, &str)>) {
        let list = replicas
            .into_iter()
            .filter_map(|(addr, flags)| match addr {
                Address::Tcp { host, port } => Some((host, port, flags.to_string())),
                Address::Unix(_) => None,
            })
            .collect();
        self.state.sentinel.lock().replicas.insert(service.to_string(), list);
    }
}

/// Log to the test writer; `RUST_LOG=kvwire=debug` shows the engine's events.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wait until `cond` holds or two seconds pass.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

// ── Server side ────────────────────────────────────────────────────

async fn serve(socket: TcpStream, state: Arc<State>, id: usize) {
    state.open.fetch_add(1, Ordering::SeqCst);
    let (mut rd, mut wr) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut kill = state.kill.subscribe();
    let mut session = Session {
        id,
        tx,
        multi: None,
        queue_failed: false,
        watched: HashMap::new(),
    };
    let mut pending = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            _ = kill.recv() => break,
            Some(push) = rx.recv() => {
                if wr.write_all(&push).await.is_err() {
                    break;
                }
            }
            read = rd.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&buf[..n]);
                let mut out = Vec::new();
                while let Ok((cmd, used)) = parse_slice(&pending) {
                    pending.drain(..used);
                    let args: Args = cmd
                        .into_array()
                        .unwrap_or_default()
                        .iter()
                        .filter_map(|a| a.as_bytes().map(<[u8]>::to_vec))
                        .collect();
                    if args.is_empty() {
                        continue;
                    }
                    state.log.lock().push((id, args.clone()));
                    let busy = state.busy.fetch_add(1, Ordering::SeqCst) + 1;
                    state.max_busy.fetch_max(busy, Ordering::SeqCst);
                    let reply = session.handle(&state, args).await;
                    state.busy.fetch_sub(1, Ordering::SeqCst);
                    for value in reply {
                        encode_value_into(&mut out, &value);
                    }
                }
                if !out.is_empty() && wr.write_all(&out).await.is_err() {
                    break;
                }
            }
        }
    }
    state.subscribers.lock().remove(&id);
    state.open.fetch_sub(1, Ordering::SeqCst);
}

struct Session {
    id: usize,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    multi: Option<Vec<Args>>,
    queue_failed: bool,
    watched: HashMap<Vec<u8>, u64>,
}

fn ok() -> RespValue {
    RespValue::SimpleString("OK".into())
}

fn err(msg: &str) -> RespValue {
    RespValue::Error(msg.to_string())
}

fn bulk(b: &[u8]) -> RespValue {
    RespValue::BulkString(Bytes::copy_from_slice(b))
}

fn upper(b: &[u8]) -> String {
    String::from_utf8_lossy(b).to_ascii_uppercase()
}

const KNOWN: &[&str] = &[
    "PING", "ECHO", "AUTH", "SELECT", "SET", "GET", "DEL", "INCR", "EXISTS",
    "PUBLISH", "EVALSHA", "SCRIPT", "DEBUG",
];

impl Session {
    /// Replies for one command (subscribe variants produce several).
    async fn handle(&mut self, state: &State, args: Args) -> Vec<RespValue> {
        let name = upper(&args[0]);
        if name == "DEBUG" && self.multi.is_none() && upper(args.get(1).map(Vec::as_slice).unwrap_or(b"")) == "SLEEP" {
            let ms: u64 = args
                .get(2)
                .and_then(|a| String::from_utf8_lossy(a).parse().ok())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return vec![ok()];
        }
        if self.multi.is_some() && !matches!(name.as_str(), "EXEC" | "DISCARD" | "MULTI" | "WATCH") {
            if !KNOWN.contains(&name.as_str()) {
                self.queue_failed = true;
                return vec![err(&format!("ERR unknown command '{}'", name.to_ascii_lowercase()))];
            }
            if let Some(queue) = self.multi.as_mut() {
                queue.push(args);
            }
            return vec![RespValue::SimpleString("QUEUED".into())];
        }
        match name.as_str() {
            "MULTI" => {
                if self.multi.is_some() {
                    return vec![err("ERR MULTI calls can not be nested")];
                }
                self.multi = Some(Vec::new());
                vec![ok()]
            }
            "EXEC" => vec![self.exec(state)],
            "DISCARD" => {
                self.multi = None;
                self.queue_failed = false;
                self.watched.clear();
                vec![ok()]
            }
            "WATCH" => {
                if self.multi.is_some() {
                    return vec![err("ERR WATCH inside MULTI is not allowed")];
                }
                let keys = state.keys.lock();
                for key in &args[1..] {
                    self.watched.insert(key.clone(), keys.version(key));
                }
                vec![ok()]
            }
            "UNWATCH" => {
                self.watched.clear();
                vec![ok()]
            }
            "SUBSCRIBE" | "PSUBSCRIBE" => self.subscribe(state, &name, &args[1..]),
            "UNSUBSCRIBE" | "PUNSUBSCRIBE" => self.unsubscribe(state, &name, &args[1..]),
            _ => vec![run(state, &args)],
        }
    }

    fn exec(&mut self, state: &State) -> RespValue {
        let Some(queue) = self.multi.take() else {
            return err("ERR EXEC without MULTI");
        };
        let watched = std::mem::take(&mut self.watched);
        if std::mem::replace(&mut self.queue_failed, false) {
            return err("EXECABORT Transaction discarded because of previous errors.");
        }
        let dirty = {
            let keys = state.keys.lock();
            watched.iter().any(|(k, v)| keys.version(k) != *v)
        };
        if dirty {
            return RespValue::NullArray;
        }
        let mut results = Vec::with_capacity(queue.len());
        for args in queue {
            results.push(run(state, &args));
        }
        RespValue::Array(results)
    }

    fn subscribe(&mut self, state: &State, verb: &str, names: &[Vec<u8>]) -> Vec<RespValue> {
        let mut subs = state.subscribers.lock();
        let sub = subs.entry(self.id).or_insert_with(|| Subscriber {
            tx: self.tx.clone(),
            channels: HashSet::new(),
            patterns: HashSet::new(),
        });
        let tag = verb.to_ascii_lowercase();
        names
            .iter()
            .map(|name| {
                if verb == "PSUBSCRIBE" {
                    sub.patterns.insert(name.clone());
                } else {
                    sub.channels.insert(name.clone());
                }
                RespValue::Array(vec![bulk(tag.as_bytes()), bulk(name), RespValue::Integer(sub.count())])
            })
            .collect()
    }

    fn unsubscribe(&mut self, state: &State, verb: &str, names: &[Vec<u8>]) -> Vec<RespValue> {
        let mut subs = state.subscribers.lock();
        let tag = verb.to_ascii_lowercase();
        let Some(sub) = subs.get_mut(&self.id) else {
            return vec![RespValue::Array(vec![bulk(tag.as_bytes()), RespValue::Null, RespValue::Integer(0)])];
        };
        let set = if verb == "PUNSUBSCRIBE" { &mut sub.patterns } else { &mut sub.channels };
        let targets: Vec<Vec<u8>> = if names.is_empty() {
            set.iter().cloned().collect()
        } else {
            names.to_vec()
        };
        if targets.is_empty() {
            return vec![RespValue::Array(vec![bulk(tag.as_bytes()), RespValue::Null, RespValue::Integer(sub.count())])];
        }
        let mut replies = Vec::new();
        for name in targets {
            if verb == "PUNSUBSCRIBE" {
                sub.patterns.remove(&name);
            } else {
                sub.channels.remove(&name);
            }
            replies.push(RespValue::Array(vec![bulk(tag.as_bytes()), bulk(&name), RespValue::Integer(sub.count())]));
        }
        replies
    }
}

/// Execute a plain command against the shared state.
fn run(state: &State, args: &Args) -> RespValue {
    let name = upper(&args[0]);
    let arg = |i: usize| args.get(i).map(Vec::as_slice).unwrap_or(b"");
    match name.as_str() {
        "PING" => RespValue::SimpleString("PONG".into()),
        "ECHO" => bulk(arg(1)),
        "AUTH" | "SELECT" => ok(),
        "SET" => {
            let mut keys = state.keys.lock();
            keys.values.insert(arg(1).to_vec(), arg(2).to_vec());
            keys.touch(arg(1));
            ok()
        }
        "GET" => match state.keys.lock().values.get(arg(1)) {
            Some(v) => bulk(v),
            None => RespValue::Null,
        },
        "DEL" => {
            let mut keys = state.keys.lock();
            let mut removed = 0;
            for key in &args[1..] {
                if keys.values.remove(key).is_some() {
                    keys.touch(key);
                    removed += 1;
                }
            }
            RespValue::Integer(removed)
        }
        "EXISTS" => {
            let keys = state.keys.lock();
            RespValue::Integer(args[1..].iter().filter(|k| keys.values.contains_key(*k)).count() as i64)
        }
        "INCR" => {
            let mut keys = state.keys.lock();
            let current = keys
                .values
                .get(arg(1))
                .map(|v| String::from_utf8_lossy(v).parse::<i64>());
            match current {
                Some(Err(_)) => err("ERR value is not an integer or out of range"),
                other => {
                    let next = other.and_then(Result::ok).unwrap_or(0) + 1;
                    keys.values.insert(arg(1).to_vec(), next.to_string().into_bytes());
                    keys.touch(arg(1));
                    RespValue::Integer(next)
                }
            }
        }
        "PUBLISH" => RespValue::Integer(publish(state, arg(1), arg(2))),
        "SCRIPT" => match upper(arg(1)).as_str() {
            "LOAD" => {
                let sha = sha1_hex(arg(2));
                state.scripts.lock().insert(sha.clone(), arg(2).to_vec());
                bulk(sha.as_bytes())
            }
            "EXISTS" => {
                let scripts = state.scripts.lock();
                RespValue::Array(
                    args[2..]
                        .iter()
                        .map(|sha| {
                            let known = scripts.contains_key(&*String::from_utf8_lossy(sha));
                            RespValue::Integer(i64::from(known))
                        })
                        .collect(),
                )
            }
            "FLUSH" => {
                state.scripts.lock().clear();
                ok()
            }
            _ => err("ERR unknown SCRIPT subcommand"),
        },
        "EVALSHA" => {
            let sha = String::from_utf8_lossy(arg(1)).to_lowercase();
            let Some(body) = state.scripts.lock().get(&sha).cloned() else {
                return err("NOSCRIPT No matching script. Please use EVAL.");
            };
            let numkeys: usize = String::from_utf8_lossy(arg(2)).parse().unwrap_or(0);
            let keys = &args[3..(3 + numkeys).min(args.len())];
            let argv = &args[(3 + numkeys).min(args.len())..];
            eval(&body, keys, argv)
        }
        "SENTINEL" => sentinel(state, args),
        other => err(&format!("ERR unknown command '{}'", other.to_ascii_lowercase())),
    }
}

/// A tiny script "interpreter": `return <int>`, `return KEYS[n]`,
/// `return ARGV[n]`.
fn eval(body: &[u8], keys: &[Vec<u8>], argv: &[Vec<u8>]) -> RespValue {
    let body = String::from_utf8_lossy(body);
    let expr = body.trim().trim_start_matches("return").trim();
    if let Ok(n) = expr.parse::<i64>() {
        return RespValue::Integer(n);
    }
    let index = |prefix: &str| {
        expr.strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n > 0)
    };
    if let Some(i) = index("KEYS[") {
        return keys.get(i - 1).map(|k| bulk(k)).unwrap_or(RespValue::Null);
    }
    if let Some(i) = index("ARGV[") {
        return argv.get(i - 1).map(|a| bulk(a)).unwrap_or(RespValue::Null);
    }
    err("ERR unsupported script")
}

fn publish(state: &State, channel: &[u8], message: &[u8]) -> i64 {
    let subs = state.subscribers.lock();
    let mut receivers = 0;
    for sub in subs.values() {
        if sub.channels.contains(channel) {
            let mut out = Vec::new();
            encode_value_into(
                &mut out,
                &RespValue::Array(vec![bulk(b"message"), bulk(channel), bulk(message)]),
            );
            if sub.tx.send(out).is_ok() {
                receivers += 1;
            }
        }
        for pattern in &sub.patterns {
            if glob_match(pattern, channel) {
                let mut out = Vec::new();
                encode_value_into(
                    &mut out,
                    &RespValue::Array(vec![bulk(b"pmessage"), bulk(pattern), bulk(channel), bulk(message)]),
                );
                if sub.tx.send(out).is_ok() {
                    receivers += 1;
                }
            }
        }
    }
    receivers
}

fn sentinel(state: &State, args: &Args) -> RespValue {
    let sub = args.get(1).map(|a| String::from_utf8_lossy(a).to_lowercase()).unwrap_or_default();
    let service = args.get(2).map(|a| String::from_utf8_lossy(a).into_owned()).unwrap_or_default();
    let view = state.sentinel.lock();
    match sub.as_str() {
        "get-master-addr-by-name" => match view.masters.get(&service) {
            Some((host, port)) => RespValue::Array(vec![bulk(host.as_bytes()), bulk(port.to_string().as_bytes())]),
            None => RespValue::NullArray,
        },
        "replicas" | "slaves" => RespValue::Array(
            view.replicas
                .get(&service)
                .map(|list| {
                    list.iter()
                        .map(|(host, port, flags)| {
                            RespValue::Array(vec![
                                bulk(b"name"),
                                bulk(format!("{host}:{port}").as_bytes()),
                                bulk(b"ip"),
                                bulk(host.as_bytes()),
                                bulk(b"port"),
                                bulk(port.to_string().as_bytes()),
                                bulk(b"flags"),
                                bulk(flags.as_bytes()),
                            ])
                        })
                        .collect()
                })
                .unwrap_or_default(),
        ),
        _ => err("ERR unknown sentinel subcommand"),
    }
}

/// Glob matching with `*` and `?`.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

#[test]
fn glob_basics() {
    assert!(glob_match(b"news.*", b"news.sport"));
    assert!(glob_match(b"h?llo", b"hello"));
    assert!(!glob_match(b"news.*", b"weather"));
}
