//! RESP client engine: pooled connections, pipelines and transactions,
//! publish/subscribe with automatic resubscribe, server-side script caching
//! and sentinel-based master/replica discovery.
//!
//! The core is async (tokio). [`client`] offers a blocking facade driven by
//! a process-wide runtime.

pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod pubsub;
pub mod resp;
pub mod response;
pub mod runtime;
pub mod script;
pub mod sentinel;

pub use client::{Redis, RedisPipeline, RedisPubSub, RedisScript, RedisSentinel};
pub use command::{Command, ToArg};
pub use config::{Address, ConnectionConfig, Topology};
pub use error::{Error, RedisErrorKind, Result};
pub use executor::CommandExecutor;
pub use pipeline::Pipeline;
pub use pubsub::{Message, MessageKind, PubSub, PubSubStatus};
pub use response::{Value, ResponseCallbacks};
pub use script::{Script, ScriptCall};
pub use sentinel::SentinelTopology;
