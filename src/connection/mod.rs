pub mod conn;
pub mod pool;

pub use conn::RedisConnection;
pub use pool::{ConnectionPool, ConnectionSource, PoolGuard};
