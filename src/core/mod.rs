pub mod client;
pub mod connection_pool;
pub mod error;
pub mod item;
pub mod metrics;
pub mod protocol;
pub mod selector;

pub use client::{Client, MultiGet};
pub use connection_pool::{
    BoxedTransport, Connection, ConnectionPool, ConnectionPoolBuilder, Connector, TcpConnector,
    DEFAULT_MAX_IDLE_CONNS, DEFAULT_TIMEOUT,
};
pub use error::{MemcacheError, Result};
pub use item::{legal_key, Item, MAX_KEY_LEN};
pub use metrics::{AtomicPoolMetrics, PoolMetrics, PoolMetricsSnapshot};
pub use selector::{NodeAddr, ServerList, ServerSelector};
