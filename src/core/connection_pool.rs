use super::error::{MemcacheError, Result};
use super::metrics::{AtomicPoolMetrics, PoolMetrics, PoolMetricsSnapshot};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default socket read/write deadline for one operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
/// Default number of idle connections kept per address.
pub const DEFAULT_MAX_IDLE_CONNS: usize = 2;

/// Byte stream a connection runs over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Buffered stream handed to the protocol codec.
pub type ConnStream = BufStream<BoxedTransport>;

/// Opens new transports to a node.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial `addr`, giving up after `timeout`.
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<BoxedTransport>;
}

/// Dials plain TCP connections tuned for small request/response traffic.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<BoxedTransport> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(MemcacheError::ConnectTimeout { addr })
            }
            Ok(Err(e)) => return Err(MemcacheError::Io(e)),
            Err(_) => return Err(MemcacheError::ConnectTimeout { addr }),
        };

        optimize_socket_for_latency(&stream);

        Ok(Box::new(stream))
    }
}

/// Optimize TCP socket for low latency
fn optimize_socket_for_latency(stream: &TcpStream) {
    // Disable Nagle's algorithm for lower latency
    let _ = stream.set_nodelay(true);

    let socket_ref = socket2::SockRef::from(stream);
    // 32KB buffers balance latency vs throughput for cache operations
    let _ = socket_ref.set_send_buffer_size(32768);
    let _ = socket_ref.set_recv_buffer_size(32768);
}

/// A connection to one node, owned either by the free list or by exactly one
/// in-flight operation.
pub struct Connection {
    addr: SocketAddr,
    stream: ConnStream,
    deadline: Instant,
}

impl Connection {
    fn new(addr: SocketAddr, transport: BoxedTransport, timeout: Duration) -> Self {
        Self {
            addr,
            stream: BufStream::new(transport),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Point in time by which the current operation must finish.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn stream_mut(&mut self) -> &mut ConnStream {
        &mut self.stream
    }

    fn extend_deadline(&mut self, timeout: Duration) {
        self.deadline = Instant::now() + timeout;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Per-address pool of idle connections.
///
/// Connections are created on demand; only the idle ones are capped. The
/// whole map sits behind one mutex that is never held across I/O.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    timeout: Duration,
    max_idle_conns: usize,
    free: Mutex<HashMap<SocketAddr, Vec<Connection>>>,
    metrics: Arc<AtomicPoolMetrics>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, timeout: Duration, max_idle_conns: usize) -> Self {
        Self {
            connector,
            timeout: if timeout.is_zero() { DEFAULT_TIMEOUT } else { timeout },
            max_idle_conns: if max_idle_conns == 0 {
                DEFAULT_MAX_IDLE_CONNS
            } else {
                max_idle_conns
            },
            free: Mutex::new(HashMap::new()),
            metrics: Arc::new(AtomicPoolMetrics::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_idle_conns(&self) -> usize {
        self.max_idle_conns
    }

    /// Takes an idle connection for `addr` or dials a new one. Either way the
    /// connection comes back with a fresh deadline.
    pub async fn acquire(&self, addr: SocketAddr) -> Result<Connection> {
        if let Some(mut conn) = self.take_idle(addr) {
            conn.extend_deadline(self.timeout);
            self.metrics.record_reuse();
            debug!("Reusing idle connection to {}", addr);
            return Ok(conn);
        }

        self.metrics.record_connection_attempt();
        let start = Instant::now();
        match self.connector.connect(addr, self.timeout).await {
            Ok(transport) => {
                self.metrics.record_connection_success(start.elapsed());
                debug!("🔗 Dialed new connection to {}", addr);
                Ok(Connection::new(addr, transport, self.timeout))
            }
            Err(e @ MemcacheError::ConnectTimeout { .. }) => {
                self.metrics.record_connect_timeout();
                warn!("Connect to {} timed out after {:?}", addr, self.timeout);
                Err(e)
            }
            Err(e) => {
                self.metrics.record_connection_failure();
                warn!("Connect to {} failed: {}", addr, e);
                Err(e)
            }
        }
    }

    /// Parks a connection on its address's free list, closing it instead if
    /// the list is already full.
    pub fn release(&self, conn: Connection) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = free.entry(conn.addr).or_default();
        if idle.len() >= self.max_idle_conns {
            drop(free);
            self.metrics.record_over_capacity();
            debug!("Free list for {} is full, closing connection", conn.addr);
            return;
        }
        idle.push(conn);
        self.metrics.record_release();
    }

    /// Closes a connection whose stream state can no longer be trusted.
    pub fn discard(&self, conn: Connection) {
        self.metrics.record_discard();
        debug!("Discarding connection to {}", conn.addr);
        drop(conn);
    }

    /// Releases the connection if the operation succeeded or failed with a
    /// cache-level error, discards it otherwise.
    pub fn cond_release<T>(&self, conn: Connection, result: &Result<T>) {
        match result {
            Ok(_) => self.release(conn),
            Err(e) if e.is_resumable() => self.release(conn),
            Err(e) => {
                warn!("Closing connection to {} after error: {}", conn.addr, e);
                self.discard(conn);
            }
        }
    }

    /// Number of idle connections currently held for `addr`.
    pub fn idle_count(&self, addr: SocketAddr) -> usize {
        let free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        free.get(&addr).map_or(0, Vec::len)
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn take_idle(&self, addr: SocketAddr) -> Option<Connection> {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        free.get_mut(&addr).and_then(Vec::pop)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("timeout", &self.timeout)
            .field("max_idle_conns", &self.max_idle_conns)
            .finish()
    }
}

/// Builder for creating connection pools
pub struct ConnectionPoolBuilder {
    connector: Arc<dyn Connector>,
    timeout: Duration,
    max_idle_conns: usize,
}

impl ConnectionPoolBuilder {
    pub fn new() -> Self {
        Self {
            connector: Arc::new(TcpConnector),
            timeout: DEFAULT_TIMEOUT,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
        }
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_idle_conns(mut self, max_idle_conns: usize) -> Self {
        self.max_idle_conns = max_idle_conns;
        self
    }

    pub fn build(self) -> ConnectionPool {
        ConnectionPool::new(self.connector, self.timeout, self.max_idle_conns)
    }
}

impl Default for ConnectionPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
