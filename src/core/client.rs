use super::connection_pool::{ConnectionPool, ConnectionPoolBuilder};
use super::error::{MemcacheError, Result};
use super::item::{legal_key, Item};
use super::metrics::PoolMetricsSnapshot;
use super::protocol::{self, Command, Reply, StoreVerb, DEFAULT_MAX_VALUE_SIZE};
use super::selector::{NodeAddr, ServerList, ServerSelector};
use crate::config::Config;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Result of a multi-key fetch.
///
/// Keys missing from `items` were cache misses, unless `error` is set: then
/// at least one server failed and the map may be incomplete.
#[derive(Debug, Default)]
pub struct MultiGet {
    pub items: HashMap<String, Item>,
    /// Last shard failure seen, if any
    pub error: Option<MemcacheError>,
}

impl MultiGet {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    /// Drops partial results if any shard failed.
    pub fn into_result(self) -> Result<HashMap<String, Item>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.items),
        }
    }
}

struct ClientInner {
    selector: Arc<dyn ServerSelector>,
    pool: ConnectionPool,
    max_value_size: usize,
}

/// A memcached client.
///
/// Cloning is cheap and every clone shares the same selector and connection
/// pool, so one client can serve any number of concurrent callers.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(selector: Arc<dyn ServerSelector>, pool: ConnectionPool) -> Self {
        Self::with_max_value_size(selector, pool, DEFAULT_MAX_VALUE_SIZE)
    }

    /// Like [`Client::new`], rejecting any fetched value that declares more
    /// than `max_value_size` bytes. Zero falls back to the default.
    pub fn with_max_value_size(
        selector: Arc<dyn ServerSelector>,
        pool: ConnectionPool,
        max_value_size: usize,
    ) -> Self {
        let max_value_size = if max_value_size == 0 {
            DEFAULT_MAX_VALUE_SIZE
        } else {
            max_value_size
        };
        Self {
            inner: Arc::new(ClientInner {
                selector,
                pool,
                max_value_size,
            }),
        }
    }

    /// Client over a checksum-sharded list of `servers` with default pool
    /// settings. A server listed more than once gets a proportional share
    /// of keys.
    pub async fn connect<S: AsRef<str>>(servers: &[S]) -> Result<Self> {
        let list = ServerList::new();
        list.set_servers(servers).await?;
        Ok(Self::new(
            Arc::new(list),
            ConnectionPoolBuilder::new().build(),
        ))
    }

    pub async fn from_config(config: &Config) -> Result<Self> {
        let list = ServerList::new();
        list.set_servers(&config.servers).await?;
        let pool = ConnectionPoolBuilder::new()
            .timeout(config.timeout())
            .max_idle_conns(config.max_idle_conns)
            .build();
        Ok(Self::with_max_value_size(
            Arc::new(list),
            pool,
            config.max_value_size,
        ))
    }

    pub fn selector(&self) -> &Arc<dyn ServerSelector> {
        &self.inner.selector
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn max_value_size(&self) -> usize {
        self.inner.max_value_size
    }

    pub fn pool_metrics(&self) -> PoolMetricsSnapshot {
        self.inner.pool.metrics()
    }

    /// Gets the item for `key`. A miss is [`MemcacheError::CacheMiss`].
    pub async fn get(&self, key: &str) -> Result<Item> {
        let node = self.pick(key)?;
        let mut found = None;
        self.execute(&node, &Command::Gets { keys: vec![key] }, &mut |item| {
            found = Some(item)
        })
        .await?;
        found.ok_or(MemcacheError::CacheMiss)
    }

    /// Batch version of [`Client::get`].
    ///
    /// Keys are grouped by server and each group is fetched on its own task.
    /// Invalid keys or an empty selector fail the whole call before any I/O;
    /// server failures are reported in [`MultiGet::error`] next to whatever
    /// was fetched.
    pub async fn get_multi<K: AsRef<str>>(&self, keys: &[K]) -> Result<MultiGet> {
        let mut by_node: HashMap<NodeAddr, Vec<String>> = HashMap::new();
        for key in keys {
            let key = key.as_ref();
            let node = self.pick(key)?;
            by_node.entry(node).or_default().push(key.to_string());
        }

        debug!(
            "get_multi: {} keys across {} servers",
            keys.len(),
            by_node.len()
        );

        let found = Arc::new(Mutex::new(HashMap::new()));
        let mut tasks = JoinSet::new();
        for (node, node_keys) in by_node {
            let client = self.clone();
            let found = Arc::clone(&found);
            tasks.spawn(async move {
                let command = Command::Gets {
                    keys: node_keys.iter().map(String::as_str).collect(),
                };
                let mut add = |item: Item| {
                    let mut found = found.lock().unwrap_or_else(PoisonError::into_inner);
                    found.insert(item.key.clone(), item);
                };
                client
                    .execute(&node, &command, &mut add)
                    .await
                    .map(|_| ())
                    .map_err(|e| (node, e))
            });
        }

        let mut error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err((node, e))) => {
                    warn!("get_multi: shard {} failed: {}", node, e);
                    error = Some(e);
                }
                Err(e) => {
                    warn!("get_multi: shard task failed: {}", e);
                    error = Some(MemcacheError::Task(e.to_string()));
                }
            }
        }

        let items = match Arc::try_unwrap(found) {
            Ok(found) => found.into_inner().unwrap_or_else(PoisonError::into_inner),
            Err(shared) => shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };

        Ok(MultiGet { items, error })
    }

    /// Writes `item` unconditionally.
    pub async fn set(&self, item: &Item) -> Result<()> {
        self.store(StoreVerb::Set, item).await
    }

    /// Writes `item` only if the key holds no value yet; otherwise
    /// [`MemcacheError::NotStored`].
    pub async fn add(&self, item: &Item) -> Result<()> {
        self.store(StoreVerb::Add, item).await
    }

    /// Writes `item` only if the key already holds a value.
    pub async fn replace(&self, item: &Item) -> Result<()> {
        self.store(StoreVerb::Replace, item).await
    }

    /// Writes an item previously returned by a get, provided the value was
    /// neither modified nor evicted since.
    ///
    /// A modified value gives [`MemcacheError::CasConflict`]; an evicted one
    /// gives [`MemcacheError::NotStored`].
    pub async fn compare_and_swap(&self, item: &Item) -> Result<()> {
        self.store(StoreVerb::Cas, item).await
    }

    /// Deletes `key`. [`MemcacheError::CacheMiss`] if it did not exist.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let node = self.pick(key)?;
        self.execute(&node, &Command::Delete { key }, &mut |_| {})
            .await
            .map(|_| ())
    }

    /// Flushes the server that owns the empty key.
    ///
    /// Use [`Client::flush_all`] to clear every server.
    pub async fn delete_all(&self) -> Result<()> {
        let node = self.pick("")?;
        self.execute(&node, &Command::DeleteAll, &mut |_| {})
            .await
            .map(|_| ())
    }

    /// Sends `flush_all` to every server in selector order. The first
    /// failure stops the broadcast; later servers are not contacted.
    pub async fn flush_all(&self) -> Result<()> {
        let mut nodes = Vec::new();
        self.inner.selector.each(&mut |node| {
            nodes.push(node.clone());
            Ok(())
        })?;

        for node in &nodes {
            self.execute(node, &Command::FlushAll, &mut |_| {}).await?;
            debug!("Flushed {}", node);
        }
        Ok(())
    }

    /// Updates the expiry of `key`. `seconds` is relative when below 30
    /// days, otherwise a Unix time; zero means never expire.
    pub async fn touch(&self, key: &str, seconds: i32) -> Result<()> {
        let node = self.pick(key)?;
        self.execute(&node, &Command::Touch { key, seconds }, &mut |_| {})
            .await
            .map(|_| ())
    }

    /// Atomically adds `delta` to a decimal value, wrapping on overflow.
    pub async fn increment(&self, key: &str, delta: u64) -> Result<u64> {
        self.counter(key, Command::Incr { key, delta }).await
    }

    /// Atomically subtracts `delta` from a decimal value, stopping at zero.
    pub async fn decrement(&self, key: &str, delta: u64) -> Result<u64> {
        self.counter(key, Command::Decr { key, delta }).await
    }

    async fn store(&self, verb: StoreVerb, item: &Item) -> Result<()> {
        let node = self.pick(&item.key)?;
        self.execute(&node, &Command::Store { verb, item }, &mut |_| {})
            .await
            .map(|_| ())
    }

    async fn counter(&self, key: &str, command: Command<'_>) -> Result<u64> {
        let node = self.pick(key)?;
        match self.execute(&node, &command, &mut |_| {}).await? {
            Reply::Counter(value) => Ok(value),
            other => Err(MemcacheError::UnexpectedResponse {
                line: format!("{:?}", other),
            }),
        }
    }

    /// Validates `key` and resolves the server that owns it.
    fn pick(&self, key: &str) -> Result<NodeAddr> {
        if !legal_key(key) {
            return Err(MemcacheError::MalformedKey);
        }
        self.inner.selector.pick_server(key)
    }

    /// One request/response exchange with `node`, bounded by the deadline
    /// the connection was handed out with. The connection goes back to the
    /// pool only if its stream is known to be clean.
    async fn execute(
        &self,
        node: &NodeAddr,
        command: &Command<'_>,
        on_item: &mut (dyn FnMut(Item) + Send),
    ) -> Result<Reply> {
        let pool = &self.inner.pool;
        let mut conn = pool.acquire(node.addr()).await?;
        let deadline = conn.deadline();

        let result = match tokio::time::timeout_at(
            deadline,
            protocol::round_trip(
                conn.stream_mut(),
                command,
                self.inner.max_value_size,
                on_item,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(MemcacheError::Timeout { addr: node.addr() }),
        };

        if let Err(e) = &result {
            debug!("{} on {} failed: {}", command.name(), node, e);
        }
        pool.cond_release(conn, &result);
        result
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("selector", &self.inner.selector.name())
            .field("pool", &self.inner.pool)
            .finish()
    }
}
