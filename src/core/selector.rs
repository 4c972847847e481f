use super::error::{MemcacheError, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// A resolved memcached node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddr {
    addr: SocketAddr,
    server: String,
}

impl NodeAddr {
    pub fn new(server: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            addr,
            server: server.into(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The `host:port` string this node was configured as.
    pub fn server(&self) -> &str {
        &self.server
    }
}

impl From<SocketAddr> for NodeAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.to_string(), addr)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Chooses the node that owns a key.
///
/// Implementations must be safe for concurrent use by many callers.
pub trait ServerSelector: Send + Sync {
    /// Returns the node a given key should be sharded onto.
    fn pick_server(&self, key: &str) -> Result<NodeAddr>;

    /// Calls `visitor` for every node in order, stopping at the first error.
    fn each(&self, visitor: &mut dyn FnMut(&NodeAddr) -> Result<()>) -> Result<()>;

    /// Selector name
    fn name(&self) -> &str;
}

/// Checksum-sharded node list.
///
/// Every node gets equal weight; listing a server more than once gives it a
/// proportional share. This is modulo sharding, not a consistent-hash ring:
/// changing the node count remaps most keys.
#[derive(Debug, Default)]
pub struct ServerList {
    nodes: RwLock<Arc<Vec<NodeAddr>>>,
}

impl ServerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a list from already-resolved addresses.
    pub fn from_nodes(nodes: Vec<NodeAddr>) -> Self {
        Self {
            nodes: RwLock::new(Arc::new(nodes)),
        }
    }

    /// Resolves `servers` and replaces the node list.
    ///
    /// Every server is resolved before anything changes; if one fails the
    /// previous list stays in place. No connection is attempted.
    pub async fn set_servers<S: AsRef<str>>(&self, servers: &[S]) -> Result<()> {
        let mut resolved = Vec::with_capacity(servers.len());
        for server in servers {
            resolved.push(resolve(server.as_ref()).await?);
        }

        info!(
            "Server list updated: [{}]",
            resolved
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        *nodes = Arc::new(resolved);
        Ok(())
    }

    /// Current node list.
    pub fn servers(&self) -> Arc<Vec<NodeAddr>> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&nodes)
    }
}

impl ServerSelector for ServerList {
    fn pick_server(&self, key: &str) -> Result<NodeAddr> {
        let nodes = self.servers();
        match nodes.len() {
            0 => Err(MemcacheError::NoServers),
            1 => Ok(nodes[0].clone()),
            n => {
                let checksum = crc32fast::hash(key.as_bytes());
                Ok(nodes[checksum as usize % n].clone())
            }
        }
    }

    fn each(&self, visitor: &mut dyn FnMut(&NodeAddr) -> Result<()>) -> Result<()> {
        let nodes = self.servers();
        for node in nodes.iter() {
            visitor(node)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "server_list"
    }
}

async fn resolve(server: &str) -> Result<NodeAddr> {
    let resolve_err = |reason: String| MemcacheError::Resolve {
        server: server.to_string(),
        reason,
    };

    let mut addrs = tokio::net::lookup_host(server)
        .await
        .map_err(|e| resolve_err(e.to_string()))?;

    addrs
        .next()
        .map(|addr| NodeAddr::new(server, addr))
        .ok_or_else(|| resolve_err("no addresses found".to_string()))
}
