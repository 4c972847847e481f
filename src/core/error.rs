use std::net::SocketAddr;

/// Every failure the client can report.
///
/// The cache-level outcomes (`CacheMiss`, `NotStored`, `CasConflict`,
/// `MalformedKey`) leave the connection's byte stream in a known state; see
/// [`MemcacheError::is_resumable`].
#[derive(Debug, thiserror::Error)]
pub enum MemcacheError {
    #[error("memcache: no servers configured or available")]
    NoServers,
    #[error("malformed: key is too long or contains invalid characters")]
    MalformedKey,
    #[error("memcache: cache miss")]
    CacheMiss,
    #[error("memcache: item not stored")]
    NotStored,
    #[error("memcache: compare-and-swap conflict")]
    CasConflict,
    #[error("memcache: server error: {0}")]
    ServerError(String),
    #[error("memcache: client error: {0}")]
    ClientError(String),
    #[error("memcache: connect timeout to {addr}")]
    ConnectTimeout { addr: SocketAddr },
    #[error("memcache: i/o deadline exceeded on {addr}")]
    Timeout { addr: SocketAddr },
    #[error("memcache: i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("memcache: unexpected response line: {line:?}")]
    UnexpectedResponse { line: String },
    #[error("memcache: corrupt get result read for key {key:?}")]
    CorruptValue { key: String },
    #[error("memcache: failed to resolve server {server:?}: {reason}")]
    Resolve { server: String, reason: String },
    #[error("memcache: fan-out task failed: {0}")]
    Task(String),
}

impl MemcacheError {
    /// Whether a connection that produced this error can go back to the pool.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            MemcacheError::CacheMiss
                | MemcacheError::CasConflict
                | MemcacheError::NotStored
                | MemcacheError::MalformedKey
        )
    }

    pub(crate) fn unexpected(line: &[u8]) -> Self {
        MemcacheError::UnexpectedResponse {
            line: String::from_utf8_lossy(line).into_owned(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MemcacheError>;
