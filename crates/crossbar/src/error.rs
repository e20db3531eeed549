//! Error model shared by the proxy front end, executor, and backend I/O.

use std::sync::Arc;

use thiserror::Error;

/// Shared, cloneable handle to an error attached to an in-flight message.
///
/// Batch-level failures tag every message in the batch with the same error,
/// so the underlying error is reference-counted rather than cloned.
pub type MsgError = Arc<ProxyError>;

/// Error kinds raised by the proxy core.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid configuration; fails startup.
    #[error("invalid config: {0}")]
    Config(String),

    /// Malformed client or backend protocol stream; closes the offending session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket-level failure talking to a backend; fails the current batch only.
    #[error("backend io: {0}")]
    Backend(#[from] std::io::Error),

    /// A batch failure tagged with the cluster and backend address it hit.
    #[error("backend {addr} (cluster {cluster}): {source}")]
    Node {
        cluster: String,
        addr: String,
        #[source]
        source: Box<ProxyError>,
    },

    /// Key hashed to no live backend node.
    #[error("no backend node for key")]
    NoRoute,

    /// Redis Cluster redirection could not be completed.
    #[error("redirection failed: {0}")]
    Redirection(String),

    /// The cluster's executor has been closed.
    #[error("executor already closed")]
    ExecutorClosed,

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl ProxyError {
    /// Wrap a batch error with the cluster and node address it occurred on.
    pub fn at_node(self, cluster: &str, addr: &str) -> ProxyError {
        ProxyError::Node {
            cluster: cluster.to_owned(),
            addr: addr.to_owned(),
            source: Box::new(self),
        }
    }
}
