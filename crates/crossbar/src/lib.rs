//! crossbar: a multi-protocol cache proxy.
//!
//! Clients speak the unmodified memcache (text or binary) or redis protocol
//! to the proxy. Each cluster gets an [`executor::Executor`] that routes
//! every request to a backend node (consistent hashing, or the Redis
//! Cluster slot table), pipelines batched I/O over a pool of persistent
//! connections, and hands replies back to the client session in submission
//! order.

pub mod bufio;
pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod hashkit;
pub mod memcache;
pub mod memcache_bin;
pub mod message;
pub mod node;
pub mod resp;
pub mod server;
