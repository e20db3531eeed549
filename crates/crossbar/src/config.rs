//! Cluster configuration: the `[[clusters]]` file model, defaulting, and
//! startup validation.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ProxyError;
use crate::hashkit::{HashDistribution, HashMethod};
use crate::node::ConnSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    Memcache,
    MemcacheBinary,
    Redis,
    RedisCluster,
}

impl CacheType {
    pub fn is_redis(self) -> bool {
        matches!(self, CacheType::Redis | CacheType::RedisCluster)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenProto {
    Tcp,
    Unix,
}

fn default_listen_proto() -> ListenProto {
    ListenProto::Tcp
}

fn default_node_connections() -> u32 {
    1
}

fn default_ping_fail_limit() -> u32 {
    3
}

/// One proxied cache pool.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub hash_method: HashMethod,
    #[serde(default)]
    pub hash_distribution: HashDistribution,
    /// Empty, or exactly two characters (e.g. `{}`).
    #[serde(default)]
    pub hash_tag: String,
    pub cache_type: CacheType,
    #[serde(default = "default_listen_proto")]
    pub listen_proto: ListenProto,
    /// TCP address or unix socket path, per `listen_proto`.
    pub listen_addr: String,
    /// Forwarded to redis backends on connect when non-empty.
    #[serde(default)]
    pub redis_auth: String,
    /// Milliseconds; 0 waits indefinitely.
    #[serde(default)]
    pub dial_timeout: u64,
    #[serde(default)]
    pub read_timeout: u64,
    #[serde(default)]
    pub write_timeout: u64,
    /// Sockets opened per backend address.
    #[serde(default = "default_node_connections")]
    pub node_connections: u32,
    #[serde(default = "default_ping_fail_limit")]
    pub ping_fail_limit: u32,
    #[serde(default)]
    pub ping_auto_eject: bool,
    /// `host:port:weight` or `host:port:weight alias` entries.
    pub servers: Vec<String>,
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.name.is_empty() {
            return Err(ProxyError::Config("cluster name must not be empty".into()));
        }
        if !self.hash_tag.is_empty() && self.hash_tag.len() != 2 {
            return Err(ProxyError::Config(format!(
                "cluster {}: hash_tag must be empty or two characters",
                self.name
            )));
        }
        if self.servers.is_empty() {
            return Err(ProxyError::Config(format!(
                "cluster {}: servers list must not be empty",
                self.name
            )));
        }
        if self.node_connections == 0 {
            return Err(ProxyError::Config(format!(
                "cluster {}: node_connections must be at least 1",
                self.name
            )));
        }
        if self.listen_addr.is_empty() {
            return Err(ProxyError::Config(format!(
                "cluster {}: listen_addr must not be empty",
                self.name
            )));
        }
        Ok(())
    }

    pub fn conn_settings(&self) -> ConnSettings {
        let auth = if self.redis_auth.is_empty() || !self.cache_type.is_redis() {
            None
        } else {
            Some(self.redis_auth.clone())
        };
        ConnSettings {
            cluster: self.name.clone(),
            cache_type: self.cache_type,
            dial_timeout: millis(self.dial_timeout),
            read_timeout: millis(self.read_timeout),
            write_timeout: millis(self.write_timeout),
            auth,
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// The whole proxy configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ProxyError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            ProxyError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config, ProxyError> {
        let config: Config =
            toml::from_str(text).map_err(|err| ProxyError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ProxyError> {
        if self.clusters.is_empty() {
            return Err(ProxyError::Config("no clusters configured".into()));
        }
        let mut names = HashSet::new();
        let mut listens = HashSet::new();
        for cluster in &self.clusters {
            cluster.validate()?;
            if !names.insert(cluster.name.as_str()) {
                return Err(ProxyError::Config(format!(
                    "duplicate cluster name {}",
                    cluster.name
                )));
            }
            if !listens.insert(cluster.listen_addr.as_str()) {
                return Err(ProxyError::Config(format!(
                    "duplicate listen_addr {}",
                    cluster.listen_addr
                )));
            }
        }
        Ok(())
    }
}
