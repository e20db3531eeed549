//! Redis Cluster topology: the 16384-slot routing table, `CLUSTER NODES`
//! parsing, and the background refresher that keeps the table current.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::bufio::{RecvBuffer, SendBuffer};
use crate::error::ProxyError;
use crate::hashkit::{crc16, trim_hash_tag};
use crate::resp::{self, RespValue};

pub const SLOT_COUNT: usize = 16384;

/// How often the topology is re-fetched, and how long to back off after a
/// failed fetch.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Timeouts for the short-lived fetch connection.
const FETCH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// One line of `CLUSTER NODES` output.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub id: String,
    pub addr: String,
    pub gossip_addr: Option<String>,
    pub role: Option<Role>,
    pub flags: Vec<String>,
    pub slave_of: Option<String>,
    pub config_epoch: u64,
    pub link_state: String,
    pub slots: Vec<u16>,
}

/// Parse a full `CLUSTER NODES` payload into node records.
pub fn parse_cluster_nodes(text: &str) -> Result<Vec<ClusterNode>, ProxyError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_node_line)
        .collect()
}

// 8f02f3135c65482ac00f217df0edb6b9702691f8 172.17.0.2:7001@17001 myself,master - 0 1532770703000 2 connected 5461-10922
fn parse_node_line(line: &str) -> Result<ClusterNode, ProxyError> {
    let fields: Vec<&str> = line.split_ascii_whitespace().collect();
    if fields.len() < 8 {
        return Err(ProxyError::Protocol(format!(
            "short cluster nodes line: {line:?}"
        )));
    }
    let (addr, gossip_addr) = split_gossip_addr(fields[1]);
    let flags: Vec<String> = fields[2].split(',').map(str::to_owned).collect();
    let role = if flags.iter().any(|f| f == "master") {
        Some(Role::Master)
    } else if flags.iter().any(|f| f == "slave") {
        Some(Role::Slave)
    } else {
        None
    };
    let slave_of = match fields[3] {
        "-" => None,
        id => Some(id.to_owned()),
    };
    let config_epoch = fields[6].parse().unwrap_or(0);
    let mut slots = Vec::new();
    for token in &fields[8..] {
        if let Some(range) = parse_slot_field(token) {
            slots.extend(range);
        }
    }
    Ok(ClusterNode {
        id: fields[0].to_owned(),
        addr,
        gossip_addr,
        role,
        flags,
        slave_of,
        config_epoch,
        link_state: fields[7].to_owned(),
        slots,
    })
}

/// Redis 4.x writes addresses as `host:port@gossip-port`.
fn split_gossip_addr(field: &str) -> (String, Option<String>) {
    match field.split_once('@') {
        Some((addr, gossip_port)) => {
            let host = addr.split(':').next().unwrap_or_default();
            (addr.to_owned(), Some(format!("{host}:{gossip_port}")))
        }
        None => (field.to_owned(), None),
    }
}

/// One slot token: a bare slot, an inclusive `a-b` range, or an
/// importing/migrating bracket entry (ignored).
fn parse_slot_field(token: &str) -> Option<Vec<u16>> {
    if token.is_empty() || token == "-" || token.starts_with('[') {
        return None;
    }
    match token.split_once('-') {
        None => token.parse::<u16>().ok().map(|s| vec![s]),
        Some((begin, end)) => {
            let begin = begin.parse::<u16>().ok()?;
            let end = end.parse::<u16>().ok()?;
            if end < begin {
                return None;
            }
            Some((begin..=end).collect())
        }
    }
}

/// Immutable routing snapshot: the master list and the slot→index table.
/// Both sides are published together, so any snapshot a reader holds is
/// self-consistent.
#[derive(Debug)]
pub struct SlotTable {
    nodes: Vec<String>,
    /// `-1` marks an unassigned slot.
    slots: Vec<i32>,
}

impl SlotTable {
    fn empty() -> SlotTable {
        SlotTable {
            nodes: Vec::new(),
            slots: vec![-1; SLOT_COUNT],
        }
    }

    /// Build a fresh table from parsed node records, keeping masters only.
    pub fn build(records: &[ClusterNode]) -> SlotTable {
        let mut nodes = Vec::new();
        let mut slots = vec![-1i32; SLOT_COUNT];
        for record in records {
            if record.role != Some(Role::Master) {
                continue;
            }
            let idx = nodes.len() as i32;
            nodes.push(record.addr.clone());
            for &slot in &record.slots {
                if let Some(entry) = slots.get_mut(usize::from(slot)) {
                    *entry = idx;
                }
            }
        }
        SlotTable { nodes, slots }
    }

    pub fn masters(&self) -> &[String] {
        &self.nodes
    }

    /// Resolve a slot to its owner, `None` while unassigned.
    pub fn get(&self, slot: u16) -> Option<&str> {
        let idx = *self.slots.get(usize::from(slot))?;
        if idx < 0 {
            return None;
        }
        self.nodes.get(idx as usize).map(String::as_str)
    }

    /// Every assigned slot indexes a valid master entry.
    pub fn is_consistent(&self) -> bool {
        self.slots.len() == SLOT_COUNT
            && self
                .slots
                .iter()
                .all(|&idx| idx == -1 || (idx as usize) < self.nodes.len())
    }
}

/// Shared, asynchronously refreshed cluster topology. One per
/// `redis_cluster` executor; the seed set grows as MOVED redirections
/// reveal new members.
pub struct ClusterTopology {
    cluster: String,
    seeds: Mutex<Vec<String>>,
    table: RwLock<Arc<SlotTable>>,
    auth: Option<String>,
}

impl ClusterTopology {
    pub fn new(cluster: &str, seeds: &[String], auth: Option<String>) -> Arc<ClusterTopology> {
        let mut unique: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for addr in seeds {
            if seen.insert(addr.clone()) {
                unique.push(addr.clone());
            }
        }
        Arc::new(ClusterTopology {
            cluster: cluster.to_owned(),
            seeds: Mutex::new(unique),
            table: RwLock::new(Arc::new(SlotTable::empty())),
            auth,
        })
    }

    /// Route a key to its slot owner. `None` while the slot is unassigned
    /// or the table has not been fetched yet.
    pub fn get_node(&self, key: &[u8], hash_tag: &[u8]) -> Option<String> {
        let slot = crc16(trim_hash_tag(key, hash_tag)) & (SLOT_COUNT as u16 - 1);
        self.snapshot().get(slot).map(str::to_owned)
    }

    pub fn snapshot(&self) -> Arc<SlotTable> {
        let guard = match self.table.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(&guard)
    }

    fn publish(&self, table: SlotTable) {
        let mut guard = match self.table.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(table);
    }

    /// Remember a member address learned from config or a MOVED redirect.
    pub fn add_seed(&self, addr: &str) {
        let mut seeds = match self.seeds.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !seeds.iter().any(|s| s == addr) {
            seeds.push(addr.to_owned());
        }
    }

    fn pick_seed(&self) -> Option<String> {
        let seeds = match self.seeds.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        seeds.first().cloned()
    }

    /// Rotate the seed list so a dead first seed does not wedge refresh.
    fn rotate_seeds(&self) {
        let mut seeds = match self.seeds.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if seeds.len() > 1 {
            let first = seeds.remove(0);
            seeds.push(first);
        }
    }

    /// Fetch from one seed and publish the resulting table.
    pub async fn refresh_once(&self) -> Result<(), ProxyError> {
        let Some(addr) = self.pick_seed() else {
            return Err(ProxyError::Config("cluster has no seed addresses".into()));
        };
        let records = fetch_nodes(&addr, self.auth.as_deref()).await?;
        let table = SlotTable::build(&records);
        tracing::debug!(
            cluster = %self.cluster,
            seed = %addr,
            masters = table.masters().len(),
            "published cluster topology"
        );
        self.publish(table);
        Ok(())
    }

    /// Background refresh loop; runs until the owning executor is closed.
    pub async fn run_refresher(self: Arc<ClusterTopology>) {
        loop {
            match self.refresh_once().await {
                Ok(()) => tokio::time::sleep(REFRESH_INTERVAL).await,
                Err(err) => {
                    tracing::warn!(cluster = %self.cluster, error = %err, "topology refresh failed");
                    self.rotate_seeds();
                    tokio::time::sleep(REFRESH_INTERVAL).await;
                }
            }
        }
    }
}

/// Open a short-lived connection and fetch `CLUSTER NODES`.
async fn fetch_nodes(addr: &str, auth: Option<&str>) -> Result<Vec<ClusterNode>, ProxyError> {
    let mut stream = timeout(FETCH_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| timeout_err("dial"))??;
    let mut wbuf = SendBuffer::new();
    let mut rbuf = RecvBuffer::new();

    if let Some(password) = auth {
        resp::RedisRequest::from_parts(b"AUTH", &[password.as_bytes()]).encode_into(&mut wbuf);
        timeout(FETCH_TIMEOUT, wbuf.flush(&mut stream))
            .await
            .map_err(|_| timeout_err("auth write"))??;
        let reply = read_value(&mut stream, &mut rbuf).await?;
        if let RespValue::Error(e) = reply {
            return Err(ProxyError::Protocol(format!(
                "cluster auth rejected: {}",
                String::from_utf8_lossy(&e)
            )));
        }
    }

    resp::RedisRequest::from_parts(b"CLUSTER", &[&b"NODES"[..]]).encode_into(&mut wbuf);
    timeout(FETCH_TIMEOUT, wbuf.flush(&mut stream))
        .await
        .map_err(|_| timeout_err("write"))??;

    let reply = read_value(&mut stream, &mut rbuf).await?;
    let payload = match reply {
        RespValue::Bulk(data) => data,
        RespValue::Error(e) => {
            return Err(ProxyError::Protocol(format!(
                "cluster nodes rejected: {}",
                String::from_utf8_lossy(&e)
            )));
        }
        other => {
            return Err(ProxyError::Protocol(format!(
                "unexpected cluster nodes reply: {other:?}"
            )));
        }
    };
    parse_cluster_nodes(&text_of(&payload)?)
}

async fn read_value(stream: &mut TcpStream, rbuf: &mut RecvBuffer) -> Result<RespValue, ProxyError> {
    loop {
        if let Some(value) = resp::decode_value(rbuf)? {
            return Ok(value);
        }
        let n = timeout(FETCH_TIMEOUT, rbuf.fill(stream))
            .await
            .map_err(|_| timeout_err("read"))??;
        if n == 0 {
            return Err(ProxyError::ConnectionClosed);
        }
    }
}

fn text_of(data: &Bytes) -> Result<String, ProxyError> {
    String::from_utf8(data.to_vec())
        .map_err(|_| ProxyError::Protocol("cluster nodes payload is not utf-8".into()))
}

fn timeout_err(what: &str) -> ProxyError {
    ProxyError::Backend(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("cluster fetch {what} timed out"),
    ))
}
