//! Per-cluster executor: key routing, per-node batch queues, backend worker
//! tasks, and ping-based node ejection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cluster::ClusterTopology;
use crate::config::{CacheType, ClusterConfig};
use crate::error::ProxyError;
use crate::hashkit::{trim_hash_tag, HashRing};
use crate::message::{
    restore, Dispatch, Message, MsgBatch, MsgBatchAllocator, Origin, Slot, WindowAbort,
};
use crate::node::{self, ConnSettings, NodeConn};

/// Depth of each per-node batch queue. A full queue blocks the dispatching
/// session, which is the intended backpressure.
const QUEUE_DEPTH: usize = 1024;

const PING_BACKOFF_BASE: Duration = Duration::from_millis(100);
const PING_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Exponential backoff on a per-pinger retry counter.
fn backoff(retries: u32) -> Duration {
    let factor = 1u32 << retries.min(10);
    PING_BACKOFF_BASE
        .saturating_mul(factor)
        .min(PING_BACKOFF_CAP)
}

/// One parsed `servers` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerEntry {
    pub addr: String,
    pub weight: u32,
    pub alias: Option<String>,
}

/// Parse `host:port:weight` / `host:port:weight alias` lines. Aliased and
/// bare entries may not mix.
pub(crate) fn parse_servers(servers: &[String]) -> Result<Vec<ServerEntry>, ProxyError> {
    let mut entries = Vec::new();
    let mut aliased: Option<bool> = None;
    for line in servers {
        let (addr_part, alias) = match line.split_once(' ') {
            Some((addr, alias)) => (addr, Some(alias.trim())),
            None => (line.as_str(), None),
        };
        if let Some(alias) = alias {
            if alias.is_empty() || alias.contains(' ') {
                return Err(ProxyError::Config(format!("bad server entry {line:?}")));
            }
        }
        match (aliased, alias.is_some()) {
            (None, now) => aliased = Some(now),
            (Some(before), now) if before != now => {
                return Err(ProxyError::Config(
                    "servers must be all aliased or all bare".into(),
                ));
            }
            _ => {}
        }
        let parts: Vec<&str> = addr_part.split(':').collect();
        let [host, port, weight] = parts.as_slice() else {
            return Err(ProxyError::Config(format!("bad server entry {line:?}")));
        };
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(ProxyError::Config(format!("bad server entry {line:?}")));
        }
        let weight: u32 = weight
            .parse()
            .ok()
            .filter(|&w| w > 0)
            .ok_or_else(|| ProxyError::Config(format!("bad server weight in {line:?}")))?;
        entries.push(ServerEntry {
            addr: format!("{host}:{port}"),
            weight,
            alias: alias.map(str::to_owned),
        });
    }
    Ok(entries)
}

enum Router {
    /// Consistent hashing, optionally through an alias → address map.
    Ring {
        ring: Arc<HashRing>,
        alias_map: Option<HashMap<String, String>>,
    },
    /// Redis Cluster slot table.
    Cluster(Arc<ClusterTopology>),
}

struct NodeQueue {
    senders: Vec<mpsc::Sender<MsgBatch>>,
    next: AtomicUsize,
}

impl NodeQueue {
    /// Round-robin over the node's `node_connections` queues.
    fn pick(&self) -> mpsc::Sender<MsgBatch> {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        self.senders[i % self.senders.len()].clone()
    }
}

/// Dispatcher for one configured cluster. Owns every backend connection,
/// queue, and pinger of that cluster.
pub struct Executor {
    cfg: Arc<ClusterConfig>,
    settings: ConnSettings,
    router: Router,
    queues: RwLock<HashMap<String, NodeQueue>>,
    closed: AtomicBool,
    /// Pinger tasks plus the topology refresher; aborted on close. Worker
    /// tasks are not tracked: they exit when their queue senders drop.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// Build the router, spawn the per-node workers, and (when enabled)
    /// the pingers and topology refresher.
    pub fn start(cfg: Arc<ClusterConfig>) -> Result<Arc<Executor>, ProxyError> {
        let entries = parse_servers(&cfg.servers)?;
        if entries.is_empty() {
            return Err(ProxyError::Config(format!(
                "cluster {}: servers list must not be empty",
                cfg.name
            )));
        }
        let settings = cfg.conn_settings();

        let router = if cfg.cache_type == CacheType::RedisCluster {
            let seeds: Vec<String> = entries.iter().map(|e| e.addr.clone()).collect();
            Router::Cluster(ClusterTopology::new(
                &cfg.name,
                &seeds,
                settings.auth.clone(),
            ))
        } else {
            let ring = Arc::new(HashRing::new(cfg.hash_method, cfg.hash_distribution));
            let aliased = entries[0].alias.is_some();
            let names: Vec<String> = entries
                .iter()
                .map(|e| {
                    if aliased {
                        e.alias.clone().unwrap_or_default()
                    } else {
                        e.addr.clone()
                    }
                })
                .collect();
            let weights: Vec<u32> = entries.iter().map(|e| e.weight).collect();
            ring.init(&names, &weights)?;
            let alias_map = aliased.then(|| {
                entries
                    .iter()
                    .map(|e| (e.alias.clone().unwrap_or_default(), e.addr.clone()))
                    .collect()
            });
            Router::Ring { ring, alias_map }
        };

        let executor = Arc::new(Executor {
            settings,
            router,
            queues: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            cfg,
        });

        for entry in &entries {
            let queue = executor.spawn_node(&entry.addr);
            write_lock(&executor.queues).insert(entry.addr.clone(), queue);
        }

        match &executor.router {
            Router::Cluster(topology) => {
                let handle = tokio::spawn(Arc::clone(topology).run_refresher());
                lock(&executor.tasks).push(handle);
            }
            Router::Ring { ring, alias_map } => {
                if executor.cfg.ping_auto_eject {
                    for entry in &entries {
                        let ring_name = match alias_map {
                            Some(_) => entry.alias.clone().unwrap_or_default(),
                            None => entry.addr.clone(),
                        };
                        let handle = tokio::spawn(ping_loop(Pinger {
                            cluster: executor.cfg.name.clone(),
                            addr: entry.addr.clone(),
                            ring_name,
                            weight: entry.weight,
                            fail_limit: executor.cfg.ping_fail_limit.max(1),
                            ring: Arc::clone(ring),
                            settings: executor.settings.clone(),
                        }));
                        lock(&executor.tasks).push(handle);
                    }
                }
            }
        }

        Ok(executor)
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    /// Route every message of a pipeline window into per-node batches and
    /// push each non-empty batch onto its backend queue.
    ///
    /// A routing failure aborts the whole window before any batch is
    /// pushed; the messages come back with the abort so the session can
    /// still answer each request.
    pub async fn execute(&self, window: Vec<Message>) -> Result<Dispatch, WindowAbort> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WindowAbort {
                err: ProxyError::ExecutorClosed,
                slots: window.into_iter().map(Slot::restored).collect(),
            });
        }

        let mut slots: Vec<Slot> = Vec::with_capacity(window.len());
        let mut alloc = MsgBatchAllocator::new();
        let mut no_route = false;

        for (i, mut msg) in window.into_iter().enumerate() {
            if msg.is_composite() {
                let subs = msg.take_subs();
                let mut slot = Slot::composite(msg, subs.len());
                for (j, sub) in subs.into_iter().enumerate() {
                    let addr = if no_route {
                        None
                    } else {
                        self.route(sub.request().key())
                    };
                    match addr {
                        Some(addr) => alloc.add(
                            &addr,
                            Origin {
                                slot: i,
                                sub: Some(j),
                            },
                            sub,
                        ),
                        None => {
                            no_route = true;
                            if let Some(parent) = slot.parent.as_mut() {
                                parent.fail(Arc::new(ProxyError::NoRoute));
                            }
                            slot.subs[j] = Some(sub);
                        }
                    }
                }
                slots.push(slot);
            } else {
                let addr = if no_route {
                    None
                } else {
                    self.route(msg.request().key())
                };
                match addr {
                    Some(addr) => {
                        slots.push(Slot::single());
                        alloc.add(&addr, Origin { slot: i, sub: None }, msg);
                    }
                    None => {
                        no_route = true;
                        msg.fail(Arc::new(ProxyError::NoRoute));
                        slots.push(Slot::restored(msg));
                    }
                }
            }
        }

        if no_route {
            // No partial dispatch: hand everything back unrouted.
            for mb in alloc.into_batches() {
                let (origins, msgs) = mb.into_parts();
                for (origin, msg) in origins.into_iter().zip(msgs) {
                    restore(&mut slots, origin, msg);
                }
            }
            return Err(WindowAbort {
                err: ProxyError::NoRoute,
                slots,
            });
        }

        let mut completions = Vec::new();
        for mut mb in alloc.into_batches() {
            let (tx, rx) = oneshot::channel();
            mb.arm(tx);
            completions.push(rx);
            match self.queue_sender(mb.addr()) {
                Ok(sender) => {
                    if let Err(send_err) = sender.send(mb).await {
                        // Workers are gone; answer the batch here.
                        let mut mb = send_err.0;
                        mb.fail_all(ProxyError::ExecutorClosed, &self.cfg.name);
                        mb.complete();
                    }
                }
                Err(err) => {
                    mb.fail_all(err, &self.cfg.name);
                    mb.complete();
                }
            }
        }
        Ok(Dispatch::new(slots, completions))
    }

    /// Resolve a key to a backend address.
    pub(crate) fn route(&self, key: &[u8]) -> Option<String> {
        let tag = self.cfg.hash_tag.as_bytes();
        match &self.router {
            Router::Ring { ring, alias_map } => {
                let name = ring.get(trim_hash_tag(key, tag))?;
                match alias_map {
                    Some(map) => map.get(&name).cloned(),
                    None => Some(name),
                }
            }
            Router::Cluster(topology) => topology.get_node(key, tag),
        }
    }

    fn queue_sender(&self, addr: &str) -> Result<mpsc::Sender<MsgBatch>, ProxyError> {
        if let Some(queue) = read_lock(&self.queues).get(addr) {
            return Ok(queue.pick());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(ProxyError::ExecutorClosed);
        }
        // Unknown address: a cluster node discovered after startup.
        let mut queues = write_lock(&self.queues);
        if !queues.contains_key(addr) {
            let queue = self.spawn_node(addr);
            queues.insert(addr.to_owned(), queue);
        }
        Ok(queues[addr].pick())
    }

    /// Create the `node_connections` queues for one backend address and
    /// spawn a worker per queue.
    fn spawn_node(&self, addr: &str) -> NodeQueue {
        let topology = match &self.router {
            Router::Cluster(t) => Some(Arc::clone(t)),
            Router::Ring { .. } => None,
        };
        let mut senders = Vec::new();
        for _ in 0..self.cfg.node_connections.max(1) {
            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
            senders.push(tx);
            tokio::spawn(worker_loop(
                self.cfg.name.clone(),
                addr.to_owned(),
                self.settings.clone(),
                topology.clone(),
                rx,
            ));
        }
        NodeQueue {
            senders,
            next: AtomicUsize::new(0),
        }
    }

    /// Close the executor. Later `execute` calls fail with
    /// `ExecutorClosed`; in-flight batches drain through their workers.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(cluster = %self.cfg.name, "executor closing");
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        // Dropping the senders ends each worker after its in-flight batch.
        write_lock(&self.queues).clear();
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.close();
    }
}

/// One worker: owns one backend connection, consumes one queue. Never exits
/// except when the executor closes its queue.
async fn worker_loop(
    cluster: String,
    addr: String,
    settings: ConnSettings,
    topology: Option<Arc<ClusterTopology>>,
    mut rx: mpsc::Receiver<MsgBatch>,
) {
    let mut conn: Option<Box<dyn NodeConn>> = None;
    while let Some(mut mb) = rx.recv().await {
        let c = match &mut conn {
            Some(c) => c,
            None => match node::connect(&settings, &addr, topology.clone()).await {
                Ok(c) => conn.insert(c),
                Err(err) => {
                    tracing::warn!(cluster = %cluster, addr = %addr, error = %err, "backend dial failed");
                    mb.fail_all(err, &cluster);
                    mb.complete();
                    continue;
                }
            },
        };
        if let Err(err) = c.write_batch(&mut mb).await {
            tracing::warn!(cluster = %cluster, addr = %addr, error = %err, "batch write failed");
            mb.fail_all(err, &cluster);
            mb.complete();
            if let Some(mut dead) = conn.take() {
                dead.close().await;
            }
            continue;
        }
        if let Err(err) = c.read_batch(&mut mb).await {
            tracing::warn!(cluster = %cluster, addr = %addr, error = %err, "batch read failed");
            mb.fail_all(err, &cluster);
            mb.complete();
            if let Some(mut dead) = conn.take() {
                dead.close().await;
            }
            continue;
        }
        mb.complete();
    }
    if let Some(mut c) = conn.take() {
        c.close().await;
    }
}

struct Pinger {
    cluster: String,
    /// Address the probe dials.
    addr: String,
    /// Name the node carries on the ring (the alias when aliased).
    ring_name: String,
    weight: u32,
    fail_limit: u32,
    ring: Arc<HashRing>,
    settings: ConnSettings,
}

/// Ping loop: `healthy ⇌ failing → ejected → healthy` (first success
/// re-admits at the original weight).
async fn ping_loop(p: Pinger) {
    let mut conn: Option<Box<dyn NodeConn>> = None;
    let mut failure: u32 = 0;
    let mut retries: u32 = 0;
    let mut ejected = false;
    loop {
        let result = match &mut conn {
            Some(c) => c.ping().await,
            None => match node::connect(&p.settings, &p.addr, None).await {
                Ok(c) => conn.insert(c).ping().await,
                Err(err) => Err(err),
            },
        };
        match result {
            Ok(()) => {
                failure = 0;
                if ejected {
                    p.ring.add_node(&p.ring_name, p.weight);
                    ejected = false;
                    tracing::info!(cluster = %p.cluster, addr = %p.addr, "backend re-admitted to ring");
                }
            }
            Err(err) => {
                failure += 1;
                retries = 0;
                tracing::warn!(
                    cluster = %p.cluster,
                    addr = %p.addr,
                    failures = failure,
                    error = %err,
                    "backend ping failed"
                );
                // The probe connection is suspect; dial fresh next tick.
                if let Some(mut dead) = conn.take() {
                    dead.close().await;
                }
            }
        }
        if failure >= p.fail_limit && !ejected {
            p.ring.remove_node(&p.ring_name);
            ejected = true;
            tracing::warn!(cluster = %p.cluster, addr = %p.addr, "backend ejected from ring");
        }
        tokio::time::sleep(backoff(retries)).await;
        retries += 1;
    }
}

fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_lock<'a, T>(l: &'a RwLock<T>) -> std::sync::RwLockReadGuard<'a, T> {
    match l.read() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<'a, T>(l: &'a RwLock<T>) -> std::sync::RwLockWriteGuard<'a, T> {
    match l.write() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}
