//! Backend node connections: one persistent socket per worker, batched
//! writes, pipelined reads, ping probes, and Redis Cluster redirection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::bufio::{RecvBuffer, SendBuffer};
use crate::cluster::ClusterTopology;
use crate::config::CacheType;
use crate::error::ProxyError;
use crate::memcache;
use crate::memcache_bin;
use crate::message::{MsgBatch, Reply, Request};
use crate::resp::{self, RespValue};

/// Connection parameters shared by every backend socket of a cluster.
#[derive(Debug, Clone)]
pub struct ConnSettings {
    pub cluster: String,
    pub cache_type: CacheType,
    pub dial_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub auth: Option<String>,
}

/// One backend connection.
///
/// Writes are serialized, reads are serialized, and every batch write is
/// followed by exactly one batch read that consumes `count()` replies in
/// order.
#[async_trait]
pub trait NodeConn: Send {
    /// Encode every message of the batch and flush once.
    async fn write_batch(&mut self, mb: &mut MsgBatch) -> Result<(), ProxyError>;

    /// Decode exactly `mb.count()` replies, assigning the i-th reply to the
    /// i-th message.
    async fn read_batch(&mut self, mb: &mut MsgBatch) -> Result<(), ProxyError>;

    /// Protocol-appropriate liveness probe.
    async fn ping(&mut self) -> Result<(), ProxyError>;

    /// Idempotent close.
    async fn close(&mut self);
}

/// Dial a backend with the cluster's protocol.
pub async fn connect(
    settings: &ConnSettings,
    addr: &str,
    topology: Option<Arc<ClusterTopology>>,
) -> Result<Box<dyn NodeConn>, ProxyError> {
    match settings.cache_type {
        CacheType::Memcache => Ok(Box::new(McTextNodeConn {
            io: BackendStream::connect(settings, addr).await?,
        })),
        CacheType::MemcacheBinary => Ok(Box::new(McBinNodeConn {
            io: BackendStream::connect(settings, addr).await?,
        })),
        CacheType::Redis => Ok(Box::new(RedisNodeConn::connect(settings, addr).await?)),
        CacheType::RedisCluster => {
            let topology = topology.ok_or_else(|| {
                ProxyError::Config("redis_cluster connection without a topology".into())
            })?;
            Ok(Box::new(ClusterNodeConn {
                inner: RedisNodeConn::connect(settings, addr).await?,
                settings: settings.clone(),
                topology,
                redirects: HashMap::new(),
            }))
        }
    }
}

/// Socket plus its buffers and deadlines.
struct BackendStream {
    stream: TcpStream,
    rbuf: RecvBuffer,
    wbuf: SendBuffer,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    open: bool,
}

impl BackendStream {
    async fn connect(settings: &ConnSettings, addr: &str) -> Result<BackendStream, ProxyError> {
        let stream = deadline(settings.dial_timeout, "dial", TcpStream::connect(addr)).await??;
        stream.set_nodelay(true)?;
        Ok(BackendStream {
            stream,
            rbuf: RecvBuffer::new(),
            wbuf: SendBuffer::new(),
            read_timeout: settings.read_timeout,
            write_timeout: settings.write_timeout,
            open: true,
        })
    }

    async fn flush(&mut self) -> Result<(), ProxyError> {
        deadline(
            self.write_timeout,
            "write",
            self.wbuf.flush(&mut self.stream),
        )
        .await?
    }

    /// Read more reply bytes; a clean close mid-batch is an error.
    async fn fill(&mut self) -> Result<(), ProxyError> {
        let n = deadline(self.read_timeout, "read", self.rbuf.fill(&mut self.stream)).await??;
        if n == 0 {
            return Err(ProxyError::ConnectionClosed);
        }
        Ok(())
    }

    async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let _ = self.stream.shutdown().await;
    }
}

async fn deadline<T>(
    limit: Option<Duration>,
    what: &str,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, ProxyError> {
    match limit {
        None => Ok(fut.await),
        Some(d) => timeout(d, fut).await.map_err(|_| {
            ProxyError::Backend(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{what} timed out after {d:?}"),
            ))
        }),
    }
}

/// Plain Redis backend connection.
pub struct RedisNodeConn {
    io: BackendStream,
}

impl RedisNodeConn {
    pub async fn connect(settings: &ConnSettings, addr: &str) -> Result<RedisNodeConn, ProxyError> {
        let mut conn = RedisNodeConn {
            io: BackendStream::connect(settings, addr).await?,
        };
        if let Some(password) = settings.auth.as_deref() {
            if !password.is_empty() {
                resp::RedisRequest::from_parts(b"AUTH", &[password.as_bytes()])
                    .encode_into(&mut conn.io.wbuf);
                conn.io.flush().await?;
                if let RespValue::Error(e) = conn.read_value().await? {
                    return Err(ProxyError::Protocol(format!(
                        "backend auth rejected: {}",
                        String::from_utf8_lossy(&e)
                    )));
                }
            }
        }
        Ok(conn)
    }

    fn encode(&mut self, req: &resp::RedisRequest) {
        req.encode_into(&mut self.io.wbuf);
    }

    async fn flush(&mut self) -> Result<(), ProxyError> {
        self.io.flush().await
    }

    async fn read_value(&mut self) -> Result<RespValue, ProxyError> {
        loop {
            if let Some(value) = resp::decode_value(&mut self.io.rbuf)? {
                return Ok(value);
            }
            self.io.fill().await?;
        }
    }
}

#[async_trait]
impl NodeConn for RedisNodeConn {
    async fn write_batch(&mut self, mb: &mut MsgBatch) -> Result<(), ProxyError> {
        for msg in mb.msgs_mut() {
            let Request::Redis(req) = msg.request() else {
                msg.fail(Arc::new(ProxyError::Protocol("non-redis message on redis backend".into())));
                return Err(ProxyError::Protocol("non-redis message on redis backend".into()));
            };
            req.encode_into(&mut self.io.wbuf);
            msg.mark_write();
        }
        self.io.flush().await
    }

    async fn read_batch(&mut self, mb: &mut MsgBatch) -> Result<(), ProxyError> {
        for i in 0..mb.count() {
            let value = self.read_value().await?;
            mb.msgs_mut()[i].set_reply(Reply::Redis(value));
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), ProxyError> {
        resp::RedisRequest::from_parts(b"PING", &[]).encode_into(&mut self.io.wbuf);
        self.io.flush().await?;
        match self.read_value().await? {
            RespValue::Simple(s) if s.eq_ignore_ascii_case(b"PONG") => Ok(()),
            RespValue::Bulk(s) if s.eq_ignore_ascii_case(b"PONG") => Ok(()),
            other => Err(ProxyError::Protocol(format!(
                "unexpected ping reply: {other:?}"
            ))),
        }
    }

    async fn close(&mut self) {
        self.io.close().await;
    }
}

/// Redis Cluster connection: a plain connection plus MOVED/ASK handling.
///
/// Redirection is single-hop: the redirected reply is final even if it is
/// itself MOVED or ASK.
pub struct ClusterNodeConn {
    inner: RedisNodeConn,
    settings: ConnSettings,
    topology: Arc<ClusterTopology>,
    /// Connections to redirect targets, reused across batches. Bounded by
    /// cluster size.
    redirects: HashMap<String, RedisNodeConn>,
}

impl ClusterNodeConn {
    async fn redirect_one(
        &mut self,
        redirect: &resp::Redirect,
        req: &resp::RedisRequest,
    ) -> Result<RespValue, ProxyError> {
        if !self.redirects.contains_key(&redirect.addr) {
            let conn = RedisNodeConn::connect(&self.settings, &redirect.addr).await?;
            self.redirects.insert(redirect.addr.clone(), conn);
        }
        let conn = self
            .redirects
            .get_mut(&redirect.addr)
            .ok_or_else(|| ProxyError::Redirection("redirect connection vanished".into()))?;
        if redirect.ask {
            conn.encode(&resp::asking_request());
        }
        conn.encode(req);
        conn.flush().await?;
        if redirect.ask {
            // The ASKING acknowledgment itself; the command reply follows.
            let _ = conn.read_value().await?;
        }
        conn.read_value().await
    }
}

#[async_trait]
impl NodeConn for ClusterNodeConn {
    async fn write_batch(&mut self, mb: &mut MsgBatch) -> Result<(), ProxyError> {
        self.inner.write_batch(mb).await
    }

    async fn read_batch(&mut self, mb: &mut MsgBatch) -> Result<(), ProxyError> {
        self.inner.read_batch(mb).await?;
        for msg in mb.msgs_mut() {
            let redirect = match msg.reply() {
                Some(Reply::Redis(value)) => resp::parse_redirect(value),
                _ => None,
            };
            let Some(redirect) = redirect else {
                continue;
            };
            tracing::debug!(
                addr = %redirect.addr,
                slot = redirect.slot,
                ask = redirect.ask,
                "following redirection"
            );
            self.topology.add_seed(&redirect.addr);
            let Request::Redis(req) = msg.request() else {
                continue;
            };
            let value = self
                .redirect_one(&redirect, req)
                .await
                .map_err(|e| ProxyError::Redirection(e.to_string()))?;
            msg.set_reply(Reply::Redis(value));
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), ProxyError> {
        self.inner.ping().await
    }

    async fn close(&mut self) {
        self.inner.close().await;
        for conn in self.redirects.values_mut() {
            conn.close().await;
        }
    }
}

/// Memcache text backend connection.
struct McTextNodeConn {
    io: BackendStream,
}

#[async_trait]
impl NodeConn for McTextNodeConn {
    async fn write_batch(&mut self, mb: &mut MsgBatch) -> Result<(), ProxyError> {
        for msg in mb.msgs_mut() {
            let Request::McText(req) = msg.request() else {
                msg.fail(Arc::new(ProxyError::Protocol("non-memcache message on memcache backend".into())));
                return Err(ProxyError::Protocol("non-memcache message on memcache backend".into()));
            };
            req.encode_into(&mut self.io.wbuf);
            msg.mark_write();
        }
        self.io.flush().await
    }

    async fn read_batch(&mut self, mb: &mut MsgBatch) -> Result<(), ProxyError> {
        for i in 0..mb.count() {
            let raw = loop {
                let decoded = {
                    let Request::McText(req) = mb.msgs()[i].request() else {
                        return Err(ProxyError::Protocol(
                            "non-memcache message on memcache backend".into(),
                        ));
                    };
                    memcache::decode_reply(req, &mut self.io.rbuf)?
                };
                match decoded {
                    Some(raw) => break raw,
                    None => self.io.fill().await?,
                }
            };
            mb.msgs_mut()[i].set_reply(Reply::McText(raw));
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), ProxyError> {
        self.io.wbuf.put(b"version\r\n");
        self.io.flush().await?;
        loop {
            if let Some(end) = self.io.rbuf.find_line(0)? {
                let line = self.io.rbuf.take(end);
                if line.starts_with(b"VERSION") {
                    return Ok(());
                }
                return Err(ProxyError::Protocol(format!(
                    "unexpected ping reply: {:?}",
                    String::from_utf8_lossy(&line)
                )));
            }
            self.io.fill().await?;
        }
    }

    async fn close(&mut self) {
        self.io.close().await;
    }
}

/// Memcache binary backend connection.
struct McBinNodeConn {
    io: BackendStream,
}

#[async_trait]
impl NodeConn for McBinNodeConn {
    async fn write_batch(&mut self, mb: &mut MsgBatch) -> Result<(), ProxyError> {
        for msg in mb.msgs_mut() {
            let Request::McBin(req) = msg.request() else {
                msg.fail(Arc::new(ProxyError::Protocol("non-binary message on binary backend".into())));
                return Err(ProxyError::Protocol("non-binary message on binary backend".into()));
            };
            req.encode_into(&mut self.io.wbuf);
            msg.mark_write();
        }
        self.io.flush().await
    }

    async fn read_batch(&mut self, mb: &mut MsgBatch) -> Result<(), ProxyError> {
        for i in 0..mb.count() {
            let raw = loop {
                match memcache_bin::decode_reply(&mut self.io.rbuf)? {
                    Some(raw) => break raw,
                    None => self.io.fill().await?,
                }
            };
            mb.msgs_mut()[i].set_reply(Reply::McBin(raw));
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), ProxyError> {
        self.io.wbuf.put(&memcache_bin::noop_packet());
        self.io.flush().await?;
        let raw = loop {
            match memcache_bin::decode_reply(&mut self.io.rbuf)? {
                Some(raw) => break raw,
                None => self.io.fill().await?,
            }
        };
        match memcache_bin::reply_status(&raw) {
            Some((memcache_bin::OP_NOOP, 0)) => Ok(()),
            other => Err(ProxyError::Protocol(format!(
                "unexpected noop reply status: {other:?}"
            ))),
        }
    }

    async fn close(&mut self) {
        self.io.close().await;
    }
}
