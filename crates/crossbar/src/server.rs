//! Cluster front end: the listener and the per-client session loop.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};

use crate::bufio::{RecvBuffer, SendBuffer};
use crate::config::{CacheType, ClusterConfig, ListenProto};
use crate::error::ProxyError;
use crate::executor::Executor;
use crate::memcache;
use crate::memcache_bin;
use crate::message::{Message, Request, Slot};
use crate::resp;

/// Upper bound on requests dispatched from one client in a single window.
/// Decoding stops at this bound or when the read buffer drains, whichever
/// comes first.
const PIPELINE_WINDOW: usize = 64;

/// Bind the cluster's listener and serve sessions until the task is
/// cancelled.
pub async fn run(cfg: Arc<ClusterConfig>, executor: Arc<Executor>) -> Result<(), ProxyError> {
    match cfg.listen_proto {
        ListenProto::Tcp => {
            let listener = TcpListener::bind(&cfg.listen_addr).await?;
            tracing::info!(cluster = %cfg.name, addr = %cfg.listen_addr, "proxy listening");
            serve_tcp(listener, cfg.cache_type, executor).await
        }
        ListenProto::Unix => {
            let listener = UnixListener::bind(&cfg.listen_addr)?;
            tracing::info!(cluster = %cfg.name, path = %cfg.listen_addr, "proxy listening");
            loop {
                let (socket, _) = listener.accept().await?;
                spawn_session(cfg.cache_type, socket, Arc::clone(&executor), None);
            }
        }
    }
}

/// Accept loop over an already-bound TCP listener.
pub async fn serve_tcp(
    listener: TcpListener,
    cache_type: CacheType,
    executor: Arc<Executor>,
) -> Result<(), ProxyError> {
    loop {
        let (socket, peer) = listener.accept().await?;
        socket.set_nodelay(true).ok();
        spawn_session(cache_type, socket, Arc::clone(&executor), Some(peer.to_string()));
    }
}

fn spawn_session<S>(cache_type: CacheType, socket: S, executor: Arc<Executor>, peer: Option<String>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let peer = peer.unwrap_or_else(|| "unix".to_owned());
        match handle_conn(cache_type, socket, executor).await {
            Ok(()) => tracing::debug!(peer = %peer, "client session closed"),
            Err(err) => tracing::debug!(peer = %peer, error = %err, "client session ended"),
        }
    });
}

fn decode_one(cache_type: CacheType, rbuf: &mut RecvBuffer) -> Result<Option<Message>, ProxyError> {
    match cache_type {
        CacheType::Memcache => memcache::decode_request(rbuf),
        CacheType::MemcacheBinary => memcache_bin::decode_request(rbuf),
        CacheType::Redis | CacheType::RedisCluster => resp::decode_request(rbuf),
    }
}

/// One client session: decode a pipeline window, dispatch it, await every
/// completion, then write replies in the exact submission order and flush
/// once. The next window is not read until this one is fully flushed.
async fn handle_conn<S>(
    cache_type: CacheType,
    mut socket: S,
    executor: Arc<Executor>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut rbuf = RecvBuffer::new();
    let mut wbuf = SendBuffer::new();
    loop {
        let mut window: Vec<Message> = Vec::new();
        let mut quit: Option<Message> = None;
        while window.len() < PIPELINE_WINDOW && quit.is_none() {
            match decode_one(cache_type, &mut rbuf)? {
                Some(msg) => {
                    if msg.request().is_quit() {
                        quit = Some(msg);
                    } else {
                        window.push(msg);
                    }
                }
                None => {
                    if !window.is_empty() {
                        break;
                    }
                    let n = rbuf.fill(&mut socket).await?;
                    if n == 0 {
                        if rbuf.is_empty() {
                            return Ok(());
                        }
                        return Err(ProxyError::Protocol(
                            "client closed inside a request".into(),
                        ));
                    }
                }
            }
        }

        if !window.is_empty() {
            match executor.execute(window).await {
                Ok(dispatch) => {
                    for slot in &dispatch.settle().await {
                        write_slot(cache_type, slot, &mut wbuf);
                    }
                }
                Err(abort) => {
                    tracing::debug!(cluster = %executor.name(), error = %abort.err, "window aborted");
                    for slot in &abort.slots {
                        write_aborted_slot(cache_type, slot, &abort.err, &mut wbuf);
                    }
                }
            }
        }

        if let Some(q) = quit {
            write_quit_reply(cache_type, &q, &mut wbuf);
            wbuf.flush(&mut socket).await?;
            return Ok(());
        }
        wbuf.flush(&mut socket).await?;
    }
}

/// Encode one settled slot. Slot order is the client's submission order;
/// batch completion order never leaks through here.
fn write_slot(cache_type: CacheType, slot: &Slot, out: &mut SendBuffer) {
    if !slot.subs.is_empty() {
        let Some(parent) = slot.parent.as_ref() else {
            return write_plain_error(cache_type, &ProxyError::NoRoute, out);
        };
        if let Some(err) = parent.error() {
            return write_plain_error(cache_type, err, out);
        }
        match (cache_type, parent.request()) {
            (CacheType::Redis | CacheType::RedisCluster, Request::Redis(req)) => {
                let merged = resp::merge_reply(req, &slot.subs);
                resp::encode_value(&merged, out);
            }
            (CacheType::Memcache, _) => memcache::write_merged_retrieval(&slot.subs, out),
            _ => write_plain_error(
                cache_type,
                &ProxyError::Protocol("unmergeable composite reply".into()),
                out,
            ),
        }
        return;
    }
    match slot.parent.as_ref() {
        Some(msg) => write_message(cache_type, msg, out),
        None => write_plain_error(
            cache_type,
            &ProxyError::Protocol("backend worker unavailable".into()),
            out,
        ),
    }
}

/// Encode a slot from an aborted window: the message's own error when it
/// has one, the window error otherwise.
fn write_aborted_slot(
    cache_type: CacheType,
    slot: &Slot,
    window_err: &ProxyError,
    out: &mut SendBuffer,
) {
    match slot.parent.as_ref() {
        Some(msg) if msg.error().is_some() => write_message(cache_type, msg, out),
        _ => write_plain_error(cache_type, window_err, out),
    }
}

fn write_message(cache_type: CacheType, msg: &Message, out: &mut SendBuffer) {
    match cache_type {
        CacheType::Memcache => memcache::write_reply(msg, out),
        CacheType::MemcacheBinary => memcache_bin::write_reply(msg, out),
        CacheType::Redis | CacheType::RedisCluster => resp::write_reply(msg, out),
    }
}

fn write_plain_error(cache_type: CacheType, err: &(impl std::fmt::Display + ?Sized), out: &mut SendBuffer) {
    match cache_type {
        CacheType::Memcache => memcache::write_error(err, out),
        CacheType::MemcacheBinary => memcache_bin::write_error(0, 0, &err.to_string(), out),
        CacheType::Redis | CacheType::RedisCluster => resp::write_error(err, out),
    }
}

/// Answer a client's quit before closing: redis expects `+OK`, binary
/// expects a response packet, text expects silence.
fn write_quit_reply(cache_type: CacheType, msg: &Message, out: &mut SendBuffer) {
    match (cache_type, msg.request()) {
        (CacheType::Redis | CacheType::RedisCluster, _) => {
            resp::encode_value(&resp::RespValue::ok(), out);
        }
        (CacheType::MemcacheBinary, Request::McBin(req)) => {
            memcache_bin::write_quit_ack(req.opaque(), out);
        }
        _ => {}
    }
}
