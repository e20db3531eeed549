//! Shared helpers for integration tests: in-process proxies, scripted
//! backends, and raw protocol clients.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crossbar::bufio::{RecvBuffer, SendBuffer};
use crossbar::config::{CacheType, ClusterConfig, ListenProto};
use crossbar::executor::Executor;
use crossbar::resp::{self, RespValue};
use crossbar::server;

/// Timeout for every test round-trip.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

pub fn cluster_config(cache_type: CacheType, servers: Vec<String>) -> ClusterConfig {
    ClusterConfig {
        name: "test-pool".into(),
        hash_method: Default::default(),
        hash_distribution: Default::default(),
        hash_tag: String::new(),
        cache_type,
        listen_proto: ListenProto::Tcp,
        listen_addr: "127.0.0.1:0".into(),
        redis_auth: String::new(),
        dial_timeout: 1000,
        read_timeout: 2000,
        write_timeout: 1000,
        node_connections: 1,
        ping_fail_limit: 3,
        ping_auto_eject: false,
        servers,
    }
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub executor: Arc<Executor>,
}

/// Start an executor plus a TCP listener for it on an ephemeral port.
pub async fn start_proxy(cfg: ClusterConfig) -> TestProxy {
    let cache_type = cfg.cache_type;
    let executor = Executor::start(Arc::new(cfg)).expect("executor start");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("proxy bind");
    let addr = listener.local_addr().unwrap();
    let serve_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        let _ = server::serve_tcp(listener, cache_type, serve_executor).await;
    });
    TestProxy { addr, executor }
}

/// Scripted memcache text backend.
///
/// Serves `get`/`gets` out of a fixed map where every value is suffixed
/// with nothing (the value is returned verbatim), answers `set` with
/// STORED (recording the value), and `version` with a VERSION line while
/// `healthy` holds true.
pub struct MemcacheBackend {
    pub addr: SocketAddr,
    pub healthy: Arc<AtomicBool>,
    pub data: Arc<Mutex<HashMap<String, String>>>,
}

pub async fn start_memcache_backend(
    data: HashMap<String, String>,
    reply_delay: Duration,
) -> MemcacheBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("backend bind");
    let addr = listener.local_addr().unwrap();
    let healthy = Arc::new(AtomicBool::new(true));
    let data = Arc::new(Mutex::new(data));
    let accept_healthy = Arc::clone(&healthy);
    let accept_data = Arc::clone(&data);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let healthy = Arc::clone(&accept_healthy);
            let data = Arc::clone(&accept_data);
            tokio::spawn(async move {
                let _ = memcache_conn(stream, healthy, data, reply_delay).await;
            });
        }
    });
    MemcacheBackend {
        addr,
        healthy,
        data,
    }
}

async fn memcache_conn(
    mut stream: TcpStream,
    healthy: Arc<AtomicBool>,
    data: Arc<Mutex<HashMap<String, String>>>,
    reply_delay: Duration,
) -> std::io::Result<()> {
    let mut rbuf = RecvBuffer::new();
    let mut wbuf = SendBuffer::new();
    loop {
        let line = loop {
            match rbuf.find_line(0) {
                Ok(Some(end)) => break rbuf.take(end),
                Ok(None) => {
                    if rbuf.fill(&mut stream).await.map_err(io_err)? == 0 {
                        return Ok(());
                    }
                }
                Err(_) => return Ok(()),
            }
        };
        let text = String::from_utf8_lossy(&line[..line.len() - 2]).to_string();
        let mut parts = text.split_ascii_whitespace();
        let verb = parts.next().unwrap_or_default().to_string();
        match verb.as_str() {
            "get" | "gets" => {
                for key in parts {
                    let value = data.lock().unwrap().get(key).cloned();
                    if let Some(value) = value {
                        wbuf.put(format!("VALUE {key} 0 {}\r\n{value}\r\n", value.len()).as_bytes());
                    }
                }
                wbuf.put(b"END\r\n");
            }
            "set" => {
                let key = parts.next().unwrap_or_default().to_string();
                let len: usize = parts.nth(2).and_then(|t| t.parse().ok()).unwrap_or(0);
                let body = read_exact_buffered(&mut rbuf, &mut stream, len + 2).await?;
                let value = String::from_utf8_lossy(&body[..len]).to_string();
                data.lock().unwrap().insert(key, value);
                wbuf.put(b"STORED\r\n");
            }
            "version" => {
                if healthy.load(Ordering::Acquire) {
                    wbuf.put(b"VERSION 1.6.21\r\n");
                } else {
                    wbuf.put(b"ERROR\r\n");
                }
            }
            _ => wbuf.put(b"ERROR\r\n"),
        }
        if !reply_delay.is_zero() {
            tokio::time::sleep(reply_delay).await;
        }
        wbuf.flush(&mut stream).await.map_err(io_err)?;
    }
}

async fn read_exact_buffered(
    rbuf: &mut RecvBuffer,
    stream: &mut TcpStream,
    n: usize,
) -> std::io::Result<Bytes> {
    loop {
        if rbuf.len() >= n {
            return Ok(rbuf.take(n));
        }
        if rbuf.fill(stream).await.map_err(io_err)? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend peer closed",
            ));
        }
    }
}

fn io_err(err: crossbar::error::ProxyError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
}

/// Scripted redis backend: every decoded command is passed to the handler,
/// and its reply is written back. The verb log records command names in
/// arrival order, across all connections.
pub struct RedisBackend {
    pub addr: SocketAddr,
    pub verbs: Arc<Mutex<Vec<String>>>,
}

pub async fn start_redis_backend<H>(handler: H) -> RedisBackend
where
    H: Fn(&[Bytes]) -> RespValue + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("backend bind");
    let addr = listener.local_addr().unwrap();
    let verbs = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(handler);
    let accept_verbs = Arc::clone(&verbs);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let handler = Arc::clone(&handler);
            let verbs = Arc::clone(&accept_verbs);
            tokio::spawn(async move {
                let _ = redis_conn(stream, handler, verbs).await;
            });
        }
    });
    RedisBackend { addr, verbs }
}

async fn redis_conn(
    mut stream: TcpStream,
    handler: Arc<dyn Fn(&[Bytes]) -> RespValue + Send + Sync>,
    verbs: Arc<Mutex<Vec<String>>>,
) -> Result<(), crossbar::error::ProxyError> {
    let mut rbuf = RecvBuffer::new();
    let mut wbuf = SendBuffer::new();
    loop {
        let value = loop {
            if let Some(value) = resp::decode_value(&mut rbuf)? {
                break value;
            }
            if rbuf.fill(&mut stream).await? == 0 {
                return Ok(());
            }
        };
        let RespValue::Array(items) = value else {
            continue;
        };
        let args: Vec<Bytes> = items
            .into_iter()
            .filter_map(|item| match item {
                RespValue::Bulk(data) => Some(data),
                _ => None,
            })
            .collect();
        if args.is_empty() {
            continue;
        }
        verbs
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&args[0].to_ascii_uppercase()).to_string());
        let reply = handler(&args);
        resp::encode_value(&reply, &mut wbuf);
        wbuf.flush(&mut stream).await?;
    }
}

/// A `CLUSTER NODES` payload that assigns every slot to `master`, with
/// `replica` attached as its slave.
pub fn cluster_nodes_payload(master: SocketAddr, replica: SocketAddr) -> String {
    format!(
        "0000000000000000000000000000000000000001 {master}@17000 myself,master - 0 0 1 connected 0-16383\n\
         0000000000000000000000000000000000000002 {replica}@17001 slave 0000000000000000000000000000000000000001 0 0 1 connected\n"
    )
}

/// Raw client: write bytes, then read an exact number of reply bytes.
pub struct TestClient {
    pub stream: TcpStream,
    rbuf: RecvBuffer,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> TestClient {
        let stream = timeout(IO_TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("connect timeout")
            .expect("connect");
        stream.set_nodelay(true).ok();
        TestClient {
            stream,
            rbuf: RecvBuffer::new(),
        }
    }

    /// Read one RESP reply. Do not mix with the byte-exact helpers below
    /// on the same connection.
    pub async fn read_value(&mut self) -> RespValue {
        loop {
            if let Some(value) = resp::decode_value(&mut self.rbuf).expect("resp decode") {
                return value;
            }
            let n = timeout(IO_TIMEOUT, self.rbuf.fill(&mut self.stream))
                .await
                .expect("read timeout")
                .expect("read");
            assert!(n > 0, "proxy closed while awaiting a reply");
        }
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        timeout(IO_TIMEOUT, self.stream.write_all(bytes))
            .await
            .expect("write timeout")
            .expect("write");
    }

    pub async fn expect(&mut self, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        timeout(IO_TIMEOUT, self.stream.read_exact(&mut buf))
            .await
            .expect("read timeout")
            .expect("read");
        assert_eq!(
            String::from_utf8_lossy(&buf),
            String::from_utf8_lossy(expected)
        );
    }

    pub async fn round_trip(&mut self, request: &[u8], expected: &[u8]) {
        self.send(request).await;
        self.expect(expected).await;
    }

    /// Read until EOF; asserts the connection closes.
    pub async fn expect_close(&mut self) {
        let mut rest = Vec::new();
        timeout(IO_TIMEOUT, self.stream.read_to_end(&mut rest))
            .await
            .expect("close timeout")
            .expect("close");
    }
}
