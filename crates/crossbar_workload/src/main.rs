//! Workload generator for exercising a crossbar proxy.
//!
//! Issues a GET/SET mix over a set of hot keys from N concurrent client
//! connections, speaking either RESP or memcache text, and prints a
//! throughput/error summary at the end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crossbar::bufio::{RecvBuffer, SendBuffer};
use crossbar::resp::{self, RespValue};

#[derive(Parser, Debug)]
#[command(name = "crossbar-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Protocol {
    Redis,
    Memcache,
}

#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Proxy endpoint, e.g. `127.0.0.1:26379`.
    #[arg(long)]
    addr: String,

    /// Wire protocol to speak.
    #[arg(long, value_enum, default_value_t = Protocol::Redis)]
    protocol: Protocol,

    /// Number of concurrent clients (one TCP connection each).
    #[arg(long, default_value_t = 10)]
    clients: usize,

    /// Number of hot keys.
    #[arg(long, default_value_t = 16)]
    keys: usize,

    /// Key prefix; keys are `{key_prefix}{idx}`.
    #[arg(long, default_value = "bar_")]
    key_prefix: String,

    /// Percent of operations that are SET (rest are GET).
    #[arg(long, default_value_t = 50)]
    set_pct: u8,

    /// Total runtime.
    #[arg(long, default_value = "30s")]
    duration: humantime::Duration,

    /// Per-operation timeout.
    #[arg(long, default_value = "5s")]
    op_timeout: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Default)]
struct Counters {
    ops: AtomicU64,
    errors: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Args {
        cmd: Command::Run(args),
    } = Args::parse();

    let seed = if args.seed == 0 {
        rand::random()
    } else {
        args.seed
    };
    let counters = Arc::new(Counters::default());
    let deadline = Instant::now() + *args.duration;

    let mut tasks = Vec::new();
    for client in 0..args.clients {
        let args = args.clone();
        let counters = Arc::clone(&counters);
        tasks.push(tokio::spawn(async move {
            let rng = SmallRng::seed_from_u64(seed.wrapping_add(client as u64));
            if let Err(err) = run_client(&args, rng, &counters, deadline).await {
                eprintln!("client {client}: {err:#}");
            }
        }));
    }
    for task in tasks {
        let _ = task.await;
    }

    let elapsed = args.duration.as_secs_f64();
    let ops = counters.ops.load(Ordering::Relaxed);
    let errors = counters.errors.load(Ordering::Relaxed);
    println!(
        "ops={ops} errors={errors} qps={:.0} seed={seed}",
        ops as f64 / elapsed
    );
    Ok(())
}

async fn run_client(
    args: &RunArgs,
    mut rng: SmallRng,
    counters: &Counters,
    deadline: Instant,
) -> anyhow::Result<()> {
    let stream = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("connect {}", args.addr))?;
    stream.set_nodelay(true).ok();
    let mut conn = Conn {
        stream,
        rbuf: RecvBuffer::new(),
        wbuf: SendBuffer::new(),
    };

    while Instant::now() < deadline {
        let key = format!("{}{}", args.key_prefix, rng.gen_range(0..args.keys.max(1)));
        let is_set = rng.gen_range(0..100u8) < args.set_pct;
        let op = async {
            match (args.protocol, is_set) {
                (Protocol::Redis, true) => {
                    let value = format!("v{}", rng.gen::<u32>());
                    conn.redis_round_trip(resp::RedisRequest::from_parts(
                        b"SET",
                        &[key.as_bytes(), value.as_bytes()],
                    ))
                    .await
                }
                (Protocol::Redis, false) => {
                    conn.redis_round_trip(resp::RedisRequest::from_parts(b"GET", &[key.as_bytes()]))
                        .await
                }
                (Protocol::Memcache, true) => {
                    let value = format!("v{}", rng.gen::<u32>());
                    conn.memcache_set(&key, value.as_bytes()).await
                }
                (Protocol::Memcache, false) => conn.memcache_get(&key).await,
            }
        };
        counters.ops.fetch_add(1, Ordering::Relaxed);
        match timeout(*args.op_timeout, op).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
            Err(_) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                anyhow::bail!("operation timed out");
            }
        }
    }
    Ok(())
}

struct Conn {
    stream: TcpStream,
    rbuf: RecvBuffer,
    wbuf: SendBuffer,
}

impl Conn {
    async fn redis_round_trip(&mut self, req: resp::RedisRequest) -> anyhow::Result<()> {
        req.encode_into(&mut self.wbuf);
        self.wbuf.flush(&mut self.stream).await?;
        let reply = loop {
            if let Some(value) = resp::decode_value(&mut self.rbuf)? {
                break value;
            }
            if self.rbuf.fill(&mut self.stream).await? == 0 {
                anyhow::bail!("proxy closed the connection");
            }
        };
        if let RespValue::Error(e) = reply {
            anyhow::bail!("error reply: {}", String::from_utf8_lossy(&e));
        }
        Ok(())
    }

    async fn memcache_set(&mut self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.wbuf
            .put(format!("set {key} 0 0 {}\r\n", value.len()).as_bytes());
        self.wbuf.put(value);
        self.wbuf.put(b"\r\n");
        self.wbuf.flush(&mut self.stream).await?;
        let line = self.read_line().await?;
        if line.as_ref() != b"STORED\r\n" {
            anyhow::bail!("unexpected set reply: {:?}", String::from_utf8_lossy(&line));
        }
        Ok(())
    }

    async fn memcache_get(&mut self, key: &str) -> anyhow::Result<()> {
        self.wbuf.put(format!("get {key}\r\n").as_bytes());
        self.wbuf.flush(&mut self.stream).await?;
        // VALUE blocks until the terminating END (or an error line).
        loop {
            let line = self.read_line().await?;
            if let Some(rest) = line.strip_prefix(b"VALUE ".as_slice()) {
                let header = std::str::from_utf8(&rest[..rest.len() - 2])?;
                let len: usize = header
                    .split_whitespace()
                    .nth(2)
                    .context("short VALUE header")?
                    .parse()?;
                self.read_exact(len + 2).await?;
                continue;
            }
            if line.as_ref() == b"END\r\n" {
                return Ok(());
            }
            anyhow::bail!("unexpected get reply: {:?}", String::from_utf8_lossy(&line));
        }
    }

    async fn read_exact(&mut self, n: usize) -> anyhow::Result<bytes::Bytes> {
        loop {
            if self.rbuf.len() >= n {
                return Ok(self.rbuf.take(n));
            }
            if self.rbuf.fill(&mut self.stream).await? == 0 {
                anyhow::bail!("proxy closed the connection");
            }
        }
    }

    async fn read_line(&mut self) -> anyhow::Result<bytes::Bytes> {
        loop {
            if let Some(end) = self.rbuf.find_line(0)? {
                return Ok(self.rbuf.take(end));
            }
            if self.rbuf.fill(&mut self.stream).await? == 0 {
                anyhow::bail!("proxy closed the connection");
            }
        }
    }
}
