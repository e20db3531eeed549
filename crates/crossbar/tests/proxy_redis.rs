//! End-to-end redis (standalone) proxying.

mod common;

use bytes::Bytes;
use common::*;
use crossbar::config::CacheType;
use crossbar::resp::RespValue;

/// Handler for a toy redis: PING, SET (always OK), GET (echoes `V:<key>`),
/// DEL/EXISTS (always 1), anything else errors.
fn toy_redis(args: &[Bytes]) -> RespValue {
    match args[0].to_ascii_uppercase().as_slice() {
        b"PING" => RespValue::Simple(Bytes::from_static(b"PONG")),
        b"SET" => RespValue::ok(),
        b"GET" => {
            let mut v = b"V:".to_vec();
            v.extend_from_slice(&args[1]);
            RespValue::Bulk(Bytes::from(v))
        }
        b"DEL" | b"EXISTS" => RespValue::Integer(1),
        b"LPUSH" => RespValue::error("WRONGTYPE Operation against a key holding the wrong kind of value"),
        _ => RespValue::error("ERR unknown command"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipelined_pings_round_trip_in_order() {
    let backend = start_redis_backend(toy_redis).await;
    let proxy = start_proxy(cluster_config(
        CacheType::Redis,
        vec![format!("{}:1", backend.addr)],
    ))
    .await;

    let mut client = TestClient::connect(proxy.addr).await;
    client
        .round_trip(
            b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n",
            b"+PONG\r\n+PONG\r\n",
        )
        .await;
    proxy.executor.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn set_and_get_round_trip() {
    let backend = start_redis_backend(toy_redis).await;
    let proxy = start_proxy(cluster_config(
        CacheType::Redis,
        vec![format!("{}:1", backend.addr)],
    ))
    .await;

    let mut client = TestClient::connect(proxy.addr).await;
    client
        .round_trip(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n", b"+OK\r\n")
        .await;
    client
        .round_trip(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n", b"$5\r\nV:foo\r\n")
        .await;
    proxy.executor.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mget_splits_and_merges_in_argument_order() {
    let b1 = start_redis_backend(toy_redis).await;
    let b2 = start_redis_backend(toy_redis).await;
    let proxy = start_proxy(cluster_config(
        CacheType::Redis,
        vec![format!("{}:1", b1.addr), format!("{}:1", b2.addr)],
    ))
    .await;

    let mut client = TestClient::connect(proxy.addr).await;
    client
        .round_trip(
            b"*4\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n",
            b"*3\r\n$3\r\nV:a\r\n$3\r\nV:b\r\n$3\r\nV:c\r\n",
        )
        .await;

    // The proxy sends single-key GETs to the backends, never MGET.
    let verbs: Vec<String> = b1
        .verbs
        .lock()
        .unwrap()
        .iter()
        .chain(b2.verbs.lock().unwrap().iter())
        .cloned()
        .collect();
    assert!(verbs.iter().filter(|v| *v == "GET").count() == 3, "{verbs:?}");
    assert!(!verbs.iter().any(|v| v == "MGET"), "{verbs:?}");
    proxy.executor.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_key_del_sums_counts() {
    let backend = start_redis_backend(toy_redis).await;
    let proxy = start_proxy(cluster_config(
        CacheType::Redis,
        vec![format!("{}:1", backend.addr)],
    ))
    .await;

    let mut client = TestClient::connect(proxy.addr).await;
    client
        .round_trip(b"*3\r\n$3\r\nDEL\r\n$1\r\na\r\n$1\r\nb\r\n", b":2\r\n")
        .await;
    proxy.executor.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backend_errors_pass_through() {
    let backend = start_redis_backend(toy_redis).await;
    let proxy = start_proxy(cluster_config(
        CacheType::Redis,
        vec![format!("{}:1", backend.addr)],
    ))
    .await;

    let mut client = TestClient::connect(proxy.addr).await;
    client
        .round_trip(
            b"*2\r\n$5\r\nLPUSH\r\n$1\r\nk\r\n",
            b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n",
        )
        .await;
    proxy.executor.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inline_commands_are_accepted() {
    let backend = start_redis_backend(toy_redis).await;
    let proxy = start_proxy(cluster_config(
        CacheType::Redis,
        vec![format!("{}:1", backend.addr)],
    ))
    .await;

    let mut client = TestClient::connect(proxy.addr).await;
    client.round_trip(b"PING\r\n", b"+PONG\r\n").await;
    proxy.executor.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quit_acknowledges_and_closes() {
    let backend = start_redis_backend(toy_redis).await;
    let proxy = start_proxy(cluster_config(
        CacheType::Redis,
        vec![format!("{}:1", backend.addr)],
    ))
    .await;

    let mut client = TestClient::connect(proxy.addr).await;
    client.round_trip(b"*1\r\n$4\r\nQUIT\r\n", b"+OK\r\n").await;
    client.expect_close().await;
    proxy.executor.close();
}
