// End-to-end exercises of the daemon's broker assembly: real sockets, the
// client and subscriber libraries, and the BusHooks behavior.
use broker::config::ServiceConfig;
use broker::service::{self, KIND_PING};
use bytes::Bytes;
use crossbar_wire::BROADCAST;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn test_config(dir: &TempDir) -> ServiceConfig {
    ServiceConfig {
        name: "e2e".into(),
        runtime_dir: dir.path().to_str().expect("utf8 path").into(),
        metrics_bind: "127.0.0.1:0".parse().expect("addr"),
        recv_buffer_bytes: 4096,
        send_queue_depth: 64,
        pool_min_workers: 1,
        pool_max_workers: 2,
        pool_idle_linger_ms: 200,
    }
}

fn start(dir: &TempDir) -> (crossbar_broker::BrokerCore, std::path::PathBuf) {
    let config = test_config(dir);
    let core = service::build_core(&config);
    let (path, listener) = service::bind(&config).expect("bind");
    let serving = core.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (core, path)
}

async fn wait_routable(core: &crossbar_broker::BrokerCore, topic: u64) {
    for _ in 0..600 {
        if core
            .publish(BROADCAST, topic, 0, Bytes::new())
            .expect("publish")
            > 0
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("subscriber never synced");
}

#[tokio::test]
async fn bus_answers_ping() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_core, path) = start(&dir);
    let mut client = crossbar_client::Client::connect(&path).await.expect("connect");
    let reply = client
        .request(KIND_PING, Bytes::new(), Duration::from_secs(2))
        .await
        .expect("pong");
    assert_eq!(reply.payload, Bytes::from_static(b"pong"));
}

#[tokio::test]
async fn unknown_requests_still_get_an_ack() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_core, path) = start(&dir);
    let mut client = crossbar_client::Client::connect(&path).await.expect("connect");
    let reply = client
        .request(0x77, Bytes::from_static(b"anyone?"), Duration::from_secs(2))
        .await
        .expect("ack");
    assert_eq!(reply.kind, 0x77);
    assert!(reply.payload.is_empty());
}

#[tokio::test]
async fn publish_flows_from_client_to_subscriber() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (core, path) = start(&dir);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = crossbar_subscriber::register(&path, 1 << 6, Bytes::new(), move |n| {
        let _ = tx.send(n);
    })
    .await
    .expect("register");
    wait_routable(&core, 1 << 6).await;

    let mut client = crossbar_client::Client::connect(&path).await.expect("connect");
    client
        .publish(BROADCAST, 1 << 6, 3, Bytes::from_static(b"to everyone"))
        .await
        .expect("publish ack");

    let seen = loop {
        let n = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("notification in time")
            .expect("channel open");
        // Skip sync warmup events.
        if n.kind != 0 {
            break n;
        }
    };
    assert_eq!(seen.topic, 1 << 6);
    assert_eq!(seen.kind, 3);
    assert_eq!(seen.payload, Bytes::from_static(b"to everyone"));
    assert_eq!(seen.sender, client.identity());
    sub.unregister().await.expect("unregister");
}

#[tokio::test]
async fn unicast_skips_other_subscribers() {
    // Both subscriptions share one process identity, so target it and make
    // sure an impostor identity receives nothing.
    let dir = tempfile::tempdir().expect("tempdir");
    let (core, path) = start(&dir);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = crossbar_subscriber::register(&path, 1 << 1, Bytes::new(), move |n| {
        let _ = tx.send(n);
    })
    .await
    .expect("register");
    wait_routable(&core, 1 << 1).await;

    // Target an identity nobody has: queued for zero peers.
    assert_eq!(
        core.publish(-2, 1 << 1, 5, Bytes::new()).expect("publish"),
        0
    );
    // Target the subscriber's real identity: queued for exactly one.
    let me = crossbar_common::identity::current();
    assert_eq!(
        core.publish(me, 1 << 1, 5, Bytes::new()).expect("publish"),
        1
    );
    let seen = loop {
        let n = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("notification in time")
            .expect("channel open");
        if n.kind != 0 {
            break n;
        }
    };
    assert_eq!(seen.kind, 5);
}

#[tokio::test]
async fn shutdown_releases_connected_peers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (core, path) = start(&dir);
    let mut client = crossbar_client::Client::connect(&path).await.expect("connect");
    client
        .request(KIND_PING, Bytes::new(), Duration::from_secs(2))
        .await
        .expect("pong");

    core.shutdown();
    // The stream is gone and the drained broker admits nobody new, so the
    // one repair attempt fails too.
    let err = client
        .request(KIND_PING, Bytes::new(), Duration::from_millis(500))
        .await
        .expect_err("broker is down");
    assert!(matches!(
        err,
        crossbar_client::ClientError::Transport(_) | crossbar_client::ClientError::HandshakeRefused
    ));
}
