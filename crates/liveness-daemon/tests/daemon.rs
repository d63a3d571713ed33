//! Daemon configuration and role runner tests.

use std::sync::Arc;
use std::time::Duration;

use liveness_core::{
    ConnectionDescriptor, Context, Envelope, EventKind, Frame, NodeConfig, NodeIdentity,
    NodeOptions, NodeRole, NodeSocket, RetryPolicy, SocketStatus, TransportKind, create_message,
    parse_message,
};
use liveness_daemon::WorkerPool;
use liveness_daemon::config::{DaemonConfig, Overrides};
use liveness_daemon::node::{self, Handler};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ==================== Configuration ====================

#[test]
fn test_full_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("daemon.json");
    std::fs::write(
        &path,
        r#"{
            "role": "router",
            "endpoint": {"transport": "tcp", "port": 5555},
            "heartbeat": {"endpoint": "ipc:///tmp/liveness-hb.sock", "interval_secs": 0.5, "max_missed": 5},
            "identity_file": "ids.json",
            "options": {"attempts": 7, "reply_timeout_ms": 250}
        }"#,
    )
    .unwrap();

    let config = DaemonConfig::load(&path).unwrap();
    assert_eq!(config.role, NodeRole::Router);
    assert_eq!(config.identity_file, std::path::PathBuf::from("ids.json"));

    let node_config = config.to_node_config().unwrap();
    assert_eq!(node_config.connection.connection_string(liveness_core::LinkMode::Bind), "tcp://*:5555");
    let heartbeat = node_config.heartbeat.unwrap();
    assert_eq!(heartbeat.connection.kind(), TransportKind::Ipc);
    assert_eq!(heartbeat.interval, Duration::from_millis(500));
    assert_eq!(heartbeat.timeout, Duration::from_secs(30));
    assert_eq!(heartbeat.max_missed, 5);
    assert_eq!(node_config.options.retry.attempts, 7);
    assert_eq!(node_config.options.retry.reply_timeout, Duration::from_millis(250));
    assert_eq!(node_config.options.connect_timeout, Duration::from_secs(2));
    assert_eq!(config.client_interval().unwrap(), Duration::from_millis(500));
}

#[test]
fn test_invalid_config_files() {
    let dir = TempDir::new().unwrap();

    assert!(DaemonConfig::load(&dir.path().join("missing.json")).is_err());

    for contents in [
        r#"{"role": "gateway"}"#,
        r#"{"endpoint": "udp://host:1"}"#,
        r#"{"endpoint": "tcp://host"}"#,
        r#"{"unexpected": true}"#,
        "not json",
    ] {
        let path = dir.path().join("bad.json");
        std::fs::write(&path, contents).unwrap();
        assert!(DaemonConfig::load(&path).is_err(), "Accepted: {}", contents);
    }
}

#[test]
fn test_cli_overrides_file_values() {
    let mut config = DaemonConfig::from_json(
        r#"{"role": "worker", "endpoint": "tcp://localhost:5555", "heartbeat": {"endpoint": "tcp://localhost:5556"}}"#,
    )
    .unwrap();

    config
        .apply(Overrides {
            role: Some(NodeRole::Client),
            endpoint: Some("inproc://main".parse().unwrap()),
            interval_secs: Some(2.0),
            max_missed: Some(1),
            ..Overrides::default()
        })
        .unwrap();

    assert_eq!(config.role, NodeRole::Client);
    let node_config = config.to_node_config().unwrap();
    assert_eq!(node_config.connection.kind(), TransportKind::Inproc);
    let heartbeat = node_config.heartbeat.unwrap();
    assert_eq!(heartbeat.connection.kind(), TransportKind::Tcp);
    assert_eq!(heartbeat.interval, Duration::from_secs(2));
    assert_eq!(heartbeat.max_missed, 1);
}

#[test]
fn test_heartbeat_enabled_from_cli() {
    let mut config = DaemonConfig::default();
    config
        .apply(Overrides {
            endpoint: Some("inproc://main".parse().unwrap()),
            heartbeat: Some("inproc://hb".parse().unwrap()),
            ..Overrides::default()
        })
        .unwrap();

    let heartbeat = config.to_node_config().unwrap().heartbeat.unwrap();
    assert_eq!(heartbeat.interval, Duration::from_secs(10));
    assert_eq!(heartbeat.max_missed, 3);
}

#[test]
fn test_heartbeat_tuning_needs_endpoint() {
    let mut config = DaemonConfig::default();
    let result = config.apply(Overrides {
        interval_secs: Some(1.0),
        ..Overrides::default()
    });
    assert!(result.is_err());
}

// ==================== Role runner ====================

fn options() -> NodeOptions {
    NodeOptions {
        connect_timeout: Duration::from_millis(300),
        poll_timeout: Duration::from_millis(50),
        retry: RetryPolicy {
            attempts: 3,
            retry_timeout: Duration::from_millis(50),
            reply_timeout: Duration::from_millis(500),
        },
    }
}

fn node(ctx: &Context, role: NodeRole, name: &str) -> NodeSocket {
    let config = NodeConfig::new(role, ConnectionDescriptor::inproc(name).unwrap())
        .with_options(options());
    NodeSocket::with_context(ctx.clone(), config, NodeIdentity::generate()).unwrap()
}

/// Run `node` under the daemon runner until the returned token is cancelled.
fn spawn_runner(
    node: Arc<NodeSocket>,
) -> (CancellationToken, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        node::run(&node, Duration::from_millis(100), token).await
    });
    (cancel, handle)
}

#[tokio::test]
async fn test_server_answers_requests() {
    let ctx = Context::new();
    let server = Arc::new(node(&ctx, NodeRole::Server, "daemon-echo"));
    let (cancel, runner) = spawn_runner(server.clone());

    let client = node(&ctx, NodeRole::Client, "daemon-echo");
    for n in 0..3 {
        let reply = client
            .request(&EventKind::Message, &json!({ "n": n }))
            .await
            .unwrap();
        assert_eq!(reply.event, EventKind::Response);
        assert_eq!(reply.data, json!({ "n": n }));
    }

    cancel.cancel();
    runner.await.unwrap().unwrap();
    assert_eq!(server.status(), SocketStatus::Closed);
    client.cleanup().await;
}

#[tokio::test]
async fn test_router_answers_workers() {
    let ctx = Context::new();
    let router = Arc::new(node(&ctx, NodeRole::Router, "daemon-router"));
    let (cancel, runner) = spawn_runner(router.clone());

    let worker = node(&ctx, NodeRole::Worker, "daemon-router");
    worker.reconnect().await.unwrap();
    worker
        .send_event(&EventKind::Message, &json!("hello"), true)
        .await
        .unwrap();

    let frames = worker
        .recv_timeout(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("Router did not reply");
    let reply = parse_message(&frames).unwrap();
    assert_eq!(reply.event, EventKind::Response);
    assert_eq!(reply.data, json!("hello"));

    cancel.cancel();
    runner.await.unwrap().unwrap();
    worker.cleanup().await;
}

#[tokio::test]
async fn test_client_runner_stops_on_cancel() {
    let ctx = Context::new();
    let server = Arc::new(node(&ctx, NodeRole::Server, "daemon-client"));
    let client = Arc::new(node(&ctx, NodeRole::Client, "daemon-client"));
    let (server_cancel, server_runner) = spawn_runner(server.clone());
    let (client_cancel, client_runner) = spawn_runner(client.clone());

    tokio::time::sleep(Duration::from_millis(500)).await;
    client_cancel.cancel();
    tokio::time::timeout(Duration::from_secs(3), client_runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(client.status(), SocketStatus::Closed);

    server_cancel.cancel();
    server_runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bind_conflict_is_fatal() {
    let ctx = Context::new();
    let first = node(&ctx, NodeRole::Server, "daemon-taken");
    assert!(first.connect().await.unwrap());

    let second = Arc::new(node(&ctx, NodeRole::Server, "daemon-taken"));
    let (_cancel, runner) = spawn_runner(second.clone());
    let result = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_err());
    assert_eq!(second.status(), SocketStatus::Closed);

    first.cleanup().await;
}

// ==================== Worker pool ====================

/// Send `data` to the worker behind `route` until it answers.
async fn ask(router: &NodeSocket, route: &[u8], data: Value) -> Vec<Frame> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut request = create_message(&EventKind::Message, &data, true).unwrap();
        request.insert(0, route.to_vec());
        // Unknown until the worker has connected.
        if router.send(request).await.is_ok() {
            if let Some(frames) = router.recv_timeout(Duration::from_millis(500)).await.unwrap() {
                return frames;
            }
        }
        assert!(
            Instant::now() < deadline,
            "No reply from {}",
            String::from_utf8_lossy(route)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_worker_pool_serves_with_handler() {
    let ctx = Context::new();
    let router = node(&ctx, NodeRole::Router, "daemon-pool");
    assert!(router.connect().await.unwrap());

    let config = NodeConfig::new(
        NodeRole::Worker,
        ConnectionDescriptor::inproc("daemon-pool").unwrap(),
    )
    .with_options(options());
    let base = NodeIdentity::new("pool", "s1").unwrap();
    let pool = Arc::new(WorkerPool::with_context(ctx.clone(), &config, &base, 3).unwrap());

    let handler: Handler = Arc::new(|envelope: &Envelope| json!({ "handled": envelope.data }));
    let cancel = CancellationToken::new();
    let runner = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.run(handler, cancel).await })
    };

    for index in 0..3 {
        let route = format!("pool-{}", index).into_bytes();
        let reply = ask(&router, &route, json!(index)).await;
        assert_eq!(reply[0], route);
        let envelope = parse_message(&reply[1..]).unwrap();
        assert_eq!(envelope.event, EventKind::Response);
        assert_eq!(envelope.data, json!({ "handled": index }));
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(
        pool.workers()
            .iter()
            .all(|worker| worker.status() == SocketStatus::Closed)
    );
    assert!(ctx.is_terminated());
    router.cleanup().await;
}
