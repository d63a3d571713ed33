//! Socket recovery and request retry tests.

use std::sync::Arc;
use std::time::Duration;

use liveness_core::{
    ConnectionDescriptor, Context, EventKind, LivenessError, NodeConfig, NodeIdentity,
    NodeOptions, NodeRole, NodeSocket, RetryPolicy, SocketStatus, TransportError, parse_message,
};
use serde_json::json;
use tokio::task::JoinHandle;

fn options() -> NodeOptions {
    NodeOptions {
        connect_timeout: Duration::from_millis(300),
        poll_timeout: Duration::from_millis(50),
        retry: RetryPolicy {
            attempts: 5,
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

/// Echo `count` requests back as `response` events.
fn spawn_echo(server: Arc<NodeSocket>, count: usize) -> JoinHandle<()> {
    tokio::spawn(async move {
        for _ in 0..count {
            let frames = server
                .recv_timeout(Duration::from_secs(5))
                .await
                .unwrap()
                .expect("Server timed out waiting for a request");
            let request = parse_message(&frames).unwrap();
            server
                .send_event(&EventKind::Response, &request.data, false)
                .await
                .unwrap();
        }
    })
}

// ==================== Request / reply ====================

#[tokio::test]
async fn test_request_round_trip() {
    let ctx = Context::new();
    let server = Arc::new(node(&ctx, NodeRole::Server, "echo"));
    assert!(server.connect().await.unwrap());
    let echo = spawn_echo(server.clone(), 2);

    let client = node(&ctx, NodeRole::Client, "echo");
    for n in 0..2 {
        let reply = client
            .request(&EventKind::Message, &json!({ "n": n }))
            .await
            .unwrap();
        assert_eq!(reply.event, EventKind::Response);
        assert_eq!(reply.data, json!({ "n": n }));
    }

    echo.await.unwrap();
    client.cleanup().await;
    server.cleanup().await;
}

#[tokio::test]
async fn test_request_waits_for_late_server() {
    let ctx = Context::new();
    let client = node(&ctx, NodeRole::Client, "late");

    let server_ctx = ctx.clone();
    let server = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let server = Arc::new(node(&server_ctx, NodeRole::Server, "late"));
        assert!(server.connect().await.unwrap());
        spawn_echo(server.clone(), 1).await.unwrap();
        server
    });

    let reply = client
        .request(&EventKind::Message, &json!("ping"))
        .await
        .unwrap();
    assert_eq!(reply.data, json!("ping"));

    let server = server.await.unwrap();
    client.cleanup().await;
    server.cleanup().await;
}

#[tokio::test]
async fn test_request_recovers_from_closed_socket() {
    let ctx = Context::new();
    let server = Arc::new(node(&ctx, NodeRole::Server, "recover-req"));
    assert!(server.connect().await.unwrap());
    let echo = spawn_echo(server.clone(), 1);

    let client = node(&ctx, NodeRole::Client, "recover-req");
    assert!(client.connect().await.unwrap());
    let before = client.socket();
    before.close();

    let reply = client
        .request(&EventKind::Message, &json!({ "after": "close" }))
        .await
        .unwrap();
    assert_eq!(reply.data, json!({ "after": "close" }));
    assert_ne!(client.socket().id(), before.id());

    echo.await.unwrap();
    client.cleanup().await;
    server.cleanup().await;
}

#[tokio::test]
async fn test_request_without_server_times_out() {
    let ctx = Context::new();
    let config = NodeConfig::new(NodeRole::Client, ConnectionDescriptor::inproc("nobody").unwrap())
        .with_options(NodeOptions {
            connect_timeout: Duration::from_millis(50),
            retry: RetryPolicy {
                attempts: 2,
                retry_timeout: Duration::from_millis(10),
                reply_timeout: Duration::from_millis(50),
            },
            ..options()
        });
    let client = NodeSocket::with_context(ctx, config, NodeIdentity::generate()).unwrap();

    let err = client
        .request(&EventKind::Message, &json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, LivenessError::Connection { attempts: 2, .. }));
    assert!(err.is_retryable());
    client.cleanup().await;
}

// ==================== Socket recovery ====================

#[tokio::test]
async fn test_invalid_socket_is_replaced_and_monitored() {
    let ctx = Context::new();
    let router = node(&ctx, NodeRole::Router, "replace");
    let worker = node(&ctx, NodeRole::Worker, "replace");
    assert!(router.connect().await.unwrap());
    assert!(worker.connect().await.unwrap());
    let generation = worker.monitor().generation();
    let node_id = worker.identity().node_id.clone();

    worker.socket().close();
    let err = worker
        .send_event(&EventKind::Message, &json!(1), true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LivenessError::SocketInvalid(TransportError::Closed)
    ));
    assert!(worker.monitor().generation() > generation);
    assert!(!worker.is_connected());

    // The monitor follows the new socket once it is attached.
    assert!(worker.connect().await.unwrap());
    assert_eq!(worker.status(), SocketStatus::Connected);
    assert_eq!(worker.identity().node_id, node_id);

    worker
        .send_event(&EventKind::Message, &json!(2), true)
        .await
        .unwrap();
    let frames = router
        .recv_timeout(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frames[0], node_id.as_bytes());
    assert_eq!(parse_message(&frames).unwrap().data, json!(2));

    worker.cleanup().await;
    router.cleanup().await;
}

#[tokio::test]
async fn test_reconnect_after_router_restart() {
    let ctx = Context::new();
    let router = node(&ctx, NodeRole::Router, "restart");
    let worker = node(&ctx, NodeRole::Worker, "restart");
    assert!(router.connect().await.unwrap());
    assert!(worker.connect().await.unwrap());

    router.cleanup().await;
    let mut status = worker.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| *s == SocketStatus::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();

    let router = node(&ctx, NodeRole::Router, "restart");
    assert!(router.connect().await.unwrap());
    worker.reconnect().await.unwrap();
    assert!(worker.is_connected());

    worker.cleanup().await;
    router.cleanup().await;
}

#[tokio::test]
async fn test_cleanup_then_connect_starts_fresh() {
    let ctx = Context::new();
    let router = node(&ctx, NodeRole::Router, "again");
    assert!(router.connect().await.unwrap());
    let first = router.socket();

    router.cleanup().await;
    assert_eq!(router.status(), SocketStatus::Closed);
    assert!(first.is_closed());

    assert!(router.connect().await.unwrap());
    assert_ne!(router.socket().id(), first.id());
    router.cleanup().await;
}
