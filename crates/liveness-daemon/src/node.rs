//! Role runner: drives one node until shutdown.

use anyhow::{Context, Result};
use liveness_core::{
    Envelope, EventKind, Frame, LivenessError, NodeRole, NodeSocket, create_message,
    parse_message,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound on one receive wait, so cancellation and reattachment are
/// checked regularly.
const SERVE_POLL: Duration = Duration::from_millis(500);

/// Builds the `response` body for one well-formed request.
pub type Handler = Arc<dyn Fn(&Envelope) -> Value + Send + Sync>;

/// Handler answering every request with its own data.
pub fn echo() -> Handler {
    Arc::new(|envelope: &Envelope| envelope.data.clone())
}

/// Run `node` in its role until `cancel` fires, then clean it up. Requests
/// are echoed back.
pub async fn run(node: &NodeSocket, client_interval: Duration, cancel: CancellationToken) -> Result<()> {
    run_with_handler(node, client_interval, echo(), cancel).await
}

/// Like [`run`], with `handler` building the replies of a responding role.
///
/// Binding or connecting with an unusable endpoint is fatal; every other
/// failure is logged and retried.
pub async fn run_with_handler(
    node: &NodeSocket,
    client_interval: Duration,
    handler: Handler,
    cancel: CancellationToken,
) -> Result<()> {
    let result = serve(node, client_interval, &handler, &cancel).await;
    node.cleanup().await;
    result
}

async fn serve(
    node: &NodeSocket,
    client_interval: Duration,
    handler: &Handler,
    cancel: &CancellationToken,
) -> Result<()> {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        result = node.connect() => result,
    };
    match connected.with_context(|| format!("Failed to start node on {}", node.connection_string()))? {
        true => tracing::info!("Node ready on {}", node.connection_string()),
        false => tracing::warn!("No peer yet on {}; continuing", node.connection_string()),
    }

    match node.role() {
        Some(NodeRole::Client) => run_client(node, client_interval, cancel).await,
        Some(role) => run_responder(node, role, handler, cancel).await,
        None => {}
    }
    tracing::info!("Node shutting down");
    Ok(())
}

/// Send a `message` request every `interval` and log the outcome.
async fn run_client(node: &NodeSocket, interval: Duration, cancel: &CancellationToken) {
    let mut seq: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        seq += 1;
        let request = json!({ "seq": seq, "node_id": node.identity().node_id });
        let reply = tokio::select! {
            _ = cancel.cancelled() => return,
            reply = node.request(&EventKind::Message, &request) => reply,
        };
        match reply {
            Ok(envelope) => {
                tracing::info!(seq, event = %envelope.event, "Reply received: {}", envelope.data);
            }
            Err(e @ (LivenessError::Timeout { .. } | LivenessError::Connection { .. })) => {
                tracing::warn!(seq, "Request failed: {}", e);
            }
            Err(e) => tracing::error!(seq, "Request failed: {}", e),
        }
    }
}

/// Answer every request with a `response` built by `handler`.
async fn run_responder(
    node: &NodeSocket,
    role: NodeRole,
    handler: &Handler,
    cancel: &CancellationToken,
) {
    loop {
        if !node.is_attached() {
            let attached = tokio::select! {
                _ = cancel.cancelled() => return,
                result = node.connect() => result,
            };
            if let Err(e) = attached {
                tracing::warn!("Failed to reattach: {}", e);
                if pause(cancel).await {
                    return;
                }
                continue;
            }
        }

        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            result = node.recv_timeout(SERVE_POLL) => result,
        };
        let frames = match received {
            Ok(Some(frames)) => frames,
            Ok(None) => continue,
            Err(LivenessError::SocketInvalid(e)) => {
                tracing::debug!("Socket replaced after: {}", e);
                continue;
            }
            Err(e) => {
                tracing::warn!("Receive failed: {}", e);
                if pause(cancel).await {
                    return;
                }
                continue;
            }
        };

        let reply = match reply_frames(role, &frames, handler) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("Failed to build reply: {}", e);
                continue;
            }
        };
        if let Err(e) = node.send(reply).await {
            tracing::warn!("Failed to send reply: {}", e);
        }
    }
}

/// Sleep briefly; returns `true` if cancelled meanwhile.
async fn pause(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(SERVE_POLL) => false,
    }
}

/// Build the `response` for a received message, addressed the way `role`
/// requires. Malformed requests get an error body and never reach `handler`.
pub fn reply_frames(role: NodeRole, frames: &[Frame], handler: &Handler) -> Result<Vec<Frame>> {
    let (route, body) = match role {
        NodeRole::Router => match frames.split_first() {
            Some((route, body)) => (Some(route.clone()), body),
            None => (None, frames),
        },
        _ => (None, frames),
    };
    let delimited = body.first().is_some_and(|frame| frame.is_empty());

    let data = match parse_message(body) {
        Ok(envelope) => {
            tracing::debug!(event = %envelope.event, "Request received");
            handler(&envelope)
        }
        Err(e) => {
            tracing::warn!("Malformed request: {}", e);
            json!({ "error": e.to_string() })
        }
    };

    let include_empty_frame = matches!(role, NodeRole::Router | NodeRole::Worker) && delimited;
    let mut reply = create_message(&EventKind::Response, &data, include_empty_frame)?;
    if let Some(route) = route {
        reply.insert(0, route);
    }
    Ok(reply)
}

/// Payload of a reply built by [`reply_frames`].
pub fn reply_data(frames: &[Frame]) -> Option<Value> {
    parse_message(frames).ok().map(|envelope| envelope.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_reply_keeps_route_and_delimiter() {
        let mut request = create_message(&EventKind::Message, &json!({"n": 1}), true).unwrap();
        request.insert(0, b"worker-1".to_vec());

        let reply = reply_frames(NodeRole::Router, &request, &echo()).unwrap();
        assert_eq!(reply[0], b"worker-1".to_vec());
        assert!(reply[1].is_empty());
        assert_eq!(reply[2], b"response".to_vec());
        assert_eq!(reply_data(&reply[1..]), Some(json!({"n": 1})));
    }

    #[test]
    fn test_server_reply_is_bare() {
        let request = create_message(&EventKind::Message, &json!("ping"), false).unwrap();
        let reply = reply_frames(NodeRole::Server, &request, &echo()).unwrap();
        assert_eq!(reply.len(), 2);
        assert_eq!(reply_data(&reply), Some(json!("ping")));
    }

    #[test]
    fn test_malformed_request_gets_error_body() {
        let reply = reply_frames(NodeRole::Server, &[b"message".to_vec()], &echo()).unwrap();
        let data = reply_data(&reply).unwrap();
        assert!(data.get("error").is_some());
    }

    #[test]
    fn test_handler_builds_the_reply() {
        let handler: Handler = Arc::new(|envelope: &Envelope| {
            json!({ "event": envelope.event.to_string(), "doubled": envelope.data["n"].as_i64().map(|n| n * 2) })
        });
        let request = create_message(&EventKind::Message, &json!({"n": 21}), true).unwrap();
        let reply = reply_frames(NodeRole::Worker, &request, &handler).unwrap();
        assert!(reply[0].is_empty());
        assert_eq!(
            reply_data(&reply),
            Some(json!({ "event": "message", "doubled": 42 }))
        );
    }
}
