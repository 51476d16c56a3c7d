//! Loopback WebSocket bridge for the in-page agents.
//!
//! Each agent connects to `ws://127.0.0.1:9998?authIndex=<i>`. The handler
//! registers an [`AgentSocket`] with the connection registry, writes
//! server frames from its channel onto the socket, and feeds parsed agent
//! frames back into the registry. The socket's close (for whatever reason)
//! starts the registry's grace window.

use std::net::SocketAddr;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use agent_protocol::AgentFrame;
use connection_registry::AgentSocket;
use fleetgate_core_types::AuthIndex;

use crate::config::AGENT_WS_PORT;
use crate::state::GatewayState;

#[derive(Deserialize)]
struct BridgeQuery {
    #[serde(rename = "authIndex")]
    auth_index: u32,
}

pub async fn serve_agent_bridge(state: GatewayState) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], AGENT_WS_PORT));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind agent bridge on {addr}"))?;
    info!(target: "agent-ws", "agent bridge listening on ws://{addr}");

    let router = Router::new()
        .route("/", get(bridge_handler))
        .with_state(state);
    axum::serve(listener, router)
        .await
        .context("agent bridge exited unexpectedly")
}

async fn bridge_handler(
    State(state): State<GatewayState>,
    Query(query): Query<BridgeQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let auth_index = AuthIndex(query.auth_index);
    ws.on_upgrade(move |socket| handle_agent_socket(state, auth_index, socket))
}

async fn handle_agent_socket(state: GatewayState, auth_index: AuthIndex, socket: WebSocket) {
    let (tx, mut outgoing) = mpsc::unbounded_channel();
    let agent = AgentSocket::new(auth_index, tx);
    let socket_id = agent.socket_id;
    state.registry.on_socket_open(agent);

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target: "agent-ws", %err, "unserializable server frame");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<AgentFrame>(&text) {
                            Ok(frame) => state.registry.on_frame(frame),
                            Err(err) => {
                                // Unknown event types are dropped, per the
                                // protocol contract.
                                debug!(target: "agent-ws", %err, "undecodable agent frame dropped");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(target: "agent-ws", ?frame, "agent socket closed by peer");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Err(err)) => {
                        warn!(target: "agent-ws", %err, %auth_index, "agent socket error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.registry.on_socket_close(auth_index, socket_id);
}
