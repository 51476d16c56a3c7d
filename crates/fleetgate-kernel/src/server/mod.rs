//! HTTP servers: the public API surface and the loopback agent bridge.

pub mod agent_ws;
pub mod router;

use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::state::GatewayState;

/// Bring up both listeners and serve until shutdown.
pub async fn serve(state: GatewayState) -> anyhow::Result<()> {
    let bridge_state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = agent_ws::serve_agent_bridge(bridge_state).await {
            error!(target: "server", %err, "agent bridge exited");
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], state.cfg.listen_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind gateway http on {addr}"))?;
    info!(target: "server", "Gateway HTTP ready at http://{addr}");

    let router = router::build_router().with_state(state);
    axum::serve(listener, router)
        .await
        .context("gateway http server exited unexpectedly")
}
