//! Public API router.

use axum::extract::State;
use axum::http::Method;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::state::GatewayState;

mod anthropic;
mod common;
mod native;
mod openai;

/// Assemble the three dialect surfaces plus the health probe.
pub fn build_router() -> Router<GatewayState> {
    Router::new()
        .merge(openai::router())
        .merge(anthropic::router())
        .merge(native::router())
        .route("/health", get(health_handler))
        .layer(cors_layer())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

async fn health_handler(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "current_auth_index": state.switcher.current().map(|i| i.0),
        "usage_count": state.switcher.usage_count(),
        "failure_count": state.switcher.failure_count(),
        "system_busy": state.switcher.is_busy(),
        "connected_identities": state
            .registry
            .connected_identities()
            .iter()
            .map(|i| i.0)
            .collect::<Vec<_>>(),
        "inflight_requests": state.registry.queue_count(),
        "browser_started": state.fleet.browser_started(),
    }))
}
