//! Anthropic-compatible surface: `/v1/messages` and count-tokens.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use crate::auth;
use crate::dialect::{self, Dialect};
use crate::pipeline::streaming::NonStreamShape;
use crate::state::GatewayState;

use super::common::{self, CallKind};

pub(crate) fn router() -> Router<GatewayState> {
    Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/messages/count_tokens", post(count_tokens_handler))
}

async fn messages_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response<Body> {
    if !auth::check_x_api_key(&headers, &state.cfg.api_keys) {
        return common::unauthorized(Dialect::Anthropic);
    }

    let translated = match dialect::anthropic::translate_in(&body) {
        Ok(translated) => translated,
        Err(err) => return common::error_response(Dialect::Anthropic, &err),
    };

    common::run_dialect_call(
        state,
        Dialect::Anthropic,
        translated,
        CallKind::Generate {
            shape: NonStreamShape::Anthropic,
        },
    )
    .await
}

async fn count_tokens_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response<Body> {
    if !auth::check_x_api_key(&headers, &state.cfg.api_keys) {
        return common::unauthorized(Dialect::Anthropic);
    }

    let translated = match dialect::anthropic::count_tokens_request(&body) {
        Ok(translated) => translated,
        Err(err) => return common::error_response(Dialect::Anthropic, &err),
    };

    common::run_dialect_call(
        state,
        Dialect::Anthropic,
        translated,
        CallKind::CountTokens {
            shape: NonStreamShape::AnthropicCountTokens,
        },
    )
    .await
}
