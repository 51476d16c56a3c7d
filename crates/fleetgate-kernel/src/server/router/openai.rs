//! OpenAI-compatible surface: `/v1/chat/completions` and `/v1/models`.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Response};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;

use crate::auth;
use crate::dialect::{self, Dialect};
use crate::pipeline::streaming::NonStreamShape;
use crate::state::GatewayState;

use super::common::{self, CallKind};

pub(crate) fn router() -> Router<GatewayState> {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/models", get(models_handler))
}

async fn chat_completions_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response<Body> {
    if !auth::check_bearer(&headers, &state.cfg.api_keys) {
        return common::unauthorized(Dialect::OpenAi);
    }

    let translated = match dialect::openai::translate_in(&body) {
        Ok(translated) => translated,
        Err(err) => return common::error_response(Dialect::OpenAi, &err),
    };

    common::run_dialect_call(
        state,
        Dialect::OpenAi,
        translated,
        CallKind::Generate {
            shape: NonStreamShape::OpenAi,
        },
    )
    .await
}

async fn models_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Response<Body> {
    if !auth::check_bearer(&headers, &state.cfg.api_keys) {
        return common::unauthorized(Dialect::OpenAi);
    }
    Json(state.models.openai_list()).into_response()
}
