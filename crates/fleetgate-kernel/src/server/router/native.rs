//! Native passthrough surface: `/v1beta/models/{model}:{action}`.

use std::collections::HashMap;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use fleetgate_core_types::{RequestId, StreamMode};

use crate::auth;
use crate::dialect::{self, Dialect};
use crate::error::PipelineError;
use crate::pipeline::streaming::{self, NonStreamShape};
use crate::pipeline::{self, RelayRequest};
use crate::rewrite;
use crate::state::GatewayState;

use super::common;

/// Actions accepted on the model passthrough.
const ACTIONS: &[&str] = &[
    "generateContent",
    "streamGenerateContent",
    "countTokens",
    "predict",
    "batchEmbedContents",
];

/// Request headers never forwarded upstream: the relay's own credentials
/// and hop metadata. The agent strips the browser-managed set itself.
const DROP_INBOUND_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "x-goog-api-key",
    "host",
    "content-length",
    "accept-encoding",
];

pub(crate) fn router() -> Router<GatewayState> {
    Router::new()
        .route("/v1beta/models", get(models_handler))
        .route("/v1beta/models/:model_action", post(model_call_handler))
}

async fn models_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Response<Body> {
    if !auth::check_bearer(&headers, &state.cfg.api_keys) {
        return common::unauthorized(Dialect::Native);
    }
    Json(state.models.native_list()).into_response()
}

async fn model_call_handler(
    State(state): State<GatewayState>,
    Path(model_action): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    if !auth::check_bearer(&headers, &state.cfg.api_keys) {
        return common::unauthorized(Dialect::Native);
    }

    let Some((model_raw, action)) = model_action.split_once(':') else {
        return not_found("model action missing");
    };
    if !ACTIONS.contains(&action) {
        return not_found("unknown model action");
    }

    let (model, thinking_level) = dialect::parse_thinking_suffix(model_raw);
    let is_generative = matches!(action, "generateContent" | "streamGenerateContent" | "predict");

    // Textual bodies ride as JSON strings; anything else goes base64.
    let (mut body_text, body_b64) = match String::from_utf8(body.to_vec()) {
        Ok(text) => (Some(text), None),
        Err(_) => (None, Some(BASE64.encode(&body))),
    };
    if is_generative {
        if let Some(text) = &body_text {
            if let Ok(mut parsed) = serde_json::from_str::<Value>(text) {
                rewrite::apply_native_rewrites(&mut parsed, &state.cfg, thinking_level.as_deref());
                body_text = Some(parsed.to_string());
            }
        }
    }

    let wants_stream = action == "streamGenerateContent";
    let real_stream = wants_stream && state.cfg.default_stream_mode.is_real();
    let pseudo_stream = wants_stream && !real_stream;

    let mut query = query;
    let path = if pseudo_stream {
        // Pseudo mode asks the upstream for the complete body and fans it
        // out as SSE locally.
        query.remove("alt");
        format!(
            "/v1beta/models/{model}{}",
            rewrite::pseudo_rewrite_path(&format!(":{action}"))
        )
    } else {
        if real_stream {
            query.insert("alt".to_string(), "sse".to_string());
        }
        format!("/v1beta/models/{model}:{action}")
    };

    let request = RelayRequest {
        request_id: RequestId::new(),
        method: "POST".into(),
        path,
        query,
        headers: forwarded_headers(&headers),
        body: body_text,
        body_b64,
        stream_mode: if real_stream {
            StreamMode::Real
        } else {
            StreamMode::Fake
        },
        is_generative,
    };

    let dispatched = match pipeline::dispatch(&state, &request).await {
        Ok(dispatched) => dispatched,
        Err(err) => return common::error_response(Dialect::Native, &err),
    };

    if real_stream {
        streaming::real_stream_response(
            dispatched,
            dialect::StreamTranslator::Native,
            state.cfg.own_authority(),
            true,
        )
    } else if pseudo_stream {
        streaming::pseudo_stream_response(dispatched, Dialect::Native, model)
    } else {
        streaming::non_stream_response(
            dispatched,
            NonStreamShape::Native,
            model,
            state.cfg.own_authority(),
        )
        .await
    }
}

fn forwarded_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_ascii_lowercase();
            if DROP_INBOUND_HEADERS.contains(&name.as_str()) {
                return None;
            }
            value.to_str().ok().map(|v| (name, v.to_string()))
        })
        .collect()
}

fn not_found(message: &str) -> Response<Body> {
    let err = PipelineError::Upstream {
        status: 404,
        message: message.into(),
    };
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            dialect::error_response_body(Dialect::Native, &err).to_string(),
        ))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
