//! Shared handler plumbing for the translated dialects.

use std::collections::HashMap;

use axum::body::Body;
use axum::http::{header, Response, StatusCode};

use fleetgate_core_types::{RequestId, StreamMode};

use crate::dialect::{self, Dialect, StreamTranslator, TranslatedRequest};
use crate::error::PipelineError;
use crate::pipeline::streaming::{self, NonStreamShape};
use crate::pipeline::{self, RelayRequest};
use crate::rewrite;
use crate::state::GatewayState;

/// A terminal pipeline error rendered in the caller's dialect.
pub(crate) fn error_response(dialect: Dialect, err: &PipelineError) -> Response<Body> {
    let body = dialect::error_response_body(dialect, err).to_string();
    Response::builder()
        .status(StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

pub(crate) fn unauthorized(dialect: Dialect) -> Response<Body> {
    error_response(
        dialect,
        &PipelineError::Upstream {
            status: 401,
            message: "missing or invalid API key".into(),
        },
    )
}

/// Relay headers sent with translated dialect requests. Client credentials
/// never go upstream; the browser session carries its own.
fn relay_headers() -> HashMap<String, String> {
    HashMap::from([("content-type".to_string(), "application/json".to_string())])
}

/// How a translated call maps onto the native surface.
pub(crate) enum CallKind {
    /// `:generateContent` / `:streamGenerateContent`, honoring the client's
    /// stream flag and the configured relay mode.
    Generate { shape: NonStreamShape },
    /// `:countTokens`; never streams, never counts usage.
    CountTokens { shape: NonStreamShape },
}

/// Run a translated request through the pipeline and shape the response.
pub(crate) async fn run_dialect_call(
    state: GatewayState,
    dialect: Dialect,
    translated: TranslatedRequest,
    kind: CallKind,
) -> Response<Body> {
    let TranslatedRequest {
        mut native_body,
        model,
        thinking_level,
        stream,
    } = translated;

    let (action, is_generative, shape) = match &kind {
        CallKind::Generate { shape } => {
            rewrite::apply_native_rewrites(&mut native_body, &state.cfg, thinking_level.as_deref());
            (":generateContent", true, *shape)
        }
        CallKind::CountTokens { shape } => (":countTokens", false, *shape),
    };

    let real_stream = stream && state.cfg.default_stream_mode.is_real() && is_generative;
    let pseudo_stream = stream && !real_stream && is_generative;

    let mut query = HashMap::new();
    let path = if real_stream {
        query.insert("alt".to_string(), "sse".to_string());
        format!("/v1beta/models/{model}:streamGenerateContent")
    } else {
        format!("/v1beta/models/{model}{action}")
    };

    let request = RelayRequest {
        request_id: RequestId::new(),
        method: "POST".into(),
        path,
        query,
        headers: relay_headers(),
        body: Some(native_body.to_string()),
        body_b64: None,
        stream_mode: if real_stream {
            StreamMode::Real
        } else {
            StreamMode::Fake
        },
        is_generative,
    };

    let dispatched = match pipeline::dispatch(&state, &request).await {
        Ok(dispatched) => dispatched,
        Err(err) => return error_response(dialect, &err),
    };

    if real_stream {
        streaming::real_stream_response(
            dispatched,
            StreamTranslator::new(dialect, &model),
            state.cfg.own_authority(),
            matches!(dialect, Dialect::Native),
        )
    } else if pseudo_stream {
        streaming::pseudo_stream_response(dispatched, dialect, model)
    } else {
        streaming::non_stream_response(dispatched, shape, model, state.cfg.own_authority()).await
    }
}
