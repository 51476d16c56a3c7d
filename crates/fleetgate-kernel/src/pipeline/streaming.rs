//! Response shaping for the three streaming modes.
//!
//! Real streams forward frames as they arrive, pseudo streams accumulate the
//! full body behind keep-alive comments and emit it as split SSE records,
//! and non-stream responses buffer everything before answering. All three
//! run their finalization through the dispatch guard, so a client that goes
//! away mid-response cancels the upstream fetch instead of leaking it.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderName, HeaderValue, Response, StatusCode};
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use agent_protocol::{rewrite_relay_headers, RelayEvent};
use frame_queue::QueueError;

use crate::dialect::{self, Dialect, StreamTranslator};
use crate::rewrite::{self, PseudoRecords};

/// Per-chunk idle deadline on a live stream.
const CHUNK_IDLE: Duration = Duration::from_secs(60);
/// Idle deadline while accumulating a pseudo/non-stream body.
const ACCUMULATE_IDLE: Duration = Duration::from_secs(300);

use super::Dispatched;

fn apply_upstream_headers(
    builder: axum::http::response::Builder,
    headers: &HashMap<String, String>,
) -> axum::http::response::Builder {
    let mut builder = builder;
    for (name, value) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        builder = builder.header(name, value);
    }
    builder
}

fn stream_body(rx: mpsc::Receiver<Result<Bytes, Infallible>>) -> Body {
    Body::from_stream(ReceiverStream::new(rx))
}

fn plain_response(status: u16, body: String) -> Response<Body> {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Real streaming: forward the upstream status/headers, then each chunk as
/// it arrives, translated into the client's dialect.
///
/// `forward_headers` is set for the native dialect, where the upstream
/// response headers (after sanitation and redirect rewriting) belong to the
/// client; translated dialects get a plain SSE header set instead.
pub fn real_stream_response(
    dispatched: Dispatched,
    mut translator: StreamTranslator,
    own_authority: String,
    forward_headers: bool,
) -> Response<Body> {
    let Dispatched {
        first,
        queue,
        guard,
        ..
    } = dispatched;

    let (status, upstream_headers) = match first {
        RelayEvent::Headers { status, mut headers } => {
            rewrite_relay_headers(&mut headers, &own_authority);
            (status, headers)
        }
        other => {
            debug!(target: "streaming", ?other, "stream started without headers frame");
            (200, HashMap::new())
        }
    };

    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(32);
    tokio::spawn(async move {
        loop {
            match queue.dequeue(CHUNK_IDLE).await {
                Ok(RelayEvent::Chunk { data }) => {
                    for record in translator.translate(&data) {
                        if tx.send(Ok(Bytes::from(record))).await.is_err() {
                            // Client went away; the guard's drop cancels the
                            // upstream request.
                            return;
                        }
                    }
                }
                Ok(RelayEvent::StreamEnd) => {
                    for record in translator.finish() {
                        if tx.send(Ok(Bytes::from(record))).await.is_err() {
                            return;
                        }
                    }
                    guard.complete();
                    return;
                }
                Ok(RelayEvent::Error { status, message }) => {
                    // Headers are out already; best-effort SSE error record.
                    let record = translator.error_record(status.unwrap_or(502), &message);
                    let _ = tx.send(Ok(Bytes::from(record))).await;
                    guard.complete();
                    return;
                }
                Ok(RelayEvent::Headers { .. }) => continue,
                Err(QueueError::Timeout) => {
                    // Idle stream: stop writing and close, no trailing error
                    // record on an already-started response.
                    warn!(target: "streaming", "per-chunk idle deadline hit; closing stream");
                    guard.complete();
                    return;
                }
                Err(QueueError::Closed(reason)) => {
                    debug!(target: "streaming", %reason, "queue closed mid-stream");
                    guard.complete();
                    return;
                }
            }
        }
    });

    let mut builder = Response::builder().status(
        StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
    );
    if forward_headers {
        builder = apply_upstream_headers(builder, &upstream_headers);
    }
    builder = builder
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache");
    builder
        .body(stream_body(rx))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Pseudo streaming: keep-alive comments every 12 to 18 s while the complete
/// body accumulates, then one or two data records (thoughts split from
/// content for the native dialect, the dialect's own record set otherwise).
pub fn pseudo_stream_response(
    dispatched: Dispatched,
    dialect: Dialect,
    model: String,
) -> Response<Body> {
    let Dispatched {
        first,
        queue,
        guard,
        ..
    } = dispatched;

    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(32);
    tokio::spawn(async move {
        let mut collected = String::new();
        if let RelayEvent::Chunk { data } = &first {
            collected.push_str(data);
        }

        let mut failed: Option<(u16, String)> = None;
        'accumulate: loop {
            let keep_alive = {
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(12_000..18_000))
            };
            tokio::select! {
                event = queue.dequeue(ACCUMULATE_IDLE) => match event {
                    Ok(RelayEvent::Chunk { data }) => collected.push_str(&data),
                    Ok(RelayEvent::StreamEnd) => break 'accumulate,
                    Ok(RelayEvent::Headers { .. }) => {}
                    Ok(RelayEvent::Error { status, message }) => {
                        failed = Some((status.unwrap_or(502), message));
                        break 'accumulate;
                    }
                    Err(err) => {
                        failed = Some((504, err.to_string()));
                        break 'accumulate;
                    }
                },
                _ = sleep(keep_alive) => {
                    if tx.send(Ok(Bytes::from(": keep-alive\n\n"))).await.is_err() {
                        return;
                    }
                }
            }
        }

        if let Some((status, message)) = failed {
            let record = StreamTranslator::new(dialect, &model).error_record(status, &message);
            let _ = tx.send(Ok(Bytes::from(record))).await;
            guard.complete();
            return;
        }

        let records = shape_pseudo_records(dialect, &model, &collected);
        for record in records {
            if tx.send(Ok(Bytes::from(record))).await.is_err() {
                return;
            }
        }
        guard.complete();
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(stream_body(rx))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Build the final record set for a pseudo stream.
fn shape_pseudo_records(dialect: Dialect, model: &str, raw: &str) -> Vec<String> {
    match dialect {
        Dialect::Native => match rewrite::pseudo_stream_records(raw) {
            PseudoRecords::Split(records) => records
                .into_iter()
                .map(|record| format!("data: {record}\n\n"))
                .collect(),
            PseudoRecords::Raw(raw) => vec![format!("data: {raw}\n\n")],
        },
        Dialect::OpenAi | Dialect::Anthropic => {
            let mut translator = StreamTranslator::new(dialect, model);
            let mut out = match serde_json::from_str::<Value>(raw) {
                Ok(body) => translator.translate(&format!("data: {body}\n")),
                Err(_) => vec![format!("data: {raw}\n\n")],
            };
            out.extend(translator.finish());
            out
        }
    }
}

/// How a buffered response is presented to the client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NonStreamShape {
    Native,
    OpenAi,
    Anthropic,
    AnthropicCountTokens,
}

/// Non-streaming: accumulate frames until `stream_close`, then answer in
/// one piece, rewriting inline images into Markdown for the native shape.
pub async fn non_stream_response(
    dispatched: Dispatched,
    shape: NonStreamShape,
    model: String,
    own_authority: String,
) -> Response<Body> {
    let Dispatched {
        first,
        queue,
        guard,
        ..
    } = dispatched;

    let mut collected = String::new();
    let (status, mut upstream_headers) = match &first {
        RelayEvent::Headers { status, headers } => (*status, headers.clone()),
        RelayEvent::Chunk { data } => {
            collected.push_str(data);
            (200, HashMap::new())
        }
        _ => (200, HashMap::new()),
    };
    rewrite_relay_headers(&mut upstream_headers, &own_authority);

    loop {
        match queue.dequeue(ACCUMULATE_IDLE).await {
            Ok(RelayEvent::Chunk { data }) => collected.push_str(&data),
            Ok(RelayEvent::StreamEnd) => break,
            Ok(RelayEvent::Headers { .. }) => {}
            Ok(RelayEvent::Error { status, message }) => {
                guard.complete();
                let err = crate::error::PipelineError::Upstream {
                    status: status.unwrap_or(502),
                    message,
                };
                let dialect = match shape {
                    NonStreamShape::Native => Dialect::Native,
                    NonStreamShape::OpenAi => Dialect::OpenAi,
                    _ => Dialect::Anthropic,
                };
                return plain_response(
                    err.status(),
                    dialect::error_response_body(dialect, &err).to_string(),
                );
            }
            Err(err) => {
                guard.complete();
                warn!(target: "streaming", %err, "non-stream accumulation failed");
                return plain_response(
                    504,
                    serde_json::json!({
                        "error": { "code": 504, "message": err.to_string() }
                    })
                    .to_string(),
                );
            }
        }
    }
    guard.complete();

    match shape {
        NonStreamShape::Native => {
            let body = match serde_json::from_str::<Value>(&collected) {
                Ok(mut parsed) => {
                    if rewrite::rewrite_inline_images(&mut parsed) {
                        parsed.to_string()
                    } else {
                        collected
                    }
                }
                Err(_) => collected,
            };
            let builder = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
            apply_upstream_headers(builder, &upstream_headers)
                .body(Body::from(body))
                .unwrap_or_else(|_| Response::new(Body::empty()))
        }
        NonStreamShape::OpenAi => plain_response(
            200,
            dialect::openai::non_stream_response(&collected, &model).to_string(),
        ),
        NonStreamShape::Anthropic => plain_response(
            200,
            dialect::anthropic::non_stream_response(&collected, &model).to_string(),
        ),
        NonStreamShape::AnthropicCountTokens => plain_response(
            200,
            dialect::anthropic::count_tokens_response(&collected).to_string(),
        ),
    }
}
