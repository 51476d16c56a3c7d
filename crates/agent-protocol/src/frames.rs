//! Frame types for the agent WebSocket.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use fleetgate_core_types::{RequestId, StreamMode};

/// A request relayed to the in-page agent for execution against the
/// upstream origin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub request_id: String,
    pub method: String,
    /// Cleaned path (may be absolute; the agent extracts pathname+search).
    pub path: String,
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Textual body, when the payload is valid UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Base64 body for binary uploads (non-generative paths).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_b64: Option<String>,
    pub streaming_mode: StreamMode,
    pub is_generative: bool,
}

/// Server → agent frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ServerFrame {
    ProxyRequest(ProxyRequest),
    CancelRequest { request_id: String },
    SetLogLevel { level: String },
}

/// Agent → server frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AgentFrame {
    ResponseHeaders {
        request_id: String,
        status: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Chunk {
        request_id: String,
        /// Text for string streams; base64 when the agent relays binary.
        data: String,
    },
    StreamClose {
        request_id: String,
    },
    Error {
        request_id: String,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        message: String,
    },
}

impl AgentFrame {
    pub fn request_id(&self) -> &str {
        match self {
            AgentFrame::ResponseHeaders { request_id, .. }
            | AgentFrame::Chunk { request_id, .. }
            | AgentFrame::StreamClose { request_id }
            | AgentFrame::Error { request_id, .. } => request_id,
        }
    }

    /// Split into the correlation key and the value a request queue carries.
    /// `stream_close` maps to the terminal [`RelayEvent::StreamEnd`] sentinel.
    pub fn into_event(self) -> (RequestId, RelayEvent) {
        match self {
            AgentFrame::ResponseHeaders {
                request_id,
                status,
                headers,
            } => (RequestId(request_id), RelayEvent::Headers { status, headers }),
            AgentFrame::Chunk { request_id, data } => {
                (RequestId(request_id), RelayEvent::Chunk { data })
            }
            AgentFrame::StreamClose { request_id } => {
                (RequestId(request_id), RelayEvent::StreamEnd)
            }
            AgentFrame::Error {
                request_id,
                status,
                message,
            } => (RequestId(request_id), RelayEvent::Error { status, message }),
        }
    }
}

/// What a request queue delivers to the pipeline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RelayEvent {
    Headers {
        status: u16,
        headers: HashMap<String, String>,
    },
    Chunk {
        data: String,
    },
    Error {
        status: Option<u16>,
        message: String,
    },
    /// The agent closed the stream; no further useful output follows.
    StreamEnd,
}
