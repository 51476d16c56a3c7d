//! Wire contract between the server and the in-page agent.
//!
//! Frames are JSON objects tagged by `event_type` and exchanged over the
//! agent WebSocket. This protocol is the system's narrow waist: the agent is
//! a generic URL-rewriting, header-sanitizing HTTP executor, and everything
//! that looks like business logic stays on the server side.

pub mod frames;
pub mod rewrite;

pub use frames::{AgentFrame, ProxyRequest, RelayEvent, ServerFrame};
pub use rewrite::{
    rewrite_relay_headers, rewrite_upstream_redirect, sanitize_response_headers,
    split_proxy_host, PROXY_HOST_PARAM, REQUEST_HEADER_STRIP,
};
