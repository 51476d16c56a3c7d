//! Shared identifiers and wire vocabulary used across the FleetGate crates.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Index of a persisted browser identity (one upstream account).
///
/// Identities are enumerated from `configs/auth/auth-<i>.json` at startup.
/// The "no identity active" state is modeled as `Option<AuthIndex>::None`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AuthIndex(pub u32);

impl fmt::Display for AuthIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation key minted per inbound HTTP request and carried on every
/// frame exchanged for that request.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a request queue stopped accepting or delivering frames.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The agent socket died and the grace window elapsed.
    ConnectionLost,
    /// The HTTP client went away before the response completed.
    ClientDisconnect,
    /// The attempt loop discarded the queue before retrying.
    RetryCreatingNewQueue,
    /// Normal finalization after the response was fully written.
    RequestComplete,
    /// A newer queue was created under the same request id.
    ReplacedOnRetry,
    Unknown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ConnectionLost => "connection_lost",
            CloseReason::ClientDisconnect => "client_disconnect",
            CloseReason::RetryCreatingNewQueue => "retry_creating_new_queue",
            CloseReason::RequestComplete => "request_complete",
            CloseReason::ReplacedOnRetry => "replaced_on_retry",
            CloseReason::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How response bytes are relayed from the in-page agent.
///
/// `Real` forwards each upstream chunk as it arrives; `Fake` accumulates the
/// full body in the page and forwards it once.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    Real,
    Fake,
}

impl StreamMode {
    pub fn is_real(&self) -> bool {
        matches!(self, StreamMode::Real)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn close_reason_serializes_snake_case() {
        let json = serde_json::to_string(&CloseReason::ReplacedOnRetry).unwrap();
        assert_eq!(json, "\"replaced_on_retry\"");
        assert_eq!(CloseReason::ConnectionLost.as_str(), "connection_lost");
    }

    #[test]
    fn stream_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&StreamMode::Real).unwrap(), "\"real\"");
        assert_eq!(serde_json::to_string(&StreamMode::Fake).unwrap(), "\"fake\"");
    }
}
