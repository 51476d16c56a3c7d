//! Pipeline-level errors, mapped to per-dialect envelopes in the handlers.

use thiserror::Error;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PipelineError {
    /// No identity could serve the request (browser down, rotation empty,
    /// interlock stuck). Maps to 503.
    #[error("service unavailable: {0}")]
    Unavailable(String),
    /// The upstream answered with a terminal error status after retries.
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },
    /// Malformed client input. Maps to 400.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl PipelineError {
    pub fn status(&self) -> u16 {
        match self {
            PipelineError::Unavailable(_) => 503,
            PipelineError::Upstream { status, .. } => *status,
            PipelineError::BadRequest(_) => 400,
        }
    }
}
