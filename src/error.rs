//! Typed error taxonomy shared across the call runtime.
//!
//! The session loop is the only place that converts a [`RuntimeError`] into a
//! state transition (see `state_machine`); every other module returns one of
//! these variants rather than bubbling up `anyhow::Error`, so the loop can
//! `match` on kind instead of downcasting.

use thiserror::Error;

/// The six error kinds the runtime distinguishes. Each maps to a specific
/// call-ending `endReason` or HTTP status at the admission boundary.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Missing/invalid env or agent config. Fatal at startup or call setup,
    /// never raised mid-call.
    #[error("config error: {0}")]
    Config(String),

    /// Malformed carrier/model wire frame. Logged and discarded by default;
    /// escalated to a session end by the caller once a threshold is hit.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// WebSocket read/write failure, carrier or model side.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Rate limit exceeded, no provider assigned, unauthorized admission.
    #[error("policy error: {0}")]
    Policy(String),

    /// A duration/silence/response timer fired.
    #[error("timeout: {0}")]
    Timeout(&'static str),

    /// Model rejected a cache handle, or a resource budget was exceeded.
    #[error("resource error: {0}")]
    Resource(String),
}

impl RuntimeError {
    /// Maps an error to the `endReason` string persisted on a CallSession,
    /// where applicable. Policy/Config errors never reach a live session so
    /// they have no call-ending reason.
    pub fn end_reason(&self) -> Option<&'static str> {
        match self {
            RuntimeError::Protocol(_) => Some("protocol"),
            RuntimeError::Transport(_) => Some("provider-close"),
            RuntimeError::Timeout(which) => Some(which),
            RuntimeError::Resource(_) => None,
            RuntimeError::Config(_) | RuntimeError::Policy(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl From<tokio_tungstenite::tungstenite::Error> for RuntimeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RuntimeError::Transport(Box::new(e))
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        RuntimeError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_its_literal_reason() {
        let e = RuntimeError::Timeout("silence");
        assert_eq!(e.end_reason(), Some("silence"));
    }

    #[test]
    fn config_and_policy_have_no_call_ending_reason() {
        assert_eq!(RuntimeError::Config("x".into()).end_reason(), None);
        assert_eq!(RuntimeError::Policy("x".into()).end_reason(), None);
    }
}
