//! Gateway error taxonomy.
//!
//! The error set is closed: every stage fails with one of the variants
//! below, and only the handler adapter in [`crate::server`] turns a
//! variant into bytes on the wire. `RuleContinue` and `StreamDone` are
//! control-flow markers that must never reach a client.

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    /// The upstream answered with a non-2xx status. The response is
    /// passed through to the client verbatim.
    #[error("upstream response error: status {status}")]
    UpstreamResponse {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },

    /// Dial, read or timeout failure before a valid HTTP response.
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    /// An error intended for the client, serialized as `{"error": message}`.
    #[error("{message}")]
    Handler { status: StatusCode, message: String },

    /// Rule-engine marker: fall through to the next rule.
    #[error("rule action: continue")]
    RuleContinue,

    /// SSE parser marker: the `[DONE]` frame, not a real chunk.
    #[error("stream done")]
    StreamDone,

    /// No rule in the chain matched the request.
    #[error("no rule matched")]
    NoRuleMatched,

    /// Invalid configuration, detected at load time. Fatal.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn handler(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Handler {
            status,
            message: message.into(),
        }
    }

    pub fn is_stream_done(&self) -> bool {
        matches!(self, Self::StreamDone)
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::UpstreamTransport(format!("request timeout: {err}"))
        } else if err.is_connect() {
            ProxyError::UpstreamTransport(format!("connection failed: {err}"))
        } else {
            ProxyError::UpstreamTransport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Internal(format!("json error: {err}"))
    }
}
