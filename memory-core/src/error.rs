//! Error taxonomy for the memory engine.
//!
//! Variants are grouped by *kind*, not by originating type: `Config` failures
//! abort at startup, `Transport`/`Data` failures propagate from adapters up
//! to whichever orchestrator step is inside its atomic success boundary,
//! `Policy` and `Semantic` are expected, named outcomes rather than bugs,
//! and `Resource` covers budget exhaustion in background jobs. Messages
//! name the offending field or adapter but never echo request/response
//! bodies, which may carry secret-classified content.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("config: {0}")]
    Config(String),

    #[error("transport: {adapter} {detail}")]
    Transport { adapter: &'static str, detail: String },

    #[error("data: {adapter} returned malformed response: {detail}")]
    Data { adapter: &'static str, detail: String },

    #[error("policy: {0}")]
    Policy(&'static str),

    #[error("resource: {0}")]
    Resource(String),
}

impl MemoryError {
    pub fn transport(adapter: &'static str, detail: impl Into<String>) -> Self {
        Self::Transport { adapter, detail: detail.into() }
    }

    pub fn data(adapter: &'static str, detail: impl Into<String>) -> Self {
        Self::Data { adapter, detail: detail.into() }
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;

/// Translate a `reqwest` failure into a typed transport error, without
/// leaking the request URL's query string or any payload.
pub fn map_reqwest_err(adapter: &'static str, err: reqwest::Error) -> MemoryError {
    if err.is_timeout() {
        MemoryError::transport(adapter, "request timed out")
    } else if err.is_connect() {
        MemoryError::transport(adapter, "connection refused")
    } else if let Some(status) = err.status() {
        MemoryError::transport(adapter, format!("non-2xx status {status}"))
    } else {
        MemoryError::transport(adapter, "request failed")
    }
}
