//! Error types for the gateway.

use std::io;

use thiserror::Error;

/// A backend stream could not be produced for a target.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The pool has no backends at all.
    #[error("no backends configured")]
    NoBackends,

    /// TCP connect or upstream I/O failed.
    #[error("backend {backend}: {source}")]
    Io {
        backend: String,
        #[source]
        source: io::Error,
    },

    /// Connect plus handshake did not finish in time.
    #[error("backend {backend}: connect timed out after {timeout_ms}ms")]
    Timeout { backend: String, timeout_ms: u64 },

    /// The backend answered but refused the request.
    #[error("backend {backend}: handshake rejected: {reason}")]
    Rejected { backend: String, reason: String },
}

impl ConnectError {
    /// Short machine-readable code for logs and stats.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConnectError::NoBackends => "no_backends",
            ConnectError::Io { .. } => "io_error",
            ConnectError::Timeout { .. } => "timeout",
            ConnectError::Rejected { .. } => "rejected",
        }
    }
}

/// Failure of a whole proxy orchestration.
///
/// Only a failed backend connect surfaces here; anything that goes wrong
/// while relaying just ends that direction early.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] ConnectError),
}
