use thiserror::Error;

use crate::api::types::ErrorInfo;
use crate::session::SessionState;

/// Errors raised by the bridge.
///
/// Structural problems with engine responses are raised immediately. Business
/// failures reported by the engine normally travel as
/// [`Outcome::Failure`](crate::api::types::Outcome) data and only become
/// [`BridgeError::EngineReportedFailure`] when a caller opts into fail-fast.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed response: `{field}` {reason}")]
    MalformedResponse { field: String, reason: String },
    #[error("no decodable payload in `{0}` response")]
    UnsupportedPayloadType(String),
    #[error("engine reported failure {}: {}", .0.code, .0.message)]
    EngineReportedFailure(ErrorInfo),
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("engine worker unavailable")]
    WorkerUnavailable,
    #[error("engine worker dropped the reply channel")]
    ChannelClosed,
    #[error("deadline of {timeout_ms}ms exceeded")]
    DeadlineExceeded { timeout_ms: u64 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    pub(crate) fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::MalformedResponse {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
