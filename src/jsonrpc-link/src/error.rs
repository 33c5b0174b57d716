//! Failure kinds surfaced to callers.

use crate::message::ErrorBody;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type RpcResult<T> = Result<T, RpcError>;

/// Why a call did not produce a result.
///
/// Only [`RpcError::Remote`] originates from the peer; every other variant is
/// decided locally and is never written to the wire.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    /// The peer answered with an error object.
    #[error("remote error: {0}")]
    Remote(ErrorBody),

    #[error("failed to connect to {target}: {message}")]
    Connect { target: String, message: String },

    #[error("request queue is full ({depth} pending)")]
    QueueBusy { depth: usize },

    #[error("request was not sent within {0:?}")]
    QueueTimeout(Duration),

    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),

    /// The session was closed while the request was queued or in flight.
    #[error("request cancelled: session closed")]
    Cancelled,

    /// The session is closed and cannot reconnect.
    #[error("session is closed")]
    Closed,

    #[error("no connection with id {0}")]
    UnknownConnection(u64),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl RpcError {
    pub fn connect(target: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Connect {
            target: target.into(),
            message: err.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::QueueTimeout(_) | Self::ResponseTimeout(_))
    }

    /// Wire code when the failure came from the peer.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Remote(body) => Some(body.code.as_i32()),
            _ => None,
        }
    }
}

impl From<ErrorBody> for RpcError {
    fn from(body: ErrorBody) -> Self {
        Self::Remote(body)
    }
}

/// Flattened failure handed out by bound callers and the pool's one-shot
/// `call`, for code that wants a value instead of an error to propagate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    pub error: String,
}

impl From<RpcError> for ErrorReply {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote(body) => Self {
                code: Some(body.code.as_i32()),
                error: body.message,
            },
            other => Self {
                code: None,
                error: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_errors_keep_their_code() {
        let reply = ErrorReply::from(RpcError::Remote(ErrorBody::method_not_found()));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"code": -32601, "error": "Method not found"})
        );
    }

    #[test]
    fn local_errors_have_no_code() {
        let reply = ErrorReply::from(RpcError::Cancelled);
        assert_eq!(reply.code, None);
        assert_eq!(reply.error, "request cancelled: session closed");
        assert!(RpcError::ResponseTimeout(Duration::from_secs(3)).is_timeout());
    }
}
