use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Machine-readable JSON-RPC error codes.
///
/// The five standard codes come from the JSON-RPC 2.0 specification. The
/// framework reserves three additional codes inside the implementation-defined
/// server range for conditions it raises itself; everything else is
/// application-defined and carried through as [`ErrorCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed JSON was received on the wire.
    Parse,
    /// Well-formed JSON that is not a valid request object.
    InvalidRequest,
    /// The requested method is not known to the assigner.
    MethodNotFound,
    /// Parameters could not be decoded or have the wrong arity.
    InvalidParams,
    /// An unexpected server-side failure.
    Internal,
    /// A transport-layer failure reported by the channel.
    SystemError,
    /// The request context was cancelled before completion.
    Cancelled,
    /// The request context deadline expired before completion.
    DeadlineExceeded,
    /// An application-defined code returned by a handler.
    Other(i32),
}

impl ErrorCode {
    pub const fn code(self) -> i32 {
        match self {
            ErrorCode::Parse => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::Internal => -32603,
            ErrorCode::SystemError => -32098,
            ErrorCode::Cancelled => -32097,
            ErrorCode::DeadlineExceeded => -32096,
            ErrorCode::Other(code) => code,
        }
    }

    pub fn from_code(code: i32) -> ErrorCode {
        match code {
            -32700 => ErrorCode::Parse,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::Internal,
            -32098 => ErrorCode::SystemError,
            -32097 => ErrorCode::Cancelled,
            -32096 => ErrorCode::DeadlineExceeded,
            code => ErrorCode::Other(code),
        }
    }

    /// The default human-readable message for this code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Parse => "parse error",
            ErrorCode::InvalidRequest => "invalid request",
            ErrorCode::MethodNotFound => "method not found",
            ErrorCode::InvalidParams => "invalid parameters",
            ErrorCode::Internal => "internal error",
            ErrorCode::SystemError => "system error",
            ErrorCode::Cancelled => "request cancelled",
            ErrorCode::DeadlineExceeded => "deadline exceeded",
            ErrorCode::Other(_) => "server error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

/// The wire-level JSON-RPC error object carried inside an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// A copy of this error whose `data` field carries the JSON encoding of
    /// `v`. If encoding fails the error is returned unmodified.
    pub fn with_data<T: Serialize>(mut self, v: &T) -> Self {
        if let Ok(data) = serde_json::to_value(v) {
            self.data = Some(data);
        }
        self
    }

    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Parse, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("method not found: {}", method),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeadlineExceeded, message)
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorObject {}

/// Errors surfaced by the client and server engines.
///
/// Request-level failures reported by a server keep their code, message and
/// ancillary data in [`RpcError::Server`]. Cancellation and deadline expiry
/// are mapped onto their own variants so callers can match on them without
/// inspecting codes.
#[derive(Debug, Error)]
pub enum RpcError {
    /// A typed error response from the server.
    #[error("{0}")]
    Server(ErrorObject),

    /// The caller's context was cancelled before a response arrived.
    #[error("request cancelled")]
    Cancelled,

    /// The caller's deadline expired before a response arrived.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A request was rejected locally before any bytes were sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An empty batch was submitted.
    #[error("empty request batch")]
    EmptyBatch,

    /// The engine was already shut down.
    #[error("{0} has been stopped")]
    Stopped(&'static str),

    /// Server-to-client notifications are not enabled on this server.
    #[error("server notifications are not enabled")]
    NotifyUnsupported,

    /// A transport-layer failure reported by the channel.
    #[error("channel error: {0}")]
    Channel(#[from] io::Error),

    /// A JSON encoding or decoding failure on a local value.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// Fold a wire error object into the caller-visible form, mapping the
    /// cancellation and deadline codes onto their sentinels.
    pub fn from_error_object(err: ErrorObject) -> Self {
        match err.error_code() {
            ErrorCode::Cancelled => RpcError::Cancelled,
            ErrorCode::DeadlineExceeded => RpcError::DeadlineExceeded,
            _ => RpcError::Server(err),
        }
    }

    /// The server-reported error object, if this is a server error.
    pub fn as_error_object(&self) -> Option<&ErrorObject> {
        match self {
            RpcError::Server(err) => Some(err),
            _ => None,
        }
    }
}
