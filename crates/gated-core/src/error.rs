//! Shared error type across gated crates.

use thiserror::Error;

/// Client-facing error codes (stable API). The numeric value is the `errno`
/// carried by an `Error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Bad/missing/expired token.
    Unauthorized,
    /// Unknown type, wrong content type for the handshake, malformed frame.
    Protocol,
    /// No topic registered for a module.
    RouterNotFound,
    /// Global overflow or per-IP limit.
    CapacityExceeded,
    /// Uid already bound to a different sid locally.
    DuplicateLogin,
    /// Discovery/broker hiccup; the client should retry.
    Transient,
    /// Message type outside every known module range.
    UnrecognizedType,
    /// Internal server error.
    Internal,
}

impl ErrorCode {
    /// String representation used in text-lane error lines.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Protocol => "PROTOCOL_ERROR",
            ErrorCode::RouterNotFound => "ROUTER_NOT_FOUND",
            ErrorCode::CapacityExceeded => "CAPACITY_EXCEEDED",
            ErrorCode::DuplicateLogin => "DUPLICATE_LOGIN",
            ErrorCode::Transient => "TRANSIENT",
            ErrorCode::UnrecognizedType => "UNRECOGNIZED_TYPE",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Numeric errno for the `Error` frame.
    pub fn errno(self) -> i32 {
        match self {
            ErrorCode::Unauthorized => 1,
            ErrorCode::Protocol => 2,
            ErrorCode::RouterNotFound => 3,
            ErrorCode::CapacityExceeded => 4,
            ErrorCode::DuplicateLogin => 5,
            ErrorCode::Transient => 6,
            ErrorCode::UnrecognizedType => 7,
            ErrorCode::Internal => 8,
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, GateError>;

/// Unified error type used by core and gateway.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("router not found for module: {0}")]
    RouterNotFound(String),
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("duplicated login")]
    DuplicateLogin,
    #[error("transient: {0}")]
    Transient(String),
    #[error("unrecognized message type: {0}")]
    UnrecognizedType(u32),
    #[error("internal: {0}")]
    Internal(String),
}

impl GateError {
    /// Map internal error to a stable client-facing code.
    pub fn code(&self) -> ErrorCode {
        match self {
            GateError::Unauthorized => ErrorCode::Unauthorized,
            GateError::Protocol(_) => ErrorCode::Protocol,
            GateError::RouterNotFound(_) => ErrorCode::RouterNotFound,
            GateError::CapacityExceeded(_) => ErrorCode::CapacityExceeded,
            GateError::DuplicateLogin => ErrorCode::DuplicateLogin,
            GateError::Transient(_) => ErrorCode::Transient,
            GateError::UnrecognizedType(_) => ErrorCode::UnrecognizedType,
            GateError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<std::io::Error> for GateError {
    fn from(e: std::io::Error) -> Self {
        GateError::Internal(format!("io: {e}"))
    }
}
