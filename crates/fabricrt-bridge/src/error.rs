//! Error domain for the HTTP-to-messaging bridge.

#[derive(Debug, thiserror::Error, Clone)]
pub enum BridgeError {
    /// Surfaced for both registry timeouts and explicit cancellation
    /// (spec.md §7: "Timeout... surfaced to waiter as OperationAborted").
    #[error("operation aborted: {reason}")]
    Aborted { reason: &'static str },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::Aborted { .. } => 504,
            BridgeError::PermissionDenied(_) => 401,
            BridgeError::Protocol(_) => 502,
            BridgeError::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Aborted { .. } => "operation_aborted",
            BridgeError::PermissionDenied(_) => "permission_denied",
            BridgeError::Protocol(_) => "protocol_error",
            BridgeError::Internal(_) => "internal_error",
        }
    }
}
