//! Connector errors.

use thiserror::Error;

/// Failures reported by a connector while talking to a target system.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    /// Could not connect.
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    /// Connection or request timed out.
    #[error("Connection timed out after {timeout_secs}s")]
    ConnectionTimeout { timeout_secs: u64 },

    /// Target temporarily unavailable.
    #[error("Target system unavailable: {message}")]
    TargetUnavailable { message: String },

    /// Network-level failure.
    #[error("Network error: {message}")]
    NetworkError { message: String },

    /// Credentials rejected by the target.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Operation not permitted on the target.
    #[error("Not authorized to {operation}")]
    AuthorizationFailed { operation: String },

    /// Object already exists on the target.
    #[error("Object already exists: {identifier}")]
    ObjectAlreadyExists { identifier: String },

    /// Object missing on the target.
    #[error("Object not found: {identifier}")]
    ObjectNotFound { identifier: String },

    /// Target rejected the values.
    #[error("Constraint violation: {message}")]
    ConstraintViolation { message: String },

    /// Connector configuration is unusable.
    #[error("Invalid connector configuration: {message}")]
    InvalidConfiguration { message: String },

    /// Any other failure of the operation.
    #[error("Operation failed: {message}")]
    OperationFailed { message: String },
}

/// Result alias for connector calls.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

impl ConnectorError {
    /// Whether the failure is caused by a temporary condition.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::ConnectionFailed { .. }
                | ConnectorError::ConnectionTimeout { .. }
                | ConnectorError::TargetUnavailable { .. }
                | ConnectorError::NetworkError { .. }
        )
    }

    /// Stable classification code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectorError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            ConnectorError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            ConnectorError::TargetUnavailable { .. } => "TARGET_UNAVAILABLE",
            ConnectorError::NetworkError { .. } => "NETWORK_ERROR",
            ConnectorError::AuthenticationFailed => "AUTH_FAILED",
            ConnectorError::AuthorizationFailed { .. } => "AUTHORIZATION_FAILED",
            ConnectorError::ObjectAlreadyExists { .. } => "OBJECT_EXISTS",
            ConnectorError::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            ConnectorError::ConstraintViolation { .. } => "CONSTRAINT_VIOLATION",
            ConnectorError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            ConnectorError::OperationFailed { .. } => "OPERATION_FAILED",
        }
    }
}
