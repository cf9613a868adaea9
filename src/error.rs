use std::fmt;
use thiserror::Error;

use crate::domain::Protocol;

/// Main error type for the control plane
#[derive(Error, Debug)]
pub enum ManmanError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Broker errors
    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("Publish failed: {0}")]
    Publish(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Request errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    // Resource errors
    #[error("Port conflict: {0}")]
    PortConflict(PortConflict),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Host agent RPC errors
    #[error("Command {action} timed out after {elapsed_ms}ms")]
    Timeout { action: String, elapsed_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Host agent rejected {action}: {reason}")]
    AgentRejected { action: String, reason: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for ManmanError
pub type Result<T> = std::result::Result<T, ManmanError>;

/// A (server, port, protocol) triple that could not be reserved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConflict {
    pub server_id: i64,
    pub port: u16,
    pub protocol: Protocol,
    /// Session currently holding the triple, when it could be resolved
    pub owner_session_id: Option<i64>,
}

impl fmt::Display for PortConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "port {}/{} on server {} is already allocated",
            self.port, self.protocol, self.server_id
        )?;
        if let Some(owner) = self.owner_session_id {
            write!(f, " to session {}", owner)?;
        }
        Ok(())
    }
}

/// Caller-facing error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArgument,
    FailedPrecondition,
    ResourceExhausted,
    NotFound,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::FailedPrecondition => "failed_precondition",
            ErrorCode::ResourceExhausted => "resource_exhausted",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ManmanError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ManmanError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Classify the error for callers
    pub fn code(&self) -> ErrorCode {
        match self {
            ManmanError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            ManmanError::FailedPrecondition(_) | ManmanError::InvalidStateTransition { .. } => {
                ErrorCode::FailedPrecondition
            }
            ManmanError::PortConflict(_) => ErrorCode::ResourceExhausted,
            ManmanError::NotFound { .. } => ErrorCode::NotFound,
            ManmanError::Timeout { .. } => ErrorCode::Timeout,
            ManmanError::Cancelled => ErrorCode::Cancelled,
            ManmanError::Config(_)
            | ManmanError::Database(_)
            | ManmanError::Migration(_)
            | ManmanError::Broker(_)
            | ManmanError::Publish(_)
            | ManmanError::Json(_)
            | ManmanError::AgentRejected { .. }
            | ManmanError::Io(_)
            | ManmanError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<PortConflict> for ManmanError {
    fn from(conflict: PortConflict) -> Self {
        ManmanError::PortConflict(conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_conflict_maps_to_resource_exhausted() {
        let err: ManmanError = PortConflict {
            server_id: 1,
            port: 25565,
            protocol: Protocol::Tcp,
            owner_session_id: Some(7),
        }
        .into();

        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
        assert_eq!(
            err.to_string(),
            "Port conflict: port 25565/TCP on server 1 is already allocated to session 7"
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ManmanError::not_found("session", 3).code(),
            ErrorCode::NotFound
        );
        assert_eq!(ManmanError::Cancelled.code(), ErrorCode::Cancelled);
        assert_eq!(
            ManmanError::AgentRejected {
                action: "send_input".into(),
                reason: "no stdin".into()
            }
            .code(),
            ErrorCode::Internal
        );
        assert_eq!(ErrorCode::FailedPrecondition.as_str(), "failed_precondition");
    }
}
