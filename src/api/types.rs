use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::domain::{Protocol, SessionParameters, SessionStatus};
use crate::error::{ErrorCode, ManmanError};

// ============================================================================
// Session Types
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartSessionBody {
    #[serde(default)]
    pub parameters: SessionParameters,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub restore_backup_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SessionListQuery {
    /// Comma-separated statuses, e.g. `running,stopping`
    pub status: Option<String>,
}

impl SessionListQuery {
    pub fn statuses(&self) -> Result<Option<Vec<SessionStatus>>, ManmanError> {
        let Some(raw) = self.status.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(None);
        };
        raw.split(',')
            .map(|s| SessionStatus::try_from(s.trim()).map_err(ManmanError::InvalidArgument))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendInputBody {
    pub input: String,
    /// `input` is base64 rather than plain text
    #[serde(default)]
    pub base64: bool,
}

impl SendInputBody {
    pub fn bytes(&self) -> Result<Vec<u8>, ManmanError> {
        if self.base64 {
            STANDARD
                .decode(self.input.as_bytes())
                .map_err(|e| ManmanError::InvalidArgument(format!("input is not base64: {e}")))
        } else {
            Ok(self.input.as_bytes().to_vec())
        }
    }
}

// ============================================================================
// Port Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AvailablePortsQuery {
    pub start: u32,
    pub end: u32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    Protocol::Tcp.as_str().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailablePortsResponse {
    pub server_id: i64,
    pub protocol: Protocol,
    pub ports: Vec<u16>,
}

// ============================================================================
// System Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub db: String,
    pub uptime_secs: i64,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::FailedPrecondition => StatusCode::CONFLICT,
        ErrorCode::ResourceExhausted => StatusCode::CONFLICT,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handler error rendered as `{code, message}`
#[derive(Debug)]
pub struct ApiError(pub ManmanError);

impl From<ManmanError> for ApiError {
    fn from(err: ManmanError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        if code == ErrorCode::Internal {
            error!("Request failed: {}", self.0);
        }
        let body = ErrorBody {
            code: code.as_str().to_string(),
            message: self.0.to_string(),
        };
        (status_for(code), Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;
