//! 요청 처리 중 발생하는 에러: 종류별로 적절한 HTTP 상태 코드로 매핑됩니다.

use crate::bus::BusError;
use crate::transaction::TransactionError;
use axum::http::StatusCode;
use std::path::PathBuf;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("path '{}' is not under any allowed directory", .0.display())]
    PathNotAllowed(PathBuf),

    #[error("config write failed: {0}")]
    Io(#[source] TransactionError),

    #[error("no response for nginx {nginx_id} within {}s", .timeout.as_secs())]
    Timeout { nginx_id: String, timeout: Duration },

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("message bus unavailable: {0}")]
    Bus(#[from] BusError),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl From<TransactionError> for AgentError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::PathNotAllowed(path) => Self::PathNotAllowed(path),
            other => Self::Io(other),
        }
    }
}

impl AgentError {
    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PathNotAllowed(_) => StatusCode::FORBIDDEN,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::Bus(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::PathNotAllowed(_) => "PATH_NOT_ALLOWED",
            Self::Io(_) => "IO_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::MalformedRequest(_) => "MALFORMED_REQUEST",
            Self::Bus(_) => "BUS_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl axum::response::IntoResponse for AgentError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
