use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use super::RequestBridge;
use crate::error::AgentError;

/// 업로드 multipart 필드 이름
const UPLOAD_FIELD: &str = "file";

/// GET /nginx - 실행 중인 인스턴스 목록 (없으면 빈 배열)
pub async fn list_instances(State(bridge): State<Arc<RequestBridge>>) -> impl IntoResponse {
    let instances = bridge.instances().await;
    (StatusCode::OK, Json(instances))
}

/// PUT /nginx/config - 업로드된 설정을 모든 인스턴스에 적용
pub async fn apply_config(
    State(bridge): State<Arc<RequestBridge>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let contents = match read_upload(multipart).await {
        Ok(contents) => contents,
        Err(e) => {
            tracing::error!("Can't read form file: {}", e);
            return e.into_response();
        }
    };
    tracing::info!("Received config upload ({} bytes)", contents.len());

    match bridge.apply(&contents).await {
        Ok(results) => (StatusCode::OK, Json(results)).into_response(),
        Err(failure) => failure.into_response(),
    }
}

async fn read_upload(multipart: Result<Multipart, MultipartRejection>) -> Result<Vec<u8>, AgentError> {
    let mut multipart = multipart.map_err(|e| AgentError::MalformedRequest(e.body_text()))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AgentError::MalformedRequest(e.body_text()))?
    {
        if field.name() == Some(UPLOAD_FIELD) {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| AgentError::MalformedRequest(e.body_text()))?;
            return Ok(bytes.to_vec());
        }
    }

    Err(AgentError::MalformedRequest(format!("missing '{}' field", UPLOAD_FIELD)))
}

pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}
