use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use recap_infra::jobs::JobControlError;

pub fn control_error_to_response(err: JobControlError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        JobControlError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        JobControlError::RecordNotFound { .. } => {
            json_error(StatusCode::NOT_FOUND, "record_not_found", message)
        }
        JobControlError::NotCancellable { .. } => {
            json_error(StatusCode::CONFLICT, "not_cancellable", message)
        }
        JobControlError::NotResumable { .. } => {
            json_error(StatusCode::CONFLICT, "not_resumable", message)
        }
        JobControlError::Conflict { .. } => json_error(StatusCode::CONFLICT, "conflict", message),
        JobControlError::InvalidConfig(_) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", message)
        }
        JobControlError::Timeout(_) => json_error(StatusCode::GATEWAY_TIMEOUT, "timeout", message),
        JobControlError::Storage(_) => {
            tracing::error!(error = %message, "storage failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", message)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse a path or body identifier, answering 400 on garbage.
pub fn parse_id<T>(raw: &str) -> Result<T, axum::response::Response>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}
