//! HTTP API: pipeline control, record inspection, admin operations, and
//! structured-log queries. Every response carries `success` plus either a
//! payload or an error envelope.

pub mod admin;
pub mod logs;
pub mod pipeline;
pub mod records;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// API-level failures mapped onto the HTTP status contract.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// A critical dependency (the datastore) is unreachable.
    Unavailable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "Invalid request", Some(msg)),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "Not found", Some(msg)),
            ApiError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Dependency unavailable",
                Some(msg),
            ),
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "Internal API error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error", None)
            }
        };
        let mut body = json!({"success": false, "error": error});
        if let Some(details) = details {
            body["details"] = json!(details);
        }
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_follow_contract() {
        assert_eq!(
            ApiError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Unavailable("x".into()).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("x"))
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
