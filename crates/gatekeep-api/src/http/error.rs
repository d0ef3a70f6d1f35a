//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use gatekeep_types::error::{ApprovalError, RepositoryError};

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Engine errors.
    Approval(ApprovalError),
    /// Missing or unknown caller identity.
    Unauthorized(String),
    /// Malformed request input (bad query values, unparseable ids).
    BadRequest(String),
    Internal(String),
}

impl From<ApprovalError> for AppError {
    fn from(e: ApprovalError) -> Self {
        AppError::Approval(e)
    }
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        AppError::Approval(e.into())
    }
}

impl AppError {
    /// Status code plus one `(code, message)` pair per reported error.
    fn parts(&self) -> (StatusCode, Vec<(&'static str, String)>) {
        match self {
            AppError::Approval(ApprovalError::Validation(e)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                e.violations
                    .iter()
                    .map(|v| ("VALIDATION_ERROR", v.clone()))
                    .collect(),
            ),
            AppError::Approval(ApprovalError::NotFound) => (
                StatusCode::NOT_FOUND,
                vec![("NOT_FOUND", "Not found".to_string())],
            ),
            AppError::Approval(ApprovalError::AlreadyResolved) => (
                StatusCode::CONFLICT,
                vec![(
                    "ALREADY_RESOLVED",
                    "This approval request was already resolved".to_string(),
                )],
            ),
            AppError::Approval(e @ ApprovalError::Forbidden(_)) => {
                (StatusCode::FORBIDDEN, vec![("FORBIDDEN", e.to_string())])
            }
            AppError::Approval(e @ ApprovalError::AssigneeInvalid(_)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                vec![("ASSIGNEE_INVALID", e.to_string())],
            ),
            AppError::Approval(e @ ApprovalError::NoEligibleAssignee(_)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                vec![("NO_ELIGIBLE_ASSIGNEE", e.to_string())],
            ),
            AppError::Approval(e @ ApprovalError::InvalidTransition(_)) => (
                StatusCode::CONFLICT,
                vec![("INVALID_TRANSITION", e.to_string())],
            ),
            AppError::Approval(e @ ApprovalError::UnsupportedDecision(_)) => (
                StatusCode::BAD_REQUEST,
                vec![("UNSUPPORTED_DECISION", e.to_string())],
            ),
            AppError::Approval(ApprovalError::Storage(msg)) => {
                tracing::error!(error = %msg, "storage failure while handling request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    vec![("STORAGE_ERROR", "Storage failure".to_string())],
                )
            }
            AppError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, vec![("UNAUTHORIZED", msg.clone())])
            }
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, vec![("BAD_REQUEST", msg.clone())])
            }
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                vec![("INTERNAL_ERROR", msg.clone())],
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, errors) = self.parts();

        let body = json!({
            "data": null,
            "meta": {
                "request_id": uuid::Uuid::now_v7().to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "response_time_ms": 0
            },
            "errors": errors
                .into_iter()
                .map(|(code, message)| json!({"code": code, "message": message}))
                .collect::<Vec<_>>(),
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
