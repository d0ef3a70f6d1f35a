//! Approval request handlers: queues, decisions and comments.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use uuid::Uuid;

use gatekeep_core::workflow::{BulkItemResult, parse_bulk_action};
use gatekeep_types::approval::{ApprovalComment, ApprovalRequest, ApprovalStats, ReviewSubmission};

use crate::http::error::AppError;
use crate::http::extractors::caller::Caller;
use crate::http::extractors::query::ApprovalListQuery;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// Body of `POST /api/v1/approvals/bulk`.
#[derive(Debug, Deserialize)]
pub struct BulkBody {
    pub approval_ids: Vec<Uuid>,
    /// approved, rejected or reopen.
    pub action: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommentBody {
    pub comment: String,
    #[serde(default)]
    pub is_internal: bool,
}

/// GET /api/v1/approvals - The caller's company requests, newest first.
pub async fn list_approvals(
    State(state): State<AppState>,
    Caller(user): Caller,
    Query(query): Query<ApprovalListQuery>,
) -> Result<Json<ApiResponse<Vec<ApprovalRequest>>>, AppError> {
    let timer = RequestTimer::start();
    let filter = query.into_filter()?;
    let requests = state
        .engine
        .get_approval_requests(&user.company_id, &filter)
        .await?;
    Ok(Json(
        timer
            .finish(requests)
            .with_link("self", "/api/v1/approvals")
            .with_link("stats", "/api/v1/approvals/stats"),
    ))
}

/// GET /api/v1/approvals/stats - Request counts per status.
pub async fn approval_stats(
    State(state): State<AppState>,
    Caller(user): Caller,
) -> Result<Json<ApiResponse<ApprovalStats>>, AppError> {
    let timer = RequestTimer::start();
    let stats = state.engine.get_approval_stats(&user.company_id).await?;
    Ok(Json(timer.finish(stats)))
}

/// GET /api/v1/approvals/{id}
pub async fn get_approval(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ApprovalRequest>>, AppError> {
    let timer = RequestTimer::start();
    let request = state.engine.get_approval_request(user.id, &id).await?;
    Ok(Json(with_request_links(timer.finish(request), id)))
}

/// POST /api/v1/approvals/{id}/review - Submit a decision.
pub async fn review(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
    Json(submission): Json<ReviewSubmission>,
) -> Result<Json<ApiResponse<ApprovalRequest>>, AppError> {
    let timer = RequestTimer::start();
    let request = state.engine.review(&id, user.id, submission).await?;
    Ok(Json(with_request_links(timer.finish(request), id)))
}

/// POST /api/v1/approvals/{id}/start-review
pub async fn start_review(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ApprovalRequest>>, AppError> {
    let timer = RequestTimer::start();
    let request = state.engine.start_review(&id, user.id).await?;
    Ok(Json(with_request_links(timer.finish(request), id)))
}

/// POST /api/v1/approvals/{id}/reopen
pub async fn reopen(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ApprovalRequest>>, AppError> {
    let timer = RequestTimer::start();
    let request = state.engine.reopen(&id, user.id).await?;
    Ok(Json(with_request_links(timer.finish(request), id)))
}

/// POST /api/v1/approvals/bulk - One action over many requests.
///
/// An unknown action fails the whole call; per-request failures are
/// reported in their slot.
pub async fn bulk_action(
    State(state): State<AppState>,
    Caller(user): Caller,
    Json(body): Json<BulkBody>,
) -> Result<Json<ApiResponse<Vec<BulkItemResult>>>, AppError> {
    let timer = RequestTimer::start();
    let action = parse_bulk_action(&body.action)?;
    let results = state
        .engine
        .bulk_action(&body.approval_ids, user.id, action, body.reason)
        .await;
    Ok(Json(timer.finish(results)))
}

/// GET /api/v1/approvals/{id}/comments
pub async fn list_comments(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<ApprovalComment>>>, AppError> {
    let timer = RequestTimer::start();
    let comments = state.engine.list_comments(&id, user.id).await?;
    Ok(Json(
        timer
            .finish(comments)
            .with_link("approval", &format!("/api/v1/approvals/{id}")),
    ))
}

/// POST /api/v1/approvals/{id}/comments
pub async fn add_comment(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
    Json(body): Json<CommentBody>,
) -> Result<Json<ApiResponse<ApprovalComment>>, AppError> {
    let timer = RequestTimer::start();
    let comment = state
        .engine
        .add_comment(&id, user.id, &body.comment, body.is_internal)
        .await?;
    Ok(Json(
        timer
            .finish(comment)
            .with_link("approval", &format!("/api/v1/approvals/{id}")),
    ))
}

fn with_request_links<T: serde::Serialize>(resp: ApiResponse<T>, id: Uuid) -> ApiResponse<T> {
    resp.with_link("self", &format!("/api/v1/approvals/{id}"))
        .with_link("comments", &format!("/api/v1/approvals/{id}/comments"))
        .with_link("review", &format!("/api/v1/approvals/{id}/review"))
}
