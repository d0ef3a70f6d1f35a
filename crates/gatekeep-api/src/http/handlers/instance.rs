//! Workflow instance handlers: trigger, inspect, cancel.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use uuid::Uuid;

use gatekeep_core::workflow::InstanceDetail;
use gatekeep_types::audit::AuditEntry;
use gatekeep_types::entity::EntityRef;
use gatekeep_types::instance::WorkflowInstance;
use gatekeep_types::template::TriggerEvent;

use crate::http::error::AppError;
use crate::http::extractors::caller::Caller;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// Body of `POST /api/v1/workflows/trigger`.
#[derive(Debug, Deserialize)]
pub struct TriggerBody {
    #[serde(flatten)]
    pub entity: EntityRef,
    pub event: TriggerEvent,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/v1/workflows/trigger - Present an entity event to every matching template.
///
/// Returns the instances that were started, possibly none.
pub async fn trigger_workflow(
    State(state): State<AppState>,
    Caller(user): Caller,
    Json(body): Json<TriggerBody>,
) -> Result<Json<ApiResponse<Vec<WorkflowInstance>>>, AppError> {
    let timer = RequestTimer::start();
    let instances = state
        .engine
        .trigger_workflow(body.entity, body.event, user.id)
        .await?;
    Ok(Json(timer.finish(instances)))
}

/// GET /api/v1/instances/{id} - Instance with its step executions and requests.
pub async fn get_instance(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<InstanceDetail>>, AppError> {
    let timer = RequestTimer::start();
    let detail = state.engine.get_instance(user.id, &id).await?;
    Ok(Json(
        timer
            .finish(detail)
            .with_link("self", &format!("/api/v1/instances/{id}"))
            .with_link("history", &format!("/api/v1/instances/{id}/history")),
    ))
}

/// GET /api/v1/instances/{id}/history - Audit trail of the instance.
pub async fn instance_history(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<AuditEntry>>>, AppError> {
    let timer = RequestTimer::start();
    let entries = state.engine.instance_history(user.id, &id).await?;
    Ok(Json(
        timer
            .finish(entries)
            .with_link("instance", &format!("/api/v1/instances/{id}")),
    ))
}

/// POST /api/v1/instances/{id}/cancel
pub async fn cancel_instance(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> Result<Json<ApiResponse<WorkflowInstance>>, AppError> {
    let timer = RequestTimer::start();
    let reason = body.and_then(|Json(b)| b.reason);
    let instance = state.engine.cancel_instance(&id, user.id, reason).await?;
    Ok(Json(
        timer
            .finish(instance)
            .with_link("self", &format!("/api/v1/instances/{id}")),
    ))
}
