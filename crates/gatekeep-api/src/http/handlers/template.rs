//! Workflow template handlers for the REST API.

use axum::Json;
use axum::extract::{Path, Query, State};
use uuid::Uuid;

use gatekeep_types::entity::EntityRef;
use gatekeep_types::instance::WorkflowInstance;
use gatekeep_types::template::{TemplateDraft, WorkflowTemplate};

use crate::http::error::AppError;
use crate::http::extractors::caller::Caller;
use crate::http::extractors::query::TemplateListQuery;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// POST /api/v1/templates - Create a template.
pub async fn create_template(
    State(state): State<AppState>,
    Caller(user): Caller,
    Json(draft): Json<TemplateDraft>,
) -> Result<Json<ApiResponse<WorkflowTemplate>>, AppError> {
    let timer = RequestTimer::start();
    let template = state.engine.create_template(user.id, draft).await?;
    let link = format!("/api/v1/templates/{}", template.id);
    Ok(Json(timer.finish(template).with_link("self", &link)))
}

/// GET /api/v1/templates - List the caller's company templates.
pub async fn list_templates(
    State(state): State<AppState>,
    Caller(user): Caller,
    Query(query): Query<TemplateListQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowTemplate>>>, AppError> {
    let timer = RequestTimer::start();
    let filter = query.into_filter()?;
    let templates = state.engine.list_templates(&user.company_id, &filter).await?;
    Ok(Json(timer.finish(templates).with_link("self", "/api/v1/templates")))
}

/// GET /api/v1/templates/{id}
pub async fn get_template(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowTemplate>>, AppError> {
    let timer = RequestTimer::start();
    let template = state.engine.get_template(user.id, &id).await?;
    Ok(Json(
        timer
            .finish(template)
            .with_link("self", &format!("/api/v1/templates/{id}"))
            .with_link("start", &format!("/api/v1/templates/{id}/start")),
    ))
}

/// PUT /api/v1/templates/{id} - Replace a template's definition.
pub async fn update_template(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
    Json(draft): Json<TemplateDraft>,
) -> Result<Json<ApiResponse<WorkflowTemplate>>, AppError> {
    let timer = RequestTimer::start();
    let template = state.engine.update_template(user.id, &id, draft).await?;
    Ok(Json(
        timer
            .finish(template)
            .with_link("self", &format!("/api/v1/templates/{id}")),
    ))
}

/// POST /api/v1/templates/{id}/deactivate
pub async fn deactivate_template(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowTemplate>>, AppError> {
    let timer = RequestTimer::start();
    let template = state.engine.deactivate_template(user.id, &id).await?;
    Ok(Json(
        timer
            .finish(template)
            .with_link("self", &format!("/api/v1/templates/{id}")),
    ))
}

/// POST /api/v1/templates/{id}/start - Start one template against an entity.
pub async fn start_workflow(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
    Json(entity): Json<EntityRef>,
) -> Result<Json<ApiResponse<WorkflowInstance>>, AppError> {
    let timer = RequestTimer::start();
    let instance = state.engine.start_workflow(&id, entity, user.id).await?;
    let link = format!("/api/v1/instances/{}", instance.id);
    Ok(Json(timer.finish(instance).with_link("self", &link)))
}
