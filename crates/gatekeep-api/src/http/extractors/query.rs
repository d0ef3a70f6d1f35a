//! Query parameter extractors for list endpoints.

use serde::Deserialize;

use gatekeep_core::repository::workflow::TemplateFilter;
use gatekeep_types::approval::{ApprovalFilter, ApprovalStatus, Priority};
use gatekeep_types::entity::EntityType;
use gatekeep_types::ids::{RoleId, UserId};
use uuid::Uuid;

use crate::http::error::AppError;

/// Query parameters for the approval request list endpoint.
///
/// Values arrive as strings so a bad value yields a precise 400 instead of
/// axum's generic query rejection.
#[derive(Debug, Deserialize, Default)]
pub struct ApprovalListQuery {
    /// pending, in_review, more_info_required, approved, rejected, expired.
    pub status: Option<String>,
    pub assigned_to: Option<String>,
    pub assigned_role: Option<String>,
    pub entity_type: Option<String>,
    pub priority: Option<String>,
    pub workflow_instance_id: Option<String>,
    pub limit: Option<u32>,
}

impl ApprovalListQuery {
    pub fn into_filter(self) -> Result<ApprovalFilter, AppError> {
        Ok(ApprovalFilter {
            status: parse_opt::<ApprovalStatus>(self.status)?,
            assigned_to: parse_id::<UserId>("assigned_to", self.assigned_to)?,
            assigned_role: parse_id::<RoleId>("assigned_role", self.assigned_role)?,
            entity_type: parse_opt::<EntityType>(self.entity_type)?,
            priority: parse_opt::<Priority>(self.priority)?,
            workflow_instance_id: parse_id::<Uuid>("workflow_instance_id", self.workflow_instance_id)?,
            limit: self.limit,
        })
    }
}

/// Query parameters for the template list endpoint.
#[derive(Debug, Deserialize, Default)]
pub struct TemplateListQuery {
    pub entity_type: Option<String>,
    #[serde(default)]
    pub active_only: bool,
}

impl TemplateListQuery {
    pub fn into_filter(self) -> Result<TemplateFilter, AppError> {
        Ok(TemplateFilter {
            entity_type: parse_opt::<EntityType>(self.entity_type)?,
            active_only: self.active_only,
        })
    }
}

/// Parse enums whose `FromStr` already produces a readable message.
fn parse_opt<T>(value: Option<String>) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .filter(|v| !v.is_empty())
        .map(|v| v.parse::<T>().map_err(AppError::BadRequest))
        .transpose()
}

fn parse_id<T: std::str::FromStr>(field: &str, value: Option<String>) -> Result<Option<T>, AppError> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| AppError::BadRequest(format!("{field}: '{v}' is not a valid id")))
        })
        .transpose()
}
