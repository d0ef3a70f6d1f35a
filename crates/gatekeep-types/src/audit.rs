//! Audit trail types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

use crate::ids::{CompanyId, UserId};

/// One immutable record of a transition or decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub company_id: CompanyId,
    /// What kind of record changed (`workflow_instance`, `approval_request`, ...).
    pub entity_type: String,
    pub entity_id: String,
    pub action: AuditAction,
    /// `None` for system-driven transitions such as expiry sweeps.
    pub actor_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_state: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_state: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        company_id: CompanyId,
        entity_type: impl Into<String>,
        entity_id: impl ToString,
        action: AuditAction,
        actor_id: Option<UserId>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            company_id,
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
            action,
            actor_id,
            before_state: None,
            after_state: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_states(
        mut self,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Self {
        self.before_state = before;
        self.after_state = after;
        self
    }
}

/// Actions recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    TemplateCreated,
    TemplateUpdated,
    TemplateDeactivated,
    InstanceCreated,
    StepActivated,
    StepSkipped,
    StepCompleted,
    StepRejected,
    StepReassigned,
    DecisionRecorded,
    RequestReopened,
    CommentAdded,
    InstanceCompleted,
    InstanceCancelled,
    InstanceExpired,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::TemplateCreated => "template_created",
            AuditAction::TemplateUpdated => "template_updated",
            AuditAction::TemplateDeactivated => "template_deactivated",
            AuditAction::InstanceCreated => "instance_created",
            AuditAction::StepActivated => "step_activated",
            AuditAction::StepSkipped => "step_skipped",
            AuditAction::StepCompleted => "step_completed",
            AuditAction::StepRejected => "step_rejected",
            AuditAction::StepReassigned => "step_reassigned",
            AuditAction::DecisionRecorded => "decision_recorded",
            AuditAction::RequestReopened => "request_reopened",
            AuditAction::CommentAdded => "comment_added",
            AuditAction::InstanceCompleted => "instance_completed",
            AuditAction::InstanceCancelled => "instance_cancelled",
            AuditAction::InstanceExpired => "instance_expired",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("invalid audit action: '{s}'"))
    }
}
