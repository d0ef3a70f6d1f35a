//! Workflow instance and step execution types.
//!
//! A `WorkflowInstance` is one run of a template against one entity. Each
//! activated step produces one or more `StepExecution` records carrying the
//! assignment and, eventually, the decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

use crate::approval::ApprovalDecision;
use crate::entity::EntityType;
use crate::ids::{CompanyId, RoleId, UserId};
use crate::template::StepDefinition;

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// One running (or finished) execution of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub template_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Entity payload frozen at creation time.
    pub entity_snapshot: serde_json::Value,
    pub status: InstanceStatus,
    /// `None` once the instance is completed or cancelled.
    pub current_step_number: Option<u32>,
    /// Step definitions copied from the template at creation. Later template
    /// edits never reach a run that has already started.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    pub triggered_by: UserId,
    pub company_id: CompanyId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Frozen definition of step `number`.
    pub fn step(&self, number: u32) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.step_number == number)
    }
}

/// Lifecycle of an instance. Only `Running` has outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    Cancelled,
    Expired,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Completed => write!(f, "completed"),
            InstanceStatus::Cancelled => write!(f, "cancelled"),
            InstanceStatus::Expired => write!(f, "expired"),
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(InstanceStatus::Running),
            "completed" => Ok(InstanceStatus::Completed),
            "cancelled" => Ok(InstanceStatus::Cancelled),
            "expired" => Ok(InstanceStatus::Expired),
            other => Err(format!("invalid instance status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Step execution
// ---------------------------------------------------------------------------

/// The assignment and decision record of one step within an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_number: u32,
    pub status: StepExecutionStatus,
    /// Resolved user. `None` for role-routed steps where any member may decide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to_user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_role_id: Option<RoleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// Whether the execution is still waiting on a decision.
    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            StepExecutionStatus::Pending
                | StepExecutionStatus::Assigned
                | StepExecutionStatus::MoreInfoRequired
        )
    }
}

/// Status of a single step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Pending,
    Assigned,
    Approved,
    Rejected,
    Skipped,
    Expired,
    MoreInfoRequired,
}

impl fmt::Display for StepExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepExecutionStatus::Pending => "pending",
            StepExecutionStatus::Assigned => "assigned",
            StepExecutionStatus::Approved => "approved",
            StepExecutionStatus::Rejected => "rejected",
            StepExecutionStatus::Skipped => "skipped",
            StepExecutionStatus::Expired => "expired",
            StepExecutionStatus::MoreInfoRequired => "more_info_required",
        };
        f.write_str(s)
    }
}

impl FromStr for StepExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(StepExecutionStatus::Pending),
            "assigned" => Ok(StepExecutionStatus::Assigned),
            "approved" => Ok(StepExecutionStatus::Approved),
            "rejected" => Ok(StepExecutionStatus::Rejected),
            "skipped" => Ok(StepExecutionStatus::Skipped),
            "expired" => Ok(StepExecutionStatus::Expired),
            "more_info_required" => Ok(StepExecutionStatus::MoreInfoRequired),
            other => Err(format!("invalid step execution status: '{other}'")),
        }
    }
}
