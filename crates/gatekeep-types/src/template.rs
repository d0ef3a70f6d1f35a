//! Workflow template types.
//!
//! A `WorkflowTemplate` is the reusable definition of an approval process for
//! one entity type: an ordered list of numbered steps, each routed to a user or
//! to every member of a role, plus the trigger that decides when a new
//! instance is started.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

use crate::approval::Priority;
use crate::entity::EntityType;
use crate::ids::{CompanyId, RoleId, UserId};

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// A reusable, ordered approval process for one kind of business object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// UUIDv7 assigned on creation.
    pub id: Uuid,
    /// Owning tenant. Every read and write is scoped by this.
    pub company_id: CompanyId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub entity_type: EntityType,
    pub trigger_type: TriggerType,
    /// Optional predicate over the entity data; `None` matches everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_conditions: Option<TriggerCondition>,
    pub is_active: bool,
    /// Steps ordered by `step_number` (1-based, contiguous).
    pub steps: Vec<StepDefinition>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowTemplate {
    /// Look up a step by its number.
    pub fn step(&self, step_number: u32) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    /// Highest step number in the template (0 when there are no steps).
    pub fn last_step_number(&self) -> u32 {
        self.steps.iter().map(|s| s.step_number).max().unwrap_or(0)
    }
}

/// Payload for creating or replacing a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub entity_type: EntityType,
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_conditions: Option<TriggerCondition>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// When a template is considered for instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Only started explicitly by a user.
    #[default]
    Manual,
    /// Started when the entity is created.
    OnCreate,
    /// Started when the entity is updated.
    OnUpdate,
    /// Started on create or update whenever the conditions hold
    /// (e.g. `total > 10000`).
    Threshold,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerType::Manual => write!(f, "manual"),
            TriggerType::OnCreate => write!(f, "on_create"),
            TriggerType::OnUpdate => write!(f, "on_update"),
            TriggerType::Threshold => write!(f, "threshold"),
        }
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(TriggerType::Manual),
            "on_create" => Ok(TriggerType::OnCreate),
            "on_update" => Ok(TriggerType::OnUpdate),
            "threshold" => Ok(TriggerType::Threshold),
            other => Err(format!("invalid trigger type: '{other}'")),
        }
    }
}

/// The business event presented to the template model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    Manual,
    Created,
    Updated,
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerEvent::Manual => write!(f, "manual"),
            TriggerEvent::Created => write!(f, "created"),
            TriggerEvent::Updated => write!(f, "updated"),
        }
    }
}

/// Predicate tree evaluated against the entity data.
///
/// ```json
/// {"all": [
///   {"field": "total", "op": "gt", "value": 10000},
///   {"any": [
///     {"field": "currency", "op": "eq", "value": "USD"},
///     {"field": "supplier.tier", "op": "in", "value": ["new", "probation"]}
///   ]}
/// ]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriggerCondition {
    All {
        all: Vec<TriggerCondition>,
    },
    Any {
        any: Vec<TriggerCondition>,
    },
    Not {
        not: Box<TriggerCondition>,
    },
    Compare {
        /// Dot-separated path into the entity data (e.g. `supplier.tier`).
        field: String,
        op: CompareOp,
        #[serde(default)]
        value: serde_json::Value,
    },
}

impl TriggerCondition {
    pub fn compare(
        field: impl Into<String>,
        op: CompareOp,
        value: serde_json::Value,
    ) -> Self {
        TriggerCondition::Compare {
            field: field.into(),
            op,
            value,
        }
    }
}

/// Comparison operators for trigger conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Field value is one of the array `value`.
    In,
    /// String field contains `value`, or array field contains `value`.
    Contains,
    /// Field is present and not null (`value` ignored).
    Exists,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// One numbered step of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// 1-based position. Unique and contiguous within a template.
    pub step_number: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub assignee_type: AssigneeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_role_id: Option<RoleId>,
    /// A rejected or unassignable optional step does not stop the workflow.
    #[serde(default = "default_true")]
    pub is_required: bool,
    /// Hours after activation before the external sweep may expire the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_hours: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl StepDefinition {
    /// Whether every resolved assignee must decide (derived from the type).
    pub fn allow_parallel(&self) -> bool {
        self.step_type == StepType::ParallelApproval
    }

    /// Whether the step waits on a human decision.
    pub fn requires_decision(&self) -> bool {
        self.step_type != StepType::Notification
    }
}

/// The kind of step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// A single decision by the assignee (or any member of the role).
    Approval,
    /// Every resolved assignee must approve.
    ParallelApproval,
    /// A single decision; kept distinct for authoring clarity.
    SequentialApproval,
    /// Informs the assignees and completes immediately.
    Notification,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepType::Approval => write!(f, "approval"),
            StepType::ParallelApproval => write!(f, "parallel_approval"),
            StepType::SequentialApproval => write!(f, "sequential_approval"),
            StepType::Notification => write!(f, "notification"),
        }
    }
}

/// How a step's assignee is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeType {
    User,
    Role,
}

impl fmt::Display for AssigneeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssigneeType::User => write!(f, "user"),
            AssigneeType::Role => write!(f, "role"),
        }
    }
}
