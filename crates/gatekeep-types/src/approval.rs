//! Reviewer-facing approval types.
//!
//! An `ApprovalRequest` is the projection of one open step execution that a
//! reviewer sees in their inbox. Comments hang off requests and are
//! append-only.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

use crate::entity::EntityType;
use crate::ids::{CompanyId, RoleId, UserId};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub workflow_instance_id: Uuid,
    pub step_execution_id: Uuid,
    pub step_number: u32,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Kind of request (e.g. `purchase_order_approval`).
    pub request_type: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_role: Option<RoleId>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<UserId>,
    /// The user who triggered the owning workflow instance.
    pub requested_by: UserId,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub company_id: CompanyId,
}

impl ApprovalRequest {
    /// Whether the request still accepts a decision.
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

/// Status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    InReview,
    MoreInfoRequired,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ApprovalStatus::Pending | ApprovalStatus::InReview | ApprovalStatus::MoreInfoRequired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::InReview => "in_review",
            ApprovalStatus::MoreInfoRequired => "more_info_required",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ApprovalStatus::Pending),
            "in_review" => Ok(ApprovalStatus::InReview),
            "more_info_required" => Ok(ApprovalStatus::MoreInfoRequired),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            "expired" => Ok(ApprovalStatus::Expired),
            other => Err(format!("invalid approval status: '{other}'")),
        }
    }
}

/// Decision vocabulary accepted by the per-request review endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    MoreInfoRequired,
    Escalated,
    Delegated,
    ConditionalApproval,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Rejected => "rejected",
            ApprovalDecision::MoreInfoRequired => "more_info_required",
            ApprovalDecision::Escalated => "escalated",
            ApprovalDecision::Delegated => "delegated",
            ApprovalDecision::ConditionalApproval => "conditional_approval",
        }
    }

    /// Decisions that hand the request to another user instead of deciding it.
    pub fn is_reassignment(&self) -> bool {
        matches!(self, ApprovalDecision::Escalated | ApprovalDecision::Delegated)
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approved" => Ok(ApprovalDecision::Approved),
            "rejected" => Ok(ApprovalDecision::Rejected),
            "more_info_required" => Ok(ApprovalDecision::MoreInfoRequired),
            "escalated" => Ok(ApprovalDecision::Escalated),
            "delegated" => Ok(ApprovalDecision::Delegated),
            "conditional_approval" => Ok(ApprovalDecision::ConditionalApproval),
            other => Err(format!("invalid decision: '{other}'")),
        }
    }
}

/// Restricted vocabulary of the bulk-action endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    Approved,
    Rejected,
    /// Put a `more_info_required` request back into the reviewer's queue.
    Reopen,
}

/// Urgency of a request, used for inbox ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("invalid priority: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Review input
// ---------------------------------------------------------------------------

/// A reviewer's submission for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSubmission {
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub reason: Option<String>,
    /// Free-text notes recorded as a comment on the request.
    #[serde(default)]
    pub notes: Option<String>,
    /// Target user for `escalated` / `delegated`.
    #[serde(default)]
    pub delegate_to: Option<UserId>,
}

impl ReviewSubmission {
    pub fn new(decision: ApprovalDecision) -> Self {
        Self {
            decision,
            reason: None,
            notes: None,
            delegate_to: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Comments
// ---------------------------------------------------------------------------

/// Append-only note on an approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalComment {
    pub id: Uuid,
    pub approval_request_id: Uuid,
    pub author_id: UserId,
    pub comment: String,
    /// Internal comments are hidden from users outside the approval chain.
    pub is_internal: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Filters for listing approval requests within a company.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalFilter {
    #[serde(default)]
    pub status: Option<ApprovalStatus>,
    #[serde(default)]
    pub assigned_to: Option<UserId>,
    #[serde(default)]
    pub assigned_role: Option<RoleId>,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub workflow_instance_id: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Basic per-status counts for a company's approval requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalStats {
    pub total: u64,
    pub by_status: HashMap<ApprovalStatus, u64>,
}

impl ApprovalStats {
    pub fn count(&self, status: ApprovalStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    /// Requests still waiting on someone.
    pub fn open(&self) -> u64 {
        self.by_status
            .iter()
            .filter(|(status, _)| status.is_open())
            .map(|(_, n)| *n)
            .sum()
    }
}
