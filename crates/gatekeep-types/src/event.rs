//! Real-time event vocabulary delivered to connected clients.
//!
//! `ApprovalEvent` is a closed, serde-tagged union: every frame on a
//! subscription stream is exactly one of these variants, serialized as
//! `{"type": "...", "approval_id": "...", "data": {...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::{ApprovalDecision, ApprovalStatus, Priority};
use crate::entity::EntityType;
use crate::ids::UserId;
use crate::instance::InstanceStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalEvent {
    /// Always the first frame of a new subscription.
    Connected { data: ConnectedData },

    /// A request was routed to the receiving user (directly or via a role).
    ApprovalAssigned {
        approval_id: Uuid,
        data: AssignedData,
    },

    /// A request was decided, reassigned, reopened or expired.
    ApprovalStatusChanged {
        approval_id: Uuid,
        data: StatusChangedData,
    },

    /// Someone commented on a request.
    ApprovalCommented {
        approval_id: Uuid,
        data: CommentedData,
    },

    /// Keep-alive frame with no payload semantics.
    Heartbeat { data: HeartbeatData },
}

impl ApprovalEvent {
    /// The approval request the event refers to, if any.
    pub fn approval_id(&self) -> Option<Uuid> {
        match self {
            ApprovalEvent::ApprovalAssigned { approval_id, .. }
            | ApprovalEvent::ApprovalStatusChanged { approval_id, .. }
            | ApprovalEvent::ApprovalCommented { approval_id, .. } => Some(*approval_id),
            ApprovalEvent::Connected { .. } | ApprovalEvent::Heartbeat { .. } => None,
        }
    }

    /// Short name of the variant, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            ApprovalEvent::Connected { .. } => "connected",
            ApprovalEvent::ApprovalAssigned { .. } => "approval_assigned",
            ApprovalEvent::ApprovalStatusChanged { .. } => "approval_status_changed",
            ApprovalEvent::ApprovalCommented { .. } => "approval_commented",
            ApprovalEvent::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn connected(user_id: UserId, connection_id: Uuid) -> Self {
        ApprovalEvent::Connected {
            data: ConnectedData {
                user_id,
                connection_id,
                connected_at: Utc::now(),
            },
        }
    }

    pub fn heartbeat() -> Self {
        ApprovalEvent::Heartbeat {
            data: HeartbeatData { at: Utc::now() },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedData {
    pub user_id: UserId,
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedData {
    pub workflow_instance_id: Uuid,
    pub step_number: u32,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub title: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangedData {
    pub workflow_instance_id: Uuid,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_by: Option<UserId>,
    pub instance_status: InstanceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentedData {
    pub comment_id: Uuid,
    pub author_id: UserId,
    pub is_internal: bool,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub at: DateTime<Utc>,
}
