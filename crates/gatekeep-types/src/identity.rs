//! Directory principals as seen by the engine.
//!
//! The engine does not manage users or roles; these are the read-only shapes
//! returned by the identity directory.

use serde::{Deserialize, Serialize};

use crate::ids::{CompanyId, RoleId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub company_id: CompanyId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub company_id: CompanyId,
    pub name: String,
}

/// Permission keys checked by the engine.
pub mod permissions {
    pub const CREATE_WORKFLOW: &str = "create_workflow";
    pub const UPDATE_WORKFLOW: &str = "update_workflow";
    pub const CANCEL_WORKFLOW: &str = "cancel_workflow";
    pub const TRIGGER_WORKFLOW: &str = "trigger_workflow";
    pub const VIEW_INTERNAL_COMMENTS: &str = "view_internal_comments";
}
