use thiserror::Error;

use crate::ids::{RoleId, UserId};

/// Template authoring failure carrying every violation found, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("template validation failed: {}", .violations.join("; "))]
pub struct ValidationError {
    pub violations: Vec<String>,
}

impl ValidationError {
    pub fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }

    pub fn single(violation: impl Into<String>) -> Self {
        Self {
            violations: vec![violation.into()],
        }
    }
}

/// Errors surfaced by the approval engine.
///
/// `NotFound` is deliberately generic: unknown ids and ids belonging to
/// another company are indistinguishable to the caller.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("assignee is not a valid user of this company: {0}")]
    AssigneeInvalid(UserId),

    #[error("no eligible assignee holds role {0}")]
    NoEligibleAssignee(RoleId),

    #[error("not found")]
    NotFound,

    #[error("approval request was already resolved")]
    AlreadyResolved,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("decision '{0}' is not accepted here")]
    UnsupportedDecision(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<RepositoryError> for ApprovalError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound => ApprovalError::NotFound,
            other => ApprovalError::Storage(other.to_string()),
        }
    }
}

/// Errors from repository operations (used by trait definitions in gatekeep-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}
