//! Assignee resolution against the identity directory.
//!
//! Assignees are always resolved live: a step routed to a role reaches the
//! users holding that role at activation time, not at authoring time.

use gatekeep_types::error::{ApprovalError, ValidationError};
use gatekeep_types::identity::User;
use gatekeep_types::ids::{CompanyId, RoleId, UserId};
use gatekeep_types::instance::StepExecution;
use gatekeep_types::template::{AssigneeType, StepDefinition};

use crate::directory::IdentityDirectory;

pub struct AssigneeResolver<'a, D: IdentityDirectory> {
    directory: &'a D,
}

impl<'a, D: IdentityDirectory> AssigneeResolver<'a, D> {
    pub fn new(directory: &'a D) -> Self {
        Self { directory }
    }

    /// Users who must act on `step`, in directory order without duplicates.
    pub async fn resolve_assignee(
        &self,
        step: &StepDefinition,
        company_id: &CompanyId,
    ) -> Result<Vec<UserId>, ApprovalError> {
        match step.assignee_type {
            AssigneeType::User => {
                let user_id = step.assignee_user_id.ok_or_else(|| {
                    ValidationError::single(format!(
                        "step {}: assignee_user_id is not set",
                        step.step_number
                    ))
                })?;
                let user = self.require_member(&user_id, company_id).await?;
                Ok(vec![user.id])
            }
            AssigneeType::Role => {
                let role_id = step.assignee_role_id.ok_or_else(|| {
                    ValidationError::single(format!(
                        "step {}: assignee_role_id is not set",
                        step.step_number
                    ))
                })?;
                let members = self.role_members(&role_id, company_id).await?;
                if members.is_empty() {
                    return Err(ApprovalError::NoEligibleAssignee(role_id));
                }
                Ok(members)
            }
        }
    }

    /// Active users of `company_id` holding `role_id`.
    pub async fn role_members(
        &self,
        role_id: &RoleId,
        company_id: &CompanyId,
    ) -> Result<Vec<UserId>, ApprovalError> {
        let users = self.directory.list_users_with_role(role_id, company_id).await?;
        let mut members: Vec<UserId> = Vec::with_capacity(users.len());
        for user in users {
            if user.is_active && user.company_id == *company_id && !members.contains(&user.id) {
                members.push(user.id);
            }
        }
        Ok(members)
    }

    /// The user, provided they exist, are active and belong to `company_id`.
    pub async fn require_member(
        &self,
        user_id: &UserId,
        company_id: &CompanyId,
    ) -> Result<User, ApprovalError> {
        match self.directory.get_user(user_id).await? {
            Some(user) if user.is_active && user.company_id == *company_id => Ok(user),
            _ => Err(ApprovalError::AssigneeInvalid(*user_id)),
        }
    }

    /// Authoring-time check of a step's assignee ids.
    pub async fn validate_workflow_assignees(
        &self,
        company_id: &CompanyId,
        user_id: Option<UserId>,
        role_id: Option<RoleId>,
    ) -> Result<(), ApprovalError> {
        match (user_id, role_id) {
            (Some(user_id), None) => {
                self.require_member(&user_id, company_id).await?;
                Ok(())
            }
            (None, Some(role_id)) => match self.directory.get_role(&role_id).await? {
                Some(role) if role.company_id == *company_id => Ok(()),
                _ => Err(ValidationError::single(format!(
                    "role {role_id} does not exist in this company"
                ))
                .into()),
            },
            _ => Err(ValidationError::single(
                "exactly one of assignee_user_id or assignee_role_id must be set",
            )
            .into()),
        }
    }

    /// Whether `reviewer` may decide `execution`.
    ///
    /// An execution pinned to a user (user assignee, parallel slot, or a
    /// role slot claimed by `more_info_required` or delegation) belongs to
    /// that user alone. An unpinned role-routed execution may be decided by
    /// any current holder of the role.
    pub async fn is_eligible_reviewer(
        &self,
        execution: &StepExecution,
        step: &StepDefinition,
        reviewer: &UserId,
        company_id: &CompanyId,
    ) -> Result<bool, ApprovalError> {
        if let Some(assigned) = execution.assigned_to_user_id {
            return Ok(assigned == *reviewer);
        }
        if step.allow_parallel() {
            return Ok(false);
        }
        let Some(role_id) = execution.assigned_role_id.or(step.assignee_role_id) else {
            return Ok(false);
        };

        if self.directory.get_current_role(reviewer).await? == Some(role_id) {
            return Ok(self.require_member(reviewer, company_id).await.is_ok());
        }
        Ok(self
            .role_members(&role_id, company_id)
            .await?
            .contains(reviewer))
    }
}
