//! Template authoring: create, update, deactivate and read.

use chrono::Utc;
use gatekeep_types::audit::{AuditAction, AuditEntry};
use gatekeep_types::error::{ApprovalError, ValidationError};
use gatekeep_types::identity::permissions;
use gatekeep_types::ids::{CompanyId, UserId};
use gatekeep_types::template::{TemplateDraft, WorkflowTemplate};
use serde_json::json;
use uuid::Uuid;

use super::engine::{TEMPLATE_RECORD, WorkflowEngine};
use super::template::{template_from_draft, validate_template};
use crate::directory::{IdentityDirectory, PermissionChecker};
use crate::repository::audit::AuditRepository;
use crate::repository::workflow::{TemplateFilter, WorkflowRepository};

impl<R, A, D> WorkflowEngine<R, A, D>
where
    R: WorkflowRepository,
    A: AuditRepository,
    D: IdentityDirectory + PermissionChecker,
{
    pub async fn create_template(
        &self,
        actor: UserId,
        draft: TemplateDraft,
    ) -> Result<WorkflowTemplate, ApprovalError> {
        let user = self.company_member(&actor).await?;
        self.require_permission(&actor, permissions::CREATE_WORKFLOW)
            .await?;

        let template = template_from_draft(draft, user.company_id, actor);
        self.check_template(&template).await?;
        self.repo.save_template(&template).await?;

        self.audit
            .record(
                AuditEntry::new(
                    template.company_id,
                    TEMPLATE_RECORD,
                    template.id,
                    AuditAction::TemplateCreated,
                    Some(actor),
                )
                .with_states(None, Some(template_summary(&template))),
            )
            .await;
        tracing::info!(template_id = %template.id, name = %template.name, "workflow template created");
        Ok(template)
    }

    /// Replace a template's definition, keeping its id and creation
    /// metadata. Instances already started keep the steps they were created
    /// with; only new instances see the change.
    pub async fn update_template(
        &self,
        actor: UserId,
        template_id: &Uuid,
        draft: TemplateDraft,
    ) -> Result<WorkflowTemplate, ApprovalError> {
        let user = self.company_member(&actor).await?;
        let existing = self.load_template(&user.company_id, template_id).await?;
        self.require_permission(&actor, permissions::UPDATE_WORKFLOW)
            .await?;

        let mut template = template_from_draft(draft, existing.company_id, existing.created_by);
        template.id = existing.id;
        template.created_at = existing.created_at;
        self.check_template(&template).await?;
        self.repo.save_template(&template).await?;

        self.audit
            .record(
                AuditEntry::new(
                    template.company_id,
                    TEMPLATE_RECORD,
                    template.id,
                    AuditAction::TemplateUpdated,
                    Some(actor),
                )
                .with_states(
                    Some(template_summary(&existing)),
                    Some(template_summary(&template)),
                ),
            )
            .await;
        tracing::info!(template_id = %template.id, "workflow template updated");
        Ok(template)
    }

    /// Flip `is_active` off. Nothing else about the template changes.
    pub async fn deactivate_template(
        &self,
        actor: UserId,
        template_id: &Uuid,
    ) -> Result<WorkflowTemplate, ApprovalError> {
        let user = self.company_member(&actor).await?;
        let mut template = self.load_template(&user.company_id, template_id).await?;
        self.require_permission(&actor, permissions::UPDATE_WORKFLOW)
            .await?;

        if !template.is_active {
            return Ok(template);
        }
        template.is_active = false;
        template.updated_at = Utc::now();
        self.repo.save_template(&template).await?;

        self.audit
            .record(
                AuditEntry::new(
                    template.company_id,
                    TEMPLATE_RECORD,
                    template.id,
                    AuditAction::TemplateDeactivated,
                    Some(actor),
                )
                .with_states(
                    Some(json!({"is_active": true})),
                    Some(json!({"is_active": false})),
                ),
            )
            .await;
        tracing::info!(template_id = %template.id, actor = %actor, "workflow template deactivated");
        Ok(template)
    }

    pub async fn get_template(
        &self,
        viewer: UserId,
        template_id: &Uuid,
    ) -> Result<WorkflowTemplate, ApprovalError> {
        let user = self.company_member(&viewer).await?;
        self.load_template(&user.company_id, template_id).await
    }

    pub async fn list_templates(
        &self,
        company_id: &CompanyId,
        filter: &TemplateFilter,
    ) -> Result<Vec<WorkflowTemplate>, ApprovalError> {
        Ok(self.repo.list_templates(company_id, filter).await?)
    }

    /// Structural validation first, then every assignee against the
    /// directory. All violations are reported together.
    async fn check_template(&self, template: &WorkflowTemplate) -> Result<(), ApprovalError> {
        validate_template(template)?;

        let mut violations = Vec::new();
        for step in &template.steps {
            if step.assignee_user_id.is_none() && step.assignee_role_id.is_none() {
                continue;
            }
            match self
                .resolver()
                .validate_workflow_assignees(
                    &template.company_id,
                    step.assignee_user_id,
                    step.assignee_role_id,
                )
                .await
            {
                Ok(()) => {}
                Err(ApprovalError::Validation(e)) => violations.extend(
                    e.violations
                        .into_iter()
                        .map(|v| format!("step {}: {v}", step.step_number)),
                ),
                Err(ApprovalError::AssigneeInvalid(user_id)) => violations.push(format!(
                    "step {}: user {user_id} is not an active member of this company",
                    step.step_number
                )),
                Err(other) => return Err(other),
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(violations).into())
        }
    }
}

fn template_summary(template: &WorkflowTemplate) -> serde_json::Value {
    json!({
        "name": template.name,
        "entity_type": template.entity_type,
        "trigger_type": template.trigger_type,
        "is_active": template.is_active,
        "steps": template.steps.len(),
    })
}
