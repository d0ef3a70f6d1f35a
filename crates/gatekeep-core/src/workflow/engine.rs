//! The workflow instance state machine.
//!
//! `WorkflowEngine` owns every transition of a [`WorkflowInstance`]:
//! creation and step activation, advancing after decisions, expiry,
//! cancellation and the timeout sweep. Review and authoring operations are
//! implemented on the same type in `review.rs` and `authoring.rs`.
//!
//! Every mutating operation follows the same shape:
//! 1. take the per-instance lock
//! 2. load the instance aggregate
//! 3. mutate it in memory, collecting side effects
//! 4. commit the touched rows in one batch
//! 5. run side effects (audit, hub events, notifier)

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use gatekeep_types::approval::{ApprovalRequest, ApprovalStatus};
use gatekeep_types::audit::{AuditAction, AuditEntry};
use gatekeep_types::config::EngineConfig;
use gatekeep_types::entity::{EntityRef, EntityType};
use gatekeep_types::error::{ApprovalError, ValidationError};
use gatekeep_types::event::{ApprovalEvent, AssignedData, StatusChangedData};
use gatekeep_types::identity::{User, permissions};
use gatekeep_types::ids::{CompanyId, UserId};
use gatekeep_types::instance::{
    InstanceStatus, StepExecution, StepExecutionStatus, WorkflowInstance,
};
use gatekeep_types::template::{
    AssigneeType, StepDefinition, TriggerEvent, WorkflowTemplate,
};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::aggregate::{Effects, InstanceAggregate};
use super::escalation::{EscalationAction, EscalationPolicy, ExpireOnTimeout};
use super::lock::InstanceLocks;
use super::resolver::AssigneeResolver;
use super::template::{matches_trigger, validate_template};
use crate::audit::AuditTrail;
use crate::directory::{
    EntityStore, IdentityDirectory, Notifier, NullNotifier, OutboundNotification,
    PermissionChecker,
};
use crate::event::EventPublisher;
use crate::repository::audit::AuditRepository;
use crate::repository::workflow::{TemplateFilter, WorkflowRepository};

/// Audit record kinds.
pub(crate) const INSTANCE_RECORD: &str = "workflow_instance";
pub(crate) const STEP_RECORD: &str = "step_execution";
pub(crate) const REQUEST_RECORD: &str = "approval_request";
pub(crate) const TEMPLATE_RECORD: &str = "workflow_template";

/// An instance with its executions and requests.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceDetail {
    pub instance: WorkflowInstance,
    pub step_executions: Vec<StepExecution>,
    pub approval_requests: Vec<ApprovalRequest>,
}

/// Outcome of one [`WorkflowEngine::sweep_expired`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Open executions whose step timeout had elapsed.
    pub due: usize,
    pub expired: usize,
    pub reassigned: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Pending,
    Approved,
    Rejected,
}

pub struct WorkflowEngine<R, A, D>
where
    R: WorkflowRepository,
    A: AuditRepository,
    D: IdentityDirectory + PermissionChecker,
{
    pub(crate) repo: R,
    pub(crate) audit: AuditTrail<A>,
    pub(crate) directory: D,
    pub(crate) publisher: Arc<dyn EventPublisher>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) escalation: Arc<dyn EscalationPolicy>,
    pub(crate) locks: InstanceLocks,
    pub(crate) config: EngineConfig,
}

impl<R, A, D> WorkflowEngine<R, A, D>
where
    R: WorkflowRepository,
    A: AuditRepository,
    D: IdentityDirectory + PermissionChecker,
{
    pub fn new(
        repo: R,
        audit_repo: A,
        directory: D,
        publisher: Arc<dyn EventPublisher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            audit: AuditTrail::new(audit_repo),
            directory,
            publisher,
            notifier: Arc::new(NullNotifier),
            escalation: Arc::new(ExpireOnTimeout),
            locks: InstanceLocks::new(),
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_escalation_policy(mut self, policy: Arc<dyn EscalationPolicy>) -> Self {
        self.escalation = policy;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn audit_trail(&self) -> &AuditTrail<A> {
        &self.audit
    }

    pub(crate) fn resolver(&self) -> AssigneeResolver<'_, D> {
        AssigneeResolver::new(&self.directory)
    }

    // -----------------------------------------------------------------------
    // Caller checks
    // -----------------------------------------------------------------------

    /// The acting user, provided they exist and are active.
    ///
    /// Unknown callers get `NotFound`: they cannot own anything.
    pub(crate) async fn company_member(&self, user_id: &UserId) -> Result<User, ApprovalError> {
        match self.directory.get_user(user_id).await? {
            Some(user) if user.is_active => Ok(user),
            _ => Err(ApprovalError::NotFound),
        }
    }

    pub(crate) async fn require_permission(
        &self,
        user_id: &UserId,
        permission: &str,
    ) -> Result<(), ApprovalError> {
        if self.directory.has_permission(user_id, permission).await? {
            Ok(())
        } else {
            Err(ApprovalError::Forbidden(format!(
                "missing permission '{permission}'"
            )))
        }
    }

    /// A template of `company_id`; other companies' ids look missing.
    pub(crate) async fn load_template(
        &self,
        company_id: &CompanyId,
        template_id: &Uuid,
    ) -> Result<WorkflowTemplate, ApprovalError> {
        self.repo
            .get_template(template_id)
            .await?
            .filter(|t| t.company_id == *company_id)
            .ok_or(ApprovalError::NotFound)
    }

    pub(crate) async fn load_aggregate(
        &self,
        instance_id: &Uuid,
    ) -> Result<InstanceAggregate, ApprovalError> {
        let instance = self
            .repo
            .get_instance(instance_id)
            .await?
            .ok_or(ApprovalError::NotFound)?;
        let executions = self.repo.list_step_executions(instance_id).await?;
        let requests = self.repo.list_requests_for_instance(instance_id).await?;
        Ok(InstanceAggregate::loaded(instance, executions, requests))
    }

    /// Template an instance was started from, regardless of its active
    /// flag, carrying the steps frozen on the instance.
    pub(crate) async fn template_of(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowTemplate, ApprovalError> {
        let mut template = self
            .load_template(&instance.company_id, &instance.template_id)
            .await?;
        template.steps = instance.steps.clone();
        Ok(template)
    }

    // -----------------------------------------------------------------------
    // Starting instances
    // -----------------------------------------------------------------------

    /// Start `template` for `entity` and activate its first step.
    ///
    /// A required first step without an assignee fails the whole call and
    /// nothing is persisted.
    pub async fn create_instance(
        &self,
        template: &WorkflowTemplate,
        entity: EntityRef,
        triggered_by: UserId,
    ) -> Result<WorkflowInstance, ApprovalError> {
        if !template.is_active {
            return Err(ApprovalError::InvalidTransition(format!(
                "template '{}' is inactive",
                template.name
            )));
        }
        if template.entity_type != entity.entity_type {
            return Err(ValidationError::single(format!(
                "template '{}' applies to {}, not {}",
                template.name, template.entity_type, entity.entity_type
            ))
            .into());
        }
        validate_template(template)?;

        let instance = WorkflowInstance {
            id: Uuid::now_v7(),
            template_id: template.id,
            entity_type: entity.entity_type,
            entity_id: entity.entity_id,
            entity_snapshot: entity.snapshot,
            status: InstanceStatus::Running,
            current_step_number: None,
            steps: template.steps.clone(),
            triggered_by,
            company_id: template.company_id,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut agg = InstanceAggregate::new(instance);
        let mut fx = Effects::default();

        fx.audit(
            AuditEntry::new(
                template.company_id,
                INSTANCE_RECORD,
                agg.instance.id,
                AuditAction::InstanceCreated,
                Some(triggered_by),
            )
            .with_states(
                None,
                Some(json!({
                    "template_id": template.id,
                    "entity_type": agg.instance.entity_type,
                    "entity_id": agg.instance.entity_id,
                    "status": InstanceStatus::Running,
                })),
            ),
        );

        self.activate_from(&mut agg, &mut fx, template, 1, Some(triggered_by))
            .await?;
        self.finish(&agg, fx).await?;

        tracing::info!(
            instance_id = %agg.instance.id,
            template_id = %template.id,
            entity_id = %agg.instance.entity_id,
            status = %agg.instance.status,
            "workflow instance created"
        );
        Ok(agg.instance)
    }

    /// Start every active template of the caller's company that matches the
    /// event and entity data.
    ///
    /// Templates that fail to start are logged and skipped; the error is
    /// returned only when no instance could be started at all.
    pub async fn trigger_workflow(
        &self,
        entity: EntityRef,
        event: TriggerEvent,
        triggered_by: UserId,
    ) -> Result<Vec<WorkflowInstance>, ApprovalError> {
        let user = self.company_member(&triggered_by).await?;
        if event == TriggerEvent::Manual {
            self.require_permission(&triggered_by, permissions::TRIGGER_WORKFLOW)
                .await?;
        }

        let filter = TemplateFilter {
            entity_type: Some(entity.entity_type),
            active_only: true,
        };
        let templates = self.repo.list_templates(&user.company_id, &filter).await?;

        let mut instances = Vec::new();
        let mut first_error = None;
        for template in templates
            .iter()
            .filter(|t| matches_trigger(t, entity.entity_type, event, &entity.snapshot))
        {
            match self
                .create_instance(template, entity.clone(), triggered_by)
                .await
            {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    tracing::warn!(
                        template_id = %template.id,
                        entity_id = %entity.entity_id,
                        error = %e,
                        "matching template could not be started"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if instances.is_empty() => Err(e),
            _ => Ok(instances),
        }
    }

    /// Like [`trigger_workflow`](Self::trigger_workflow) for an entity known
    /// only by id; the snapshot is fetched from `store`.
    pub async fn trigger_for_stored_entity<S: EntityStore>(
        &self,
        store: &S,
        entity_type: EntityType,
        entity_id: &str,
        event: TriggerEvent,
        triggered_by: UserId,
    ) -> Result<Vec<WorkflowInstance>, ApprovalError> {
        let snapshot = store
            .get_snapshot(entity_type, entity_id)
            .await?
            .ok_or(ApprovalError::NotFound)?;
        self.trigger_workflow(
            EntityRef::new(entity_type, entity_id, snapshot),
            event,
            triggered_by,
        )
        .await
    }

    /// Manually start one specific template.
    pub async fn start_workflow(
        &self,
        template_id: &Uuid,
        entity: EntityRef,
        actor: UserId,
    ) -> Result<WorkflowInstance, ApprovalError> {
        let user = self.company_member(&actor).await?;
        let template = self.load_template(&user.company_id, template_id).await?;
        self.require_permission(&actor, permissions::TRIGGER_WORKFLOW)
            .await?;
        self.create_instance(&template, entity, actor).await
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Re-evaluate the current step and move on if it is decided.
    ///
    /// Reviews advance automatically; this is for callers that repair or
    /// replay state. A no-op while the current step is still pending.
    pub async fn advance(
        &self,
        company_id: &CompanyId,
        instance_id: &Uuid,
    ) -> Result<WorkflowInstance, ApprovalError> {
        let _guard = self.locks.acquire(*instance_id).await;
        let mut agg = self.load_aggregate(instance_id).await?;
        if agg.instance.company_id != *company_id {
            return Err(ApprovalError::NotFound);
        }
        ensure_running(&agg.instance)?;
        let template = self.template_of(&agg.instance).await?;

        let mut fx = Effects::default();
        self.advance_aggregate(&mut agg, &mut fx, &template, None)
            .await?;
        self.finish(&agg, fx).await?;
        Ok(agg.instance)
    }

    /// Time out one assigned execution, consulting the escalation policy.
    pub async fn expire(&self, step_execution_id: &Uuid) -> Result<WorkflowInstance, ApprovalError> {
        let execution = self
            .repo
            .get_step_execution(step_execution_id)
            .await?
            .ok_or(ApprovalError::NotFound)?;

        let _guard = self.locks.acquire(execution.instance_id).await;
        let mut agg = self.load_aggregate(&execution.instance_id).await?;
        ensure_running(&agg.instance)?;

        let execution = agg
            .execution(*step_execution_id)
            .cloned()
            .ok_or(ApprovalError::NotFound)?;
        if execution.status != StepExecutionStatus::Assigned {
            return Err(ApprovalError::InvalidTransition(format!(
                "step execution {} is {}, not assigned",
                execution.id, execution.status
            )));
        }
        if agg.instance.current_step_number != Some(execution.step_number) {
            return Err(ApprovalError::InvalidTransition(format!(
                "step {} is not the current step",
                execution.step_number
            )));
        }

        let template = self.template_of(&agg.instance).await?;
        let step = step_of(&template, execution.step_number)?;
        let company_id = agg.instance.company_id;
        let mut fx = Effects::default();

        match self.escalation.on_timeout(&template, step, &execution) {
            EscalationAction::Reassign(fallback) => {
                match self.resolver().require_member(&fallback, &company_id).await {
                    Ok(_) => self.reassign_on_timeout(&mut agg, &mut fx, &template, step, &execution, fallback),
                    Err(e) => {
                        tracing::warn!(
                            instance_id = %agg.instance.id,
                            fallback = %fallback,
                            error = %e,
                            "escalation fallback is not assignable, expiring instead"
                        );
                        self.expire_aggregate(&mut agg, &mut fx, step.step_number);
                    }
                }
            }
            EscalationAction::Expire => self.expire_aggregate(&mut agg, &mut fx, step.step_number),
        }

        self.finish(&agg, fx).await?;
        Ok(agg.instance)
    }

    /// Cancel a running instance on behalf of `actor`.
    ///
    /// Allowed for the user who triggered it and for holders of
    /// `cancel_workflow`. Open requests expire.
    pub async fn cancel_instance(
        &self,
        instance_id: &Uuid,
        actor: UserId,
        reason: Option<String>,
    ) -> Result<WorkflowInstance, ApprovalError> {
        let user = self.company_member(&actor).await?;
        let _guard = self.locks.acquire(*instance_id).await;
        let mut agg = self.load_aggregate(instance_id).await?;
        if agg.instance.company_id != user.company_id {
            return Err(ApprovalError::NotFound);
        }
        if agg.instance.triggered_by != actor {
            self.require_permission(&actor, permissions::CANCEL_WORKFLOW)
                .await?;
        }
        ensure_running(&agg.instance)?;

        let mut fx = Effects::default();
        let reason = reason.unwrap_or_else(|| "cancelled by user".to_string());
        self.cancel_aggregate(&mut agg, &mut fx, Some(actor), &reason);
        self.finish(&agg, fx).await?;

        tracing::info!(instance_id = %instance_id, actor = %actor, "workflow instance cancelled");
        Ok(agg.instance)
    }

    /// Expire (or escalate) every assigned execution whose step timeout has
    /// elapsed at `now`.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, ApprovalError> {
        let open = self.repo.list_open_step_executions().await?;
        let mut report = SweepReport::default();
        let mut instances: HashMap<Uuid, Option<WorkflowInstance>> = HashMap::new();
        let mut finished: HashSet<Uuid> = HashSet::new();

        for execution in open {
            if execution.status != StepExecutionStatus::Assigned
                || finished.contains(&execution.instance_id)
            {
                continue;
            }

            if !instances.contains_key(&execution.instance_id) {
                let instance = self.repo.get_instance(&execution.instance_id).await?;
                instances.insert(execution.instance_id, instance);
            }
            let Some(Some(instance)) = instances.get(&execution.instance_id) else {
                continue;
            };
            if instance.is_terminal() || instance.current_step_number != Some(execution.step_number) {
                continue;
            }

            let Some(hours) = instance
                .step(execution.step_number)
                .and_then(|s| s.timeout_hours)
            else {
                continue;
            };
            // A deadline past chrono's range is never due.
            let due = execution
                .created_at
                .checked_add_signed(Duration::hours(i64::from(hours)))
                .is_some_and(|deadline| deadline <= now);
            if !due {
                continue;
            }

            report.due += 1;
            match self.expire(&execution.id).await {
                Ok(instance) if instance.status == InstanceStatus::Expired => {
                    finished.insert(instance.id);
                    report.expired += 1;
                }
                Ok(_) => report.reassigned += 1,
                Err(e) => {
                    tracing::warn!(
                        step_execution_id = %execution.id,
                        error = %e,
                        "failed to expire timed-out step"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.due > 0 {
            tracing::info!(
                due = report.due,
                expired = report.expired,
                reassigned = report.reassigned,
                failed = report.failed,
                "expiry sweep finished"
            );
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_instance(
        &self,
        viewer: UserId,
        instance_id: &Uuid,
    ) -> Result<InstanceDetail, ApprovalError> {
        let user = self.company_member(&viewer).await?;
        let agg = self.load_aggregate(instance_id).await?;
        if agg.instance.company_id != user.company_id {
            return Err(ApprovalError::NotFound);
        }
        Ok(InstanceDetail {
            instance: agg.instance,
            step_executions: agg.executions,
            approval_requests: agg.requests,
        })
    }

    /// Instance-level audit history, oldest first.
    pub async fn instance_history(
        &self,
        viewer: UserId,
        instance_id: &Uuid,
    ) -> Result<Vec<AuditEntry>, ApprovalError> {
        let user = self.company_member(&viewer).await?;
        let instance = self
            .repo
            .get_instance(instance_id)
            .await?
            .filter(|i| i.company_id == user.company_id)
            .ok_or(ApprovalError::NotFound)?;
        Ok(self
            .audit
            .history(&instance.company_id, INSTANCE_RECORD, &instance.id.to_string())
            .await?)
    }

    // -----------------------------------------------------------------------
    // State machine internals
    // -----------------------------------------------------------------------

    /// Activate `start` and, while steps complete on their own (notification
    /// steps, skipped optional steps), the ones after it. Running off the end
    /// of the template completes the instance.
    pub(crate) async fn activate_from(
        &self,
        agg: &mut InstanceAggregate,
        fx: &mut Effects,
        template: &WorkflowTemplate,
        start: u32,
        actor: Option<UserId>,
    ) -> Result<(), ApprovalError> {
        let company_id = agg.instance.company_id;
        let mut step_number = start;

        loop {
            let Some(step) = template.step(step_number) else {
                self.complete_instance(agg, fx, actor);
                return Ok(());
            };
            agg.instance.current_step_number = Some(step_number);
            agg.touch_instance();

            let resolved = if !step.requires_decision()
                && step.assignee_user_id.is_none()
                && step.assignee_role_id.is_none()
            {
                Ok(vec![agg.instance.triggered_by])
            } else {
                self.resolver().resolve_assignee(step, &company_id).await
            };

            let candidates = match resolved {
                Ok(candidates) => candidates,
                Err(e) if !step.is_required && is_resolution_failure(&e) => {
                    tracing::info!(
                        instance_id = %agg.instance.id,
                        step_number,
                        error = %e,
                        "optional step has no assignee, skipping"
                    );
                    let execution = new_execution(agg.instance.id, step, StepExecutionStatus::Skipped, None);
                    fx.audit(
                        AuditEntry::new(company_id, STEP_RECORD, execution.id, AuditAction::StepSkipped, actor)
                            .with_states(None, Some(json!({
                                "step_number": step_number,
                                "reason": e.to_string(),
                            }))),
                    );
                    agg.push_execution(execution);
                    step_number += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !step.requires_decision() {
                let mut execution =
                    new_execution(agg.instance.id, step, StepExecutionStatus::Approved, None);
                execution.decided_at = Some(Utc::now());
                fx.notify(OutboundNotification {
                    company_id,
                    recipients: candidates,
                    subject: format!("{}: {}", entity_title(&agg.instance), step.name),
                    body: format!("Workflow '{}' reached step {}.", template.name, step_number),
                    approval_id: None,
                    workflow_instance_id: agg.instance.id,
                });
                fx.audit(
                    AuditEntry::new(company_id, STEP_RECORD, execution.id, AuditAction::StepCompleted, actor)
                        .with_states(None, Some(json!({"step_number": step_number, "type": step.step_type}))),
                );
                agg.push_execution(execution);
                step_number += 1;
                continue;
            }

            self.assign_step(agg, fx, template, step, &candidates, actor);
            return Ok(());
        }
    }

    /// Create the executions and requests of a decision step.
    ///
    /// Parallel steps get one slot per candidate. Other steps get a single
    /// slot: pinned to the user for user assignees, open to every member for
    /// role assignees.
    pub(crate) fn assign_step(
        &self,
        agg: &mut InstanceAggregate,
        fx: &mut Effects,
        template: &WorkflowTemplate,
        step: &StepDefinition,
        candidates: &[UserId],
        actor: Option<UserId>,
    ) {
        let slots: Vec<Option<UserId>> = if step.allow_parallel() {
            candidates.iter().copied().map(Some).collect()
        } else {
            match step.assignee_type {
                AssigneeType::User => vec![candidates.first().copied()],
                AssigneeType::Role => vec![None],
            }
        };

        for slot in slots {
            let execution = new_execution(agg.instance.id, step, StepExecutionStatus::Assigned, slot);
            let request = new_request(&agg.instance, template, step, &execution);
            let targets = match slot {
                Some(user_id) => vec![user_id],
                None => candidates.to_vec(),
            };
            self.announce_assignment(fx, &agg.instance, &request, targets);
            agg.push_execution(execution);
            agg.push_request(request);
        }

        fx.audit(
            AuditEntry::new(
                agg.instance.company_id,
                INSTANCE_RECORD,
                agg.instance.id,
                AuditAction::StepActivated,
                actor,
            )
            .with_states(
                None,
                Some(json!({
                    "step_number": step.step_number,
                    "type": step.step_type,
                    "assignees": candidates,
                })),
            ),
        );
    }

    pub(crate) fn announce_assignment(
        &self,
        fx: &mut Effects,
        instance: &WorkflowInstance,
        request: &ApprovalRequest,
        targets: Vec<UserId>,
    ) {
        fx.notify(OutboundNotification {
            company_id: instance.company_id,
            recipients: targets.clone(),
            subject: format!("Approval needed: {}", request.title),
            body: request.description.clone().unwrap_or_default(),
            approval_id: Some(request.id),
            workflow_instance_id: instance.id,
        });
        fx.emit(
            ApprovalEvent::ApprovalAssigned {
                approval_id: request.id,
                data: AssignedData {
                    workflow_instance_id: instance.id,
                    step_number: request.step_number,
                    entity_type: request.entity_type,
                    entity_id: request.entity_id.clone(),
                    title: request.title.clone(),
                    priority: request.priority,
                },
            },
            targets,
        );
    }

    /// Move past the current step if its executions are decided.
    pub(crate) async fn advance_aggregate(
        &self,
        agg: &mut InstanceAggregate,
        fx: &mut Effects,
        template: &WorkflowTemplate,
        actor: Option<UserId>,
    ) -> Result<(), ApprovalError> {
        if agg.instance.is_terminal() {
            return Ok(());
        }
        let Some(current) = agg.instance.current_step_number else {
            return Ok(());
        };
        let step = step_of(template, current)?;
        let company_id = agg.instance.company_id;

        match evaluate_step(agg, step) {
            StepOutcome::Pending => Ok(()),
            StepOutcome::Approved => {
                fx.audit(
                    AuditEntry::new(company_id, INSTANCE_RECORD, agg.instance.id, AuditAction::StepCompleted, actor)
                        .with_states(None, Some(json!({"step_number": current}))),
                );
                self.continue_from(agg, fx, template, current + 1, actor)
                    .await
            }
            StepOutcome::Rejected => {
                // Short-circuit: nobody else needs to decide a rejected step.
                close_open_slots(agg, fx, Some(current), StepExecutionStatus::Skipped, actor);
                fx.audit(
                    AuditEntry::new(company_id, INSTANCE_RECORD, agg.instance.id, AuditAction::StepRejected, actor)
                        .with_states(None, Some(json!({
                            "step_number": current,
                            "is_required": step.is_required,
                        }))),
                );
                if step.is_required || !self.config.continue_on_optional_rejection {
                    let reason = format!("step {current} ({}) was rejected", step.name);
                    self.cancel_aggregate(agg, fx, actor, &reason);
                    Ok(())
                } else {
                    self.continue_from(agg, fx, template, current + 1, actor)
                        .await
                }
            }
        }
    }

    /// Activate `next` after a decided step. An unassignable required step
    /// cancels the instance instead of failing the decision that led here.
    async fn continue_from(
        &self,
        agg: &mut InstanceAggregate,
        fx: &mut Effects,
        template: &WorkflowTemplate,
        next: u32,
        actor: Option<UserId>,
    ) -> Result<(), ApprovalError> {
        match self.activate_from(agg, fx, template, next, actor).await {
            Err(e) if is_resolution_failure(&e) => {
                tracing::warn!(
                    instance_id = %agg.instance.id,
                    step_number = next,
                    error = %e,
                    "required step cannot be assigned, cancelling instance"
                );
                self.cancel_aggregate(agg, fx, actor, &format!("step could not be assigned: {e}"));
                Ok(())
            }
            other => other,
        }
    }

    fn complete_instance(&self, agg: &mut InstanceAggregate, fx: &mut Effects, actor: Option<UserId>) {
        let instance = &mut agg.instance;
        instance.status = InstanceStatus::Completed;
        instance.current_step_number = None;
        instance.completed_at = Some(Utc::now());
        agg.touch_instance();

        fx.audit(
            AuditEntry::new(
                agg.instance.company_id,
                INSTANCE_RECORD,
                agg.instance.id,
                AuditAction::InstanceCompleted,
                actor,
            )
            .with_states(
                Some(json!({"status": InstanceStatus::Running})),
                Some(json!({"status": InstanceStatus::Completed})),
            ),
        );
        fx.notify(OutboundNotification {
            company_id: agg.instance.company_id,
            recipients: vec![agg.instance.triggered_by],
            subject: format!("Approved: {}", entity_title(&agg.instance)),
            body: "Every approval step has been completed.".to_string(),
            approval_id: None,
            workflow_instance_id: agg.instance.id,
        });
    }

    pub(crate) fn cancel_aggregate(
        &self,
        agg: &mut InstanceAggregate,
        fx: &mut Effects,
        actor: Option<UserId>,
        reason: &str,
    ) {
        agg.instance.status = InstanceStatus::Cancelled;
        agg.instance.current_step_number = None;
        agg.instance.completed_at = Some(Utc::now());
        agg.touch_instance();
        close_open_slots(agg, fx, None, StepExecutionStatus::Skipped, actor);

        fx.audit(
            AuditEntry::new(
                agg.instance.company_id,
                INSTANCE_RECORD,
                agg.instance.id,
                AuditAction::InstanceCancelled,
                actor,
            )
            .with_states(
                Some(json!({"status": InstanceStatus::Running})),
                Some(json!({"status": InstanceStatus::Cancelled, "reason": reason})),
            ),
        );
        fx.notify(OutboundNotification {
            company_id: agg.instance.company_id,
            recipients: vec![agg.instance.triggered_by],
            subject: format!("Cancelled: {}", entity_title(&agg.instance)),
            body: reason.to_string(),
            approval_id: None,
            workflow_instance_id: agg.instance.id,
        });
    }

    fn expire_aggregate(&self, agg: &mut InstanceAggregate, fx: &mut Effects, step_number: u32) {
        agg.instance.status = InstanceStatus::Expired;
        agg.instance.completed_at = Some(Utc::now());
        agg.touch_instance();
        close_open_slots(agg, fx, Some(step_number), StepExecutionStatus::Expired, None);

        fx.audit(
            AuditEntry::new(
                agg.instance.company_id,
                INSTANCE_RECORD,
                agg.instance.id,
                AuditAction::InstanceExpired,
                None,
            )
            .with_states(
                Some(json!({"status": InstanceStatus::Running})),
                Some(json!({"status": InstanceStatus::Expired, "step_number": step_number})),
            ),
        );
        fx.notify(OutboundNotification {
            company_id: agg.instance.company_id,
            recipients: vec![agg.instance.triggered_by],
            subject: format!("Expired: {}", entity_title(&agg.instance)),
            body: format!("Step {step_number} was not decided in time."),
            approval_id: None,
            workflow_instance_id: agg.instance.id,
        });
    }

    fn reassign_on_timeout(
        &self,
        agg: &mut InstanceAggregate,
        fx: &mut Effects,
        template: &WorkflowTemplate,
        step: &StepDefinition,
        timed_out: &StepExecution,
        fallback: UserId,
    ) {
        let now = Utc::now();
        if let Some(execution) = agg.execution_mut(timed_out.id) {
            execution.status = StepExecutionStatus::Expired;
        }
        let old_request = agg.request_for_execution(timed_out.id).map(|r| r.id);
        if let Some(request_id) = old_request {
            if let Some(request) = agg.request_mut(request_id) {
                request.status = ApprovalStatus::Expired;
                request.completed_at = Some(now);
            }
            fx.status_changed(request_id, None);
        }

        let mut execution = new_execution(agg.instance.id, step, StepExecutionStatus::Assigned, Some(fallback));
        execution.assigned_role_id = None;
        let request = new_request(&agg.instance, template, step, &execution);
        self.announce_assignment(fx, &agg.instance, &request, vec![fallback]);

        fx.audit(
            AuditEntry::new(agg.instance.company_id, STEP_RECORD, execution.id, AuditAction::StepReassigned, None)
                .with_states(
                    Some(json!({"step_execution_id": timed_out.id, "assigned_to": timed_out.assigned_to_user_id})),
                    Some(json!({"assigned_to": fallback, "reason": "timeout"})),
                ),
        );
        tracing::info!(
            instance_id = %agg.instance.id,
            step_number = step.step_number,
            fallback = %fallback,
            "timed-out step reassigned"
        );
        agg.push_execution(execution);
        agg.push_request(request);
    }

    // -----------------------------------------------------------------------
    // Commit and side effects
    // -----------------------------------------------------------------------

    /// Persist the aggregate, then run its side effects.
    pub(crate) async fn finish(
        &self,
        agg: &InstanceAggregate,
        fx: Effects,
    ) -> Result<(), ApprovalError> {
        let batch = agg.to_batch();
        if !batch.is_empty() {
            self.repo.commit(&batch).await?;
        }

        let company_id = agg.instance.company_id;
        self.audit.record_all(fx.audits).await;

        for (event, targets) in &fx.events {
            self.publisher.publish(event, company_id, Some(targets));
        }
        for (request_id, changed_by) in &fx.status_changes {
            let Some(request) = agg.request(*request_id) else {
                continue;
            };
            let mut targets = self.audience(request).await;
            targets.retain(|u| Some(*u) != *changed_by);
            if targets.is_empty() {
                continue;
            }
            let event = status_event(request, agg.instance.status, *changed_by);
            self.publisher.publish(&event, company_id, Some(&targets));
        }
        for notification in fx.notifications {
            self.notifier.publish(notification);
        }
        Ok(())
    }

    /// Requester plus assignee(s) of a request.
    pub(crate) async fn audience(&self, request: &ApprovalRequest) -> Vec<UserId> {
        let mut users = vec![request.requested_by];
        match (request.assigned_to, request.assigned_role) {
            (Some(user_id), _) => users.push(user_id),
            (None, Some(role_id)) => {
                match self
                    .resolver()
                    .role_members(&role_id, &request.company_id)
                    .await
                {
                    Ok(members) => users.extend(members),
                    Err(e) => tracing::warn!(
                        approval_id = %request.id,
                        role_id = %role_id,
                        error = %e,
                        "could not resolve role members for event delivery"
                    ),
                }
            }
            (None, None) => {}
        }
        let mut seen = HashSet::new();
        users.retain(|u| seen.insert(*u));
        users
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_running(instance: &WorkflowInstance) -> Result<(), ApprovalError> {
    if instance.is_terminal() {
        Err(ApprovalError::InvalidTransition(format!(
            "instance {} is already {}",
            instance.id, instance.status
        )))
    } else {
        Ok(())
    }
}

pub(crate) fn step_of(template: &WorkflowTemplate, step_number: u32) -> Result<&StepDefinition, ApprovalError> {
    template.step(step_number).ok_or_else(|| {
        ApprovalError::InvalidTransition(format!(
            "step {step_number} is not part of template {}",
            template.id
        ))
    })
}

fn is_resolution_failure(e: &ApprovalError) -> bool {
    matches!(
        e,
        ApprovalError::AssigneeInvalid(_) | ApprovalError::NoEligibleAssignee(_)
    )
}

fn evaluate_step(agg: &InstanceAggregate, step: &StepDefinition) -> StepOutcome {
    let live: Vec<&StepExecution> = agg
        .executions_for_step(step.step_number)
        .filter(|e| {
            !matches!(
                e.status,
                StepExecutionStatus::Skipped | StepExecutionStatus::Expired
            )
        })
        .collect();

    if live.is_empty() {
        return StepOutcome::Pending;
    }
    if live.iter().any(|e| e.status == StepExecutionStatus::Rejected) {
        return StepOutcome::Rejected;
    }
    let approved = |e: &&StepExecution| e.status == StepExecutionStatus::Approved;
    let done = if step.allow_parallel() {
        live.iter().all(approved)
    } else {
        live.iter().any(approved)
    };
    if done {
        StepOutcome::Approved
    } else {
        StepOutcome::Pending
    }
}

/// Close every open execution (of one step, or all) and expire its request.
fn close_open_slots(
    agg: &mut InstanceAggregate,
    fx: &mut Effects,
    step_number: Option<u32>,
    status: StepExecutionStatus,
    changed_by: Option<UserId>,
) {
    let now = Utc::now();
    let open: Vec<Uuid> = agg
        .executions
        .iter()
        .filter(|e| e.is_open() && step_number.is_none_or(|n| e.step_number == n))
        .map(|e| e.id)
        .collect();

    for execution_id in open {
        if let Some(execution) = agg.execution_mut(execution_id) {
            execution.status = status;
        }
        let request_id = agg
            .request_for_execution(execution_id)
            .filter(|r| r.is_open())
            .map(|r| r.id);
        if let Some(request_id) = request_id {
            if let Some(request) = agg.request_mut(request_id) {
                request.status = ApprovalStatus::Expired;
                request.completed_at = Some(now);
            }
            fx.status_changed(request_id, changed_by);
        }
    }
}

pub(crate) fn new_execution(
    instance_id: Uuid,
    step: &StepDefinition,
    status: StepExecutionStatus,
    assigned_to: Option<UserId>,
) -> StepExecution {
    StepExecution {
        id: Uuid::now_v7(),
        instance_id,
        step_number: step.step_number,
        status,
        assigned_to_user_id: assigned_to,
        assigned_role_id: step.assignee_role_id,
        decided_by: None,
        decision: None,
        decision_reason: None,
        created_at: Utc::now(),
        decided_at: None,
    }
}

fn new_request(
    instance: &WorkflowInstance,
    template: &WorkflowTemplate,
    step: &StepDefinition,
    execution: &StepExecution,
) -> ApprovalRequest {
    ApprovalRequest {
        id: Uuid::now_v7(),
        workflow_instance_id: instance.id,
        step_execution_id: execution.id,
        step_number: step.step_number,
        entity_type: instance.entity_type,
        entity_id: instance.entity_id.clone(),
        request_type: format!("{}_approval", instance.entity_type),
        priority: step.priority.unwrap_or_default(),
        assigned_to: execution.assigned_to_user_id,
        assigned_role: execution.assigned_role_id,
        title: format!("{}: {}", entity_title(instance), step.name),
        description: Some(
            template
                .description
                .clone()
                .unwrap_or_else(|| template.name.clone()),
        ),
        status: ApprovalStatus::Pending,
        decision: None,
        decision_reason: None,
        reviewed_by: None,
        requested_by: instance.triggered_by,
        requested_at: execution.created_at,
        reviewed_at: None,
        completed_at: None,
        company_id: instance.company_id,
    }
}

/// "Purchase order PO-0042" style label for titles and subjects.
fn entity_title(instance: &WorkflowInstance) -> String {
    let entity = EntityRef::new(
        instance.entity_type,
        instance.entity_id.clone(),
        instance.entity_snapshot.clone(),
    );
    format!("{} {}", instance.entity_type.label(), entity.display_reference())
}

pub(crate) fn status_event(
    request: &ApprovalRequest,
    instance_status: InstanceStatus,
    changed_by: Option<UserId>,
) -> ApprovalEvent {
    ApprovalEvent::ApprovalStatusChanged {
        approval_id: request.id,
        data: StatusChangedData {
            workflow_instance_id: request.workflow_instance_id,
            status: request.status,
            decision: request.decision,
            reason: request.decision_reason.clone(),
            changed_by,
            instance_status,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestEnv, role_step, user_step};
    use crate::workflow::escalation::FallbackAssigneePolicy;
    use gatekeep_types::template::{CompareOp, StepType, TriggerCondition, TriggerType};
    use serde_json::json;

    #[tokio::test]
    async fn test_create_instance_assigns_first_step() {
        let env = TestEnv::new();
        let alice = env.user("Alice");
        let template = env.save_template(vec![user_step(1, alice)]).await;

        let instance = env
            .engine
            .create_instance(&template, env.po(12000), env.requester)
            .await
            .unwrap();

        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.current_step_number, Some(1));
        let detail = env.engine.get_instance(env.requester, &instance.id).await.unwrap();
        assert_eq!(detail.step_executions.len(), 1);
        assert_eq!(detail.step_executions[0].status, StepExecutionStatus::Assigned);
        assert_eq!(detail.step_executions[0].assigned_to_user_id, Some(alice));
        assert_eq!(detail.approval_requests.len(), 1);
        assert_eq!(detail.approval_requests[0].status, ApprovalStatus::Pending);
        assert_eq!(detail.approval_requests[0].title, "Purchase order PO-12000: Step 1");

        assert_eq!(env.publisher.kinds_for(alice), vec!["approval_assigned"]);
        assert_eq!(
            env.audit.actions(),
            vec![AuditAction::InstanceCreated, AuditAction::StepActivated]
        );
        assert_eq!(env.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_role_step_has_single_open_slot() {
        let env = TestEnv::new();
        let role = env.role("Finance");
        let a = env.member("A", role);
        let b = env.member("B", role);
        let template = env.save_template(vec![role_step(1, role)]).await;

        let instance = env
            .engine
            .create_instance(&template, env.po(100), env.requester)
            .await
            .unwrap();

        let detail = env.engine.get_instance(env.requester, &instance.id).await.unwrap();
        let assigned: Vec<_> = detail
            .step_executions
            .iter()
            .filter(|e| e.status == StepExecutionStatus::Assigned)
            .collect();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].assigned_to_user_id, None);
        assert_eq!(assigned[0].assigned_role_id, Some(role));
        assert_eq!(detail.approval_requests[0].assigned_role, Some(role));
        assert_eq!(env.publisher.kinds_for(a), vec!["approval_assigned"]);
        assert_eq!(env.publisher.kinds_for(b), vec!["approval_assigned"]);
    }

    #[tokio::test]
    async fn test_required_step_without_assignee_fails_creation() {
        let env = TestEnv::new();
        let empty_role = env.role("Nobody");
        let template = env.save_template(vec![role_step(1, empty_role)]).await;

        let err = env
            .engine
            .create_instance(&template, env.po(100), env.requester)
            .await
            .unwrap_err();

        assert!(matches!(err, ApprovalError::NoEligibleAssignee(r) if r == empty_role));
        assert_eq!(env.repo.instance_count(), 0);
        assert!(env.publisher.all().is_empty());
        assert!(env.audit.entries().is_empty());
    }

    #[tokio::test]
    async fn test_optional_step_without_assignee_is_skipped() {
        let env = TestEnv::new();
        let empty_role = env.role("Nobody");
        let bob = env.user("Bob");
        let mut optional = role_step(1, empty_role);
        optional.is_required = false;
        let template = env.save_template(vec![optional, user_step(2, bob)]).await;

        let instance = env
            .engine
            .create_instance(&template, env.po(100), env.requester)
            .await
            .unwrap();

        assert_eq!(instance.current_step_number, Some(2));
        let detail = env.engine.get_instance(env.requester, &instance.id).await.unwrap();
        assert_eq!(detail.step_executions[0].status, StepExecutionStatus::Skipped);
        assert_eq!(detail.step_executions[1].assigned_to_user_id, Some(bob));
        assert!(env.audit.actions().contains(&AuditAction::StepSkipped));
    }

    #[tokio::test]
    async fn test_notification_steps_complete_on_their_own() {
        let env = TestEnv::new();
        let watcher = env.user("Watcher");
        let mut notify = user_step(1, watcher);
        notify.step_type = StepType::Notification;
        let mut notify_requester = user_step(2, watcher);
        notify_requester.step_type = StepType::Notification;
        notify_requester.assignee_user_id = None;
        let template = env.save_template(vec![notify, notify_requester]).await;

        let instance = env
            .engine
            .create_instance(&template, env.po(100), env.requester)
            .await
            .unwrap();

        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.current_step_number, None);
        let detail = env.engine.get_instance(env.requester, &instance.id).await.unwrap();
        assert!(detail.approval_requests.is_empty());
        assert!(
            detail
                .step_executions
                .iter()
                .all(|e| e.status == StepExecutionStatus::Approved)
        );

        let sent = env.notifier.sent();
        assert_eq!(sent[0].recipients, vec![watcher]);
        assert_eq!(sent[1].recipients, vec![env.requester]);
        assert!(sent[2].subject.starts_with("Approved"));
    }

    #[tokio::test]
    async fn test_parallel_rejection_short_circuits_siblings() {
        let env = TestEnv::new();
        let role = env.role("Board");
        let a = env.member("A", role);
        let b = env.member("B", role);
        let c = env.member("C", role);
        let mut step = role_step(1, role);
        step.step_type = StepType::ParallelApproval;
        let template = env.save_template(vec![step]).await;
        let instance = env
            .engine
            .create_instance(&template, env.po(50000), env.requester)
            .await
            .unwrap();
        let requests = env.requests_of(&instance.id).await;
        assert_eq!(requests.len(), 3);

        env.approve(&requests, a).await;
        let instance_mid = env.engine.get_instance(env.requester, &instance.id).await.unwrap();
        assert_eq!(instance_mid.instance.status, InstanceStatus::Running);

        env.reject(&requests, b).await;

        let detail = env.engine.get_instance(env.requester, &instance.id).await.unwrap();
        assert_eq!(detail.instance.status, InstanceStatus::Cancelled);
        assert_eq!(detail.instance.current_step_number, None);
        let slot_c = detail
            .step_executions
            .iter()
            .find(|e| e.assigned_to_user_id == Some(c))
            .unwrap();
        assert_eq!(slot_c.status, StepExecutionStatus::Skipped);
        let request_c = detail
            .approval_requests
            .iter()
            .find(|r| r.assigned_to == Some(c))
            .unwrap();
        assert_eq!(request_c.status, ApprovalStatus::Expired);
        assert!(detail.approval_requests.iter().all(|r| !r.is_open()));
    }

    #[tokio::test]
    async fn test_parallel_step_needs_every_approval() {
        let env = TestEnv::new();
        let role = env.role("Board");
        let a = env.member("A", role);
        let b = env.member("B", role);
        let mut step = role_step(1, role);
        step.step_type = StepType::ParallelApproval;
        let template = env.save_template(vec![step]).await;
        let instance = env
            .engine
            .create_instance(&template, env.po(50000), env.requester)
            .await
            .unwrap();
        let requests = env.requests_of(&instance.id).await;

        env.approve(&requests, a).await;
        assert_eq!(env.instance(&instance.id).await.status, InstanceStatus::Running);
        env.approve(&requests, b).await;
        assert_eq!(env.instance(&instance.id).await.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_optional_rejection_continues_by_default() {
        let env = TestEnv::new();
        let alice = env.user("Alice");
        let bob = env.user("Bob");
        let mut optional = user_step(1, alice);
        optional.is_required = false;
        let template = env.save_template(vec![optional, user_step(2, bob)]).await;
        let instance = env
            .engine
            .create_instance(&template, env.po(100), env.requester)
            .await
            .unwrap();

        env.reject(&env.requests_of(&instance.id).await, alice).await;

        let instance = env.instance(&instance.id).await;
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.current_step_number, Some(2));
    }

    #[tokio::test]
    async fn test_optional_rejection_cancels_when_configured() {
        let env = TestEnv::with_config(EngineConfig {
            continue_on_optional_rejection: false,
            ..EngineConfig::default()
        });
        let alice = env.user("Alice");
        let bob = env.user("Bob");
        let mut optional = user_step(1, alice);
        optional.is_required = false;
        let template = env.save_template(vec![optional, user_step(2, bob)]).await;
        let instance = env
            .engine
            .create_instance(&template, env.po(100), env.requester)
            .await
            .unwrap();

        env.reject(&env.requests_of(&instance.id).await, alice).await;

        assert_eq!(env.instance(&instance.id).await.status, InstanceStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unassignable_next_step_cancels_instance() {
        let env = TestEnv::new();
        let alice = env.user("Alice");
        let role = env.role("Directors");
        let director = env.member("Director", role);
        let template = env
            .save_template(vec![user_step(1, alice), role_step(2, role)])
            .await;
        let instance = env
            .engine
            .create_instance(&template, env.po(100), env.requester)
            .await
            .unwrap();
        env.dir.deactivate(director);

        env.approve(&env.requests_of(&instance.id).await, alice).await;

        let instance = env.instance(&instance.id).await;
        assert_eq!(instance.status, InstanceStatus::Cancelled);
        assert!(env.audit.actions().contains(&AuditAction::InstanceCancelled));
    }

    #[tokio::test]
    async fn test_expire_without_escalation_expires_instance() {
        let env = TestEnv::new();
        let alice = env.user("Alice");
        let template = env.save_template(vec![user_step(1, alice)]).await;
        let instance = env
            .engine
            .create_instance(&template, env.po(100), env.requester)
            .await
            .unwrap();
        let execution_id = env.requests_of(&instance.id).await[0].step_execution_id;

        let expired = env.engine.expire(&execution_id).await.unwrap();

        assert_eq!(expired.status, InstanceStatus::Expired);
        assert_eq!(expired.current_step_number, Some(1));
        let request = &env.requests_of(&instance.id).await[0];
        assert_eq!(request.status, ApprovalStatus::Expired);
        assert!(env.audit.actions().contains(&AuditAction::InstanceExpired));
        assert_eq!(env.publisher.kinds_for(alice).last(), Some(&"approval_status_changed"));

        let again = env.engine.expire(&execution_id).await.unwrap_err();
        assert!(matches!(again, ApprovalError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_expire_with_fallback_reassigns() {
        let env = TestEnv::new();
        let fallback_user = env.user("Fallback");
        let env = env.with_escalation(Arc::new(FallbackAssigneePolicy::new().with_default(fallback_user)));
        let alice = env.user("Alice");
        let template = env.save_template(vec![user_step(1, alice)]).await;
        let instance = env
            .engine
            .create_instance(&template, env.po(100), env.requester)
            .await
            .unwrap();
        let execution_id = env.requests_of(&instance.id).await[0].step_execution_id;

        let after = env.engine.expire(&execution_id).await.unwrap();

        assert_eq!(after.status, InstanceStatus::Running);
        let detail = env.engine.get_instance(env.requester, &instance.id).await.unwrap();
        assert_eq!(detail.step_executions.len(), 2);
        assert_eq!(detail.step_executions[0].status, StepExecutionStatus::Expired);
        assert_eq!(detail.step_executions[1].status, StepExecutionStatus::Assigned);
        assert_eq!(detail.step_executions[1].assigned_to_user_id, Some(fallback_user));
        let open: Vec<_> = detail.approval_requests.iter().filter(|r| r.is_open()).collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].assigned_to, Some(fallback_user));
        assert_eq!(env.publisher.kinds_for(fallback_user), vec!["approval_assigned"]);
    }

    #[tokio::test]
    async fn test_sweep_expires_only_overdue_steps() {
        let env = TestEnv::new();
        let alice = env.user("Alice");
        let bob = env.user("Bob");
        let mut timed = user_step(1, alice);
        timed.timeout_hours = Some(24);
        let timed_template = env.save_template(vec![timed]).await;
        let untimed_template = env.save_template(vec![user_step(1, bob)]).await;
        let timed_instance = env
            .engine
            .create_instance(&timed_template, env.po(1), env.requester)
            .await
            .unwrap();
        let untimed_instance = env
            .engine
            .create_instance(&untimed_template, env.po(2), env.requester)
            .await
            .unwrap();

        let early = env.engine.sweep_expired(Utc::now()).await.unwrap();
        assert_eq!(early, SweepReport::default());

        let later = env
            .engine
            .sweep_expired(Utc::now() + Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(later.due, 1);
        assert_eq!(later.expired, 1);
        assert_eq!(env.instance(&timed_instance.id).await.status, InstanceStatus::Expired);
        assert_eq!(env.instance(&untimed_instance.id).await.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_sweep_skips_deadline_beyond_calendar() {
        let env = TestEnv::new();
        let alice = env.user("Alice");
        let bob = env.user("Bob");
        let mut distant = user_step(1, alice);
        distant.timeout_hours = Some(1);
        let mut timed = user_step(1, bob);
        timed.timeout_hours = Some(24);
        let distant_template = env.save_template(vec![distant]).await;
        let timed_template = env.save_template(vec![timed]).await;

        let mut stuck = env
            .engine
            .create_instance(&distant_template, env.po(1), env.requester)
            .await
            .unwrap();
        let timed_instance = env
            .engine
            .create_instance(&timed_template, env.po(2), env.requester)
            .await
            .unwrap();

        // A stored run whose timeout cannot be represented as a date.
        stuck.steps[0].timeout_hours = Some(u32::MAX);
        env.repo
            .commit(&crate::repository::workflow::TransitionBatch {
                instance: Some(stuck.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        let report = env
            .engine
            .sweep_expired(Utc::now() + Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.expired, 1);
        assert_eq!(env.instance(&stuck.id).await.status, InstanceStatus::Running);
        assert_eq!(env.instance(&timed_instance.id).await.status, InstanceStatus::Expired);
    }

    #[tokio::test]
    async fn test_cancel_instance_permissions() {
        let env = TestEnv::new();
        let alice = env.user("Alice");
        let bystander = env.user("Bystander");
        let outsider = env.foreign_user("Outsider");
        let template = env.save_template(vec![user_step(1, alice)]).await;
        let instance = env
            .engine
            .create_instance(&template, env.po(100), env.requester)
            .await
            .unwrap();

        let err = env.engine.cancel_instance(&instance.id, bystander, None).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Forbidden(_)));
        let err = env.engine.cancel_instance(&instance.id, outsider, None).await.unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound));

        let cancelled = env
            .engine
            .cancel_instance(&instance.id, env.requester, Some("duplicate order".to_string()))
            .await
            .unwrap();
        assert_eq!(cancelled.status, InstanceStatus::Cancelled);
        assert_eq!(cancelled.current_step_number, None);
        assert!(cancelled.completed_at.is_some());
        let requests = env.requests_of(&instance.id).await;
        assert_eq!(requests[0].status, ApprovalStatus::Expired);

        let err = env
            .engine
            .cancel_instance(&instance.id, env.requester, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_cancel_with_permission_by_other_user() {
        let env = TestEnv::new();
        let alice = env.user("Alice");
        let admin = env.user("Admin");
        env.dir.grant_permission(admin, permissions::CANCEL_WORKFLOW);
        let template = env.save_template(vec![user_step(1, alice)]).await;
        let instance = env
            .engine
            .create_instance(&template, env.po(100), env.requester)
            .await
            .unwrap();

        let cancelled = env.engine.cancel_instance(&instance.id, admin, None).await.unwrap();
        assert_eq!(cancelled.status, InstanceStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_trigger_workflow_matches_threshold_templates() {
        let env = TestEnv::new();
        let alice = env.user("Alice");
        let mut template = env.template(vec![user_step(1, alice)]);
        template.trigger_type = TriggerType::Threshold;
        template.trigger_conditions = Some(TriggerCondition::compare("total", CompareOp::Gt, json!(10000)));
        env.repo.insert_template(template.clone());
        let mut manual = env.template(vec![user_step(1, alice)]);
        manual.trigger_type = TriggerType::Manual;
        env.repo.insert_template(manual);

        let started = env
            .engine
            .trigger_workflow(env.po(12000), TriggerEvent::Created, env.requester)
            .await
            .unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].template_id, template.id);

        let none = env
            .engine
            .trigger_workflow(env.po(500), TriggerEvent::Created, env.requester)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_manual_trigger_requires_permission() {
        let env = TestEnv::new();
        let alice = env.user("Alice");
        let template = env.save_template(vec![user_step(1, alice)]).await;
        let clerk = env.user("Clerk");

        let err = env
            .engine
            .trigger_workflow(env.po(100), TriggerEvent::Manual, clerk)
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Forbidden(_)));

        let started = env
            .engine
            .start_workflow(&template.id, env.po(100), env.requester)
            .await
            .unwrap();
        assert_eq!(started.template_id, template.id);
    }

    #[tokio::test]
    async fn test_trigger_for_stored_entity_uses_snapshot() {
        let env = TestEnv::new();
        let alice = env.user("Alice");
        let mut template = env.template(vec![user_step(1, alice)]);
        template.trigger_type = TriggerType::OnUpdate;
        env.repo.insert_template(template);
        let store = crate::testing::FakeEntityStore::default();
        store.insert(EntityType::PurchaseOrder, "po-7", json!({"number": "PO-7", "total": 70}));

        let started = env
            .engine
            .trigger_for_stored_entity(&store, EntityType::PurchaseOrder, "po-7", TriggerEvent::Updated, env.requester)
            .await
            .unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].entity_snapshot["number"], "PO-7");

        let err = env
            .engine
            .trigger_for_stored_entity(&store, EntityType::PurchaseOrder, "po-8", TriggerEvent::Updated, env.requester)
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound));
    }

    #[tokio::test]
    async fn test_failed_commit_runs_no_side_effects() {
        let env = TestEnv::new();
        let alice = env.user("Alice");
        let template = env.save_template(vec![user_step(1, alice)]).await;
        env.repo.set_fail_commit(true);

        let err = env
            .engine
            .create_instance(&template, env.po(100), env.requester)
            .await
            .unwrap_err();

        assert!(matches!(err, ApprovalError::Storage(_)));
        assert!(env.publisher.all().is_empty());
        assert!(env.audit.entries().is_empty());
        assert!(env.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_instance_is_invisible_to_other_company() {
        let env = TestEnv::new();
        let alice = env.user("Alice");
        let outsider = env.foreign_user("Outsider");
        let template = env.save_template(vec![user_step(1, alice)]).await;
        let instance = env
            .engine
            .create_instance(&template, env.po(100), env.requester)
            .await
            .unwrap();

        assert!(matches!(
            env.engine.get_instance(outsider, &instance.id).await,
            Err(ApprovalError::NotFound)
        ));
        let history = env.engine.instance_history(env.requester, &instance.id).await.unwrap();
        assert_eq!(history[0].action, AuditAction::InstanceCreated);
    }
}
