//! The approval review protocol.
//!
//! Every review runs its preconditions in a fixed order so callers get a
//! precise reason for a refusal:
//!
//! 1. the request exists in the reviewer's company, else `NotFound`
//! 2. the request is still open, else `AlreadyResolved`
//! 3. the reviewer may decide it, else `Forbidden`
//!
//! The decision, the optional notes comment and any resulting step
//! activation are committed together; audit entries and events follow.

use chrono::Utc;
use gatekeep_types::approval::{
    ApprovalComment, ApprovalDecision, ApprovalFilter, ApprovalRequest, ApprovalStats,
    ApprovalStatus, BulkAction, ReviewSubmission,
};
use gatekeep_types::audit::{AuditAction, AuditEntry};
use gatekeep_types::error::{ApprovalError, ValidationError};
use gatekeep_types::event::{ApprovalEvent, CommentedData};
use gatekeep_types::identity::{User, permissions};
use gatekeep_types::ids::{CompanyId, UserId};
use gatekeep_types::instance::StepExecutionStatus;
use gatekeep_types::template::WorkflowTemplate;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::aggregate::{Effects, InstanceAggregate};
use super::engine::{REQUEST_RECORD, STEP_RECORD, WorkflowEngine, step_of};
use crate::directory::{IdentityDirectory, PermissionChecker};
use crate::repository::audit::AuditRepository;
use crate::repository::workflow::{TransitionBatch, WorkflowRepository};

/// Characters of a comment repeated in `approval_commented` events.
const COMMENT_PREVIEW_CHARS: usize = 120;

/// Per-id outcome of [`WorkflowEngine::bulk_action`].
#[derive(Debug, Clone, Serialize)]
pub struct BulkItemResult {
    pub approval_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ApprovalStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parse the restricted bulk vocabulary (`approved`, `rejected`, `reopen`).
pub fn parse_bulk_action(value: &str) -> Result<BulkAction, ApprovalError> {
    match value.trim().to_lowercase().as_str() {
        "approved" | "approve" => Ok(BulkAction::Approved),
        "rejected" | "reject" => Ok(BulkAction::Rejected),
        "reopen" => Ok(BulkAction::Reopen),
        other => Err(ApprovalError::UnsupportedDecision(other.to_string())),
    }
}

/// A request loaded for a reviewer, with its instance and template.
struct ReviewContext {
    reviewer: User,
    agg: InstanceAggregate,
    template: WorkflowTemplate,
    request_id: Uuid,
    execution_id: Uuid,
}

impl<R, A, D> WorkflowEngine<R, A, D>
where
    R: WorkflowRepository,
    A: AuditRepository,
    D: IdentityDirectory + PermissionChecker,
{
    // -----------------------------------------------------------------------
    // Decisions
    // -----------------------------------------------------------------------

    /// Apply a reviewer's decision to one approval request.
    pub async fn review(
        &self,
        approval_id: &Uuid,
        reviewer_id: UserId,
        submission: ReviewSubmission,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let reviewer = self.company_member(&reviewer_id).await?;
        let probe = self.visible_request(&reviewer.company_id, approval_id).await?;

        let _guard = self.locks.acquire(probe.workflow_instance_id).await;
        let mut ctx = self.review_context(reviewer, approval_id).await?;
        let mut fx = Effects::default();

        match submission.decision {
            ApprovalDecision::Approved
            | ApprovalDecision::ConditionalApproval
            | ApprovalDecision::Rejected => {
                self.record_decision(&mut ctx, &mut fx, &submission);
                self.advance_aggregate(&mut ctx.agg, &mut fx, &ctx.template, Some(reviewer_id))
                    .await?;
            }
            ApprovalDecision::MoreInfoRequired => {
                self.request_more_info(&mut ctx, &mut fx, &submission);
            }
            ApprovalDecision::Escalated | ApprovalDecision::Delegated => {
                self.reassign_request(&mut ctx, &mut fx, &submission).await?;
            }
        }

        if let Some(notes) = submission.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            ctx.agg.push_comment(ApprovalComment {
                id: Uuid::now_v7(),
                approval_request_id: ctx.request_id,
                author_id: reviewer_id,
                comment: notes.to_string(),
                is_internal: false,
                created_at: Utc::now(),
            });
        }

        self.finish(&ctx.agg, fx).await?;

        let request = ctx
            .agg
            .request(ctx.request_id)
            .cloned()
            .ok_or(ApprovalError::NotFound)?;
        tracing::info!(
            approval_id = %request.id,
            reviewer = %reviewer_id,
            decision = %submission.decision,
            status = %request.status,
            instance_status = %ctx.agg.instance.status,
            "review recorded"
        );
        Ok(request)
    }

    /// Mark a pending request as being looked at.
    pub async fn start_review(
        &self,
        approval_id: &Uuid,
        reviewer_id: UserId,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.requeue(approval_id, reviewer_id, ApprovalStatus::Pending, ApprovalStatus::InReview)
            .await
    }

    /// Put a `more_info_required` request back into the reviewer's queue.
    pub async fn reopen(
        &self,
        approval_id: &Uuid,
        reviewer_id: UserId,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.requeue(
            approval_id,
            reviewer_id,
            ApprovalStatus::MoreInfoRequired,
            ApprovalStatus::Pending,
        )
        .await
    }

    /// Apply one restricted action to many requests.
    ///
    /// Each id is reviewed on its own; a failure is reported in its slot and
    /// does not stop the batch.
    pub async fn bulk_action(
        &self,
        approval_ids: &[Uuid],
        reviewer_id: UserId,
        action: BulkAction,
        reason: Option<String>,
    ) -> Vec<BulkItemResult> {
        let mut results = Vec::with_capacity(approval_ids.len());
        for approval_id in approval_ids {
            let outcome = match action {
                BulkAction::Approved | BulkAction::Rejected => {
                    let decision = if action == BulkAction::Approved {
                        ApprovalDecision::Approved
                    } else {
                        ApprovalDecision::Rejected
                    };
                    let mut submission = ReviewSubmission::new(decision);
                    submission.reason = reason.clone();
                    self.review(approval_id, reviewer_id, submission).await
                }
                BulkAction::Reopen => self.reopen(approval_id, reviewer_id).await,
            };

            results.push(match outcome {
                Ok(request) => BulkItemResult {
                    approval_id: *approval_id,
                    success: true,
                    status: Some(request.status),
                    error: None,
                },
                Err(e) => BulkItemResult {
                    approval_id: *approval_id,
                    success: false,
                    status: None,
                    error: Some(e.to_string()),
                },
            });
        }

        let failed = results.iter().filter(|r| !r.success).count();
        tracing::info!(
            reviewer = %reviewer_id,
            action = ?action,
            total = results.len(),
            failed,
            "bulk action finished"
        );
        results
    }

    // -----------------------------------------------------------------------
    // Comments
    // -----------------------------------------------------------------------

    /// Append a comment. Any member of the owning company may comment, in
    /// any request status.
    pub async fn add_comment(
        &self,
        approval_id: &Uuid,
        author_id: UserId,
        text: &str,
        is_internal: bool,
    ) -> Result<ApprovalComment, ApprovalError> {
        let author = self.company_member(&author_id).await?;
        let request = self.visible_request(&author.company_id, approval_id).await?;

        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::single("comment must not be empty").into());
        }

        let comment = ApprovalComment {
            id: Uuid::now_v7(),
            approval_request_id: request.id,
            author_id,
            comment: text.to_string(),
            is_internal,
            created_at: Utc::now(),
        };
        self.repo
            .commit(&TransitionBatch {
                comments: vec![comment.clone()],
                ..TransitionBatch::default()
            })
            .await?;

        self.audit
            .record(
                AuditEntry::new(
                    request.company_id,
                    REQUEST_RECORD,
                    request.id,
                    AuditAction::CommentAdded,
                    Some(author_id),
                )
                .with_states(
                    None,
                    Some(json!({"comment_id": comment.id, "is_internal": is_internal})),
                ),
            )
            .await;

        let mut targets = self.audience(&request).await;
        targets.retain(|u| *u != author_id);
        if !targets.is_empty() {
            let event = ApprovalEvent::ApprovalCommented {
                approval_id: request.id,
                data: CommentedData {
                    comment_id: comment.id,
                    author_id,
                    is_internal,
                    preview: comment.comment.chars().take(COMMENT_PREVIEW_CHARS).collect(),
                },
            };
            self.publisher.publish(&event, request.company_id, Some(&targets));
        }

        tracing::debug!(approval_id = %request.id, author = %author_id, is_internal, "comment added");
        Ok(comment)
    }

    /// Comments of a request, oldest first.
    ///
    /// Internal comments are only shown to the requester, the assignee(s)
    /// and holders of `view_internal_comments`.
    pub async fn list_comments(
        &self,
        approval_id: &Uuid,
        viewer_id: UserId,
    ) -> Result<Vec<ApprovalComment>, ApprovalError> {
        let viewer = self.company_member(&viewer_id).await?;
        let request = self.visible_request(&viewer.company_id, approval_id).await?;
        let comments = self.repo.list_comments(&request.id).await?;

        let sees_internal = self.audience(&request).await.contains(&viewer_id)
            || self
                .directory
                .has_permission(&viewer_id, permissions::VIEW_INTERNAL_COMMENTS)
                .await?;
        Ok(comments
            .into_iter()
            .filter(|c| sees_internal || !c.is_internal)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_approval_request(
        &self,
        viewer_id: UserId,
        approval_id: &Uuid,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let viewer = self.company_member(&viewer_id).await?;
        self.visible_request(&viewer.company_id, approval_id).await
    }

    /// A company's requests, newest first. The limit is clamped to
    /// `max_list_limit`.
    pub async fn get_approval_requests(
        &self,
        company_id: &CompanyId,
        filter: &ApprovalFilter,
    ) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        let max = self.config.max_list_limit;
        let mut filter = filter.clone();
        filter.limit = Some(filter.limit.map_or(max, |l| l.clamp(1, max)));
        Ok(self.repo.list_requests(company_id, &filter).await?)
    }

    pub async fn get_approval_stats(
        &self,
        company_id: &CompanyId,
    ) -> Result<ApprovalStats, ApprovalError> {
        Ok(self.repo.request_stats(company_id).await?)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn visible_request(
        &self,
        company_id: &CompanyId,
        approval_id: &Uuid,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.repo
            .get_request(approval_id)
            .await?
            .filter(|r| r.company_id == *company_id)
            .ok_or(ApprovalError::NotFound)
    }

    /// Reload under the instance lock and run the ordered preconditions.
    async fn review_context(
        &self,
        reviewer: User,
        approval_id: &Uuid,
    ) -> Result<ReviewContext, ApprovalError> {
        let request = self.visible_request(&reviewer.company_id, approval_id).await?;
        let agg = self.load_aggregate(&request.workflow_instance_id).await?;

        let current = agg.request(request.id).ok_or(ApprovalError::NotFound)?;
        if !current.is_open() || agg.instance.is_terminal() {
            return Err(ApprovalError::AlreadyResolved);
        }
        let execution = agg
            .execution(current.step_execution_id)
            .cloned()
            .ok_or(ApprovalError::NotFound)?;
        if !execution.is_open() {
            return Err(ApprovalError::AlreadyResolved);
        }

        let template = self.template_of(&agg.instance).await?;
        let step = step_of(&template, execution.step_number)?;
        let eligible = self
            .resolver()
            .is_eligible_reviewer(&execution, step, &reviewer.id, &reviewer.company_id)
            .await?;
        if !eligible {
            return Err(ApprovalError::Forbidden(
                "reviewer is not assigned to this request".to_string(),
            ));
        }

        Ok(ReviewContext {
            reviewer,
            request_id: request.id,
            execution_id: execution.id,
            agg,
            template,
        })
    }

    /// Final decisions: approved, conditional_approval, rejected.
    fn record_decision(&self, ctx: &mut ReviewContext, fx: &mut Effects, submission: &ReviewSubmission) {
        let now = Utc::now();
        let reviewer_id = ctx.reviewer.id;
        let approved = submission.decision != ApprovalDecision::Rejected;

        let mut before = None;
        if let Some(execution) = ctx.agg.execution_mut(ctx.execution_id) {
            before = Some(json!({"status": execution.status}));
            execution.status = if approved {
                StepExecutionStatus::Approved
            } else {
                StepExecutionStatus::Rejected
            };
            execution.decision = Some(submission.decision);
            execution.decided_by = Some(reviewer_id);
            execution.decision_reason = submission.reason.clone();
            execution.decided_at = Some(now);
        }
        if let Some(request) = ctx.agg.request_mut(ctx.request_id) {
            request.status = if approved {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Rejected
            };
            request.decision = Some(submission.decision);
            request.decision_reason = submission.reason.clone();
            request.reviewed_by = Some(reviewer_id);
            request.reviewed_at = Some(now);
            request.completed_at = Some(now);
        }
        fx.status_changed(ctx.request_id, Some(reviewer_id));
        fx.audit(
            AuditEntry::new(
                ctx.agg.instance.company_id,
                STEP_RECORD,
                ctx.execution_id,
                AuditAction::DecisionRecorded,
                Some(reviewer_id),
            )
            .with_states(
                before,
                Some(json!({
                    "decision": submission.decision,
                    "reason": submission.reason,
                    "approval_id": ctx.request_id,
                })),
            ),
        );
    }

    /// The request waits on the requester; the execution stays with the
    /// reviewer who asked.
    fn request_more_info(&self, ctx: &mut ReviewContext, fx: &mut Effects, submission: &ReviewSubmission) {
        let now = Utc::now();
        let reviewer_id = ctx.reviewer.id;

        if let Some(execution) = ctx.agg.execution_mut(ctx.execution_id) {
            execution.status = StepExecutionStatus::Assigned;
            execution.decision = Some(ApprovalDecision::MoreInfoRequired);
            execution.decision_reason = submission.reason.clone();
            execution.assigned_to_user_id.get_or_insert(reviewer_id);
        }
        if let Some(request) = ctx.agg.request_mut(ctx.request_id) {
            request.status = ApprovalStatus::MoreInfoRequired;
            request.decision = Some(ApprovalDecision::MoreInfoRequired);
            request.decision_reason = submission.reason.clone();
            request.reviewed_by = Some(reviewer_id);
            request.reviewed_at = Some(now);
            request.assigned_to.get_or_insert(reviewer_id);
        }
        fx.status_changed(ctx.request_id, Some(reviewer_id));
        fx.audit(
            AuditEntry::new(
                ctx.agg.instance.company_id,
                STEP_RECORD,
                ctx.execution_id,
                AuditAction::DecisionRecorded,
                Some(reviewer_id),
            )
            .with_states(
                None,
                Some(json!({
                    "decision": ApprovalDecision::MoreInfoRequired,
                    "reason": submission.reason,
                    "approval_id": ctx.request_id,
                })),
            ),
        );
    }

    /// Escalated / delegated: hand the open request to another member.
    async fn reassign_request(
        &self,
        ctx: &mut ReviewContext,
        fx: &mut Effects,
        submission: &ReviewSubmission,
    ) -> Result<(), ApprovalError> {
        let reviewer_id = ctx.reviewer.id;
        let target = submission.delegate_to.ok_or_else(|| {
            ValidationError::single(format!("{} needs delegate_to", submission.decision))
        })?;
        if target == reviewer_id {
            return Err(ValidationError::single("cannot delegate a request to yourself").into());
        }
        self.resolver()
            .require_member(&target, &ctx.reviewer.company_id)
            .await?;

        let step_number = ctx
            .agg
            .execution(ctx.execution_id)
            .map(|e| e.step_number)
            .ok_or(ApprovalError::NotFound)?;
        let step = step_of(&ctx.template, step_number)?;
        if step.allow_parallel()
            && ctx
                .agg
                .executions_for_step(step.step_number)
                .any(|e| e.is_open() && e.assigned_to_user_id == Some(target))
        {
            return Err(ValidationError::single(
                "the delegate already holds a slot on this step",
            )
            .into());
        }

        let mut previous = None;
        if let Some(execution) = ctx.agg.execution_mut(ctx.execution_id) {
            previous = execution.assigned_to_user_id;
            execution.status = StepExecutionStatus::Assigned;
            execution.assigned_to_user_id = Some(target);
            execution.decision = Some(submission.decision);
            execution.decision_reason = submission.reason.clone();
        }
        if let Some(request) = ctx.agg.request_mut(ctx.request_id) {
            request.status = ApprovalStatus::Pending;
            request.assigned_to = Some(target);
            request.decision = Some(submission.decision);
            request.decision_reason = submission.reason.clone();
            request.reviewed_by = Some(reviewer_id);
            request.reviewed_at = Some(Utc::now());
        }

        fx.status_changed(ctx.request_id, Some(reviewer_id));
        fx.audit(
            AuditEntry::new(
                ctx.agg.instance.company_id,
                STEP_RECORD,
                ctx.execution_id,
                AuditAction::StepReassigned,
                Some(reviewer_id),
            )
            .with_states(
                Some(json!({"assigned_to": previous})),
                Some(json!({
                    "assigned_to": target,
                    "decision": submission.decision,
                    "reason": submission.reason,
                })),
            ),
        );
        if let Some(request) = ctx.agg.request(ctx.request_id).cloned() {
            self.announce_assignment(fx, &ctx.agg.instance, &request, vec![target]);
        }
        Ok(())
    }

    /// Move an open request between two open statuses.
    async fn requeue(
        &self,
        approval_id: &Uuid,
        reviewer_id: UserId,
        from: ApprovalStatus,
        to: ApprovalStatus,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let reviewer = self.company_member(&reviewer_id).await?;
        let probe = self.visible_request(&reviewer.company_id, approval_id).await?;

        let _guard = self.locks.acquire(probe.workflow_instance_id).await;
        let mut ctx = self.review_context(reviewer, approval_id).await?;
        let current = ctx
            .agg
            .request(ctx.request_id)
            .map(|r| r.status)
            .ok_or(ApprovalError::NotFound)?;
        if current != from {
            return Err(ApprovalError::InvalidTransition(format!(
                "request is {current}, expected {from}"
            )));
        }

        if let Some(request) = ctx.agg.request_mut(ctx.request_id) {
            request.status = to;
        }
        let mut fx = Effects::default();
        fx.status_changed(ctx.request_id, Some(reviewer_id));
        if to == ApprovalStatus::Pending {
            fx.audit(
                AuditEntry::new(
                    ctx.agg.instance.company_id,
                    REQUEST_RECORD,
                    ctx.request_id,
                    AuditAction::RequestReopened,
                    Some(reviewer_id),
                )
                .with_states(Some(json!({"status": from})), Some(json!({"status": to}))),
            );
        }
        self.finish(&ctx.agg, fx).await?;

        ctx.agg
            .request(ctx.request_id)
            .cloned()
            .ok_or(ApprovalError::NotFound)
    }
}
