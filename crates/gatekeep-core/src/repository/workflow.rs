//! Workflow repository trait definition.
//!
//! Covers templates, instances, step executions, approval requests and
//! comments. State-machine transitions are persisted through
//! [`WorkflowRepository::commit`], which applies a whole [`TransitionBatch`]
//! atomically.

use gatekeep_types::approval::{ApprovalComment, ApprovalFilter, ApprovalRequest, ApprovalStats};
use gatekeep_types::entity::EntityType;
use gatekeep_types::error::RepositoryError;
use gatekeep_types::ids::CompanyId;
use gatekeep_types::instance::{StepExecution, WorkflowInstance};
use gatekeep_types::template::WorkflowTemplate;
use uuid::Uuid;

/// Every row touched by one state-machine transition.
///
/// Instances, executions and requests are upserted by id; comments are
/// appended. Implementations must apply the batch in a single transaction:
/// either all rows land or none do.
#[derive(Debug, Clone, Default)]
pub struct TransitionBatch {
    pub instance: Option<WorkflowInstance>,
    pub step_executions: Vec<StepExecution>,
    pub requests: Vec<ApprovalRequest>,
    pub comments: Vec<ApprovalComment>,
}

impl TransitionBatch {
    pub fn is_empty(&self) -> bool {
        self.instance.is_none()
            && self.step_executions.is_empty()
            && self.requests.is_empty()
            && self.comments.is_empty()
    }
}

/// Filter criteria for listing templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateFilter {
    pub entity_type: Option<EntityType>,
    /// Only return templates with `is_active = true`.
    pub active_only: bool,
}

/// Repository trait for workflow persistence.
///
/// Implementations live in gatekeep-infra (e.g., SqliteWorkflowRepository).
/// Lookups by id are not company-scoped; the engine checks ownership so an
/// id from another company looks exactly like a missing one.
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    /// Insert or replace a template (matched by id).
    fn save_template(
        &self,
        template: &WorkflowTemplate,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_template(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowTemplate>, RepositoryError>> + Send;

    /// List a company's templates, ordered by name.
    fn list_templates(
        &self,
        company_id: &CompanyId,
        filter: &TemplateFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowTemplate>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances and step executions
    // -----------------------------------------------------------------------

    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// All executions of an instance, ordered by step number then creation.
    fn list_step_executions(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    fn get_step_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StepExecution>, RepositoryError>> + Send;

    /// Executions still waiting on a decision across all companies, oldest
    /// first. Drives the expiry sweep.
    fn list_open_step_executions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Approval requests and comments
    // -----------------------------------------------------------------------

    fn get_request(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ApprovalRequest>, RepositoryError>> + Send;

    /// Every request of an instance, ordered by step number then request time.
    fn list_requests_for_instance(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ApprovalRequest>, RepositoryError>> + Send;

    /// A company's requests matching the filter, newest first.
    fn list_requests(
        &self,
        company_id: &CompanyId,
        filter: &ApprovalFilter,
    ) -> impl std::future::Future<Output = Result<Vec<ApprovalRequest>, RepositoryError>> + Send;

    fn request_stats(
        &self,
        company_id: &CompanyId,
    ) -> impl std::future::Future<Output = Result<ApprovalStats, RepositoryError>> + Send;

    /// Comments of a request, oldest first.
    fn list_comments(
        &self,
        request_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ApprovalComment>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Apply every row of the batch atomically.
    fn commit(
        &self,
        batch: &TransitionBatch,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
