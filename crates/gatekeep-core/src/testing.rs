//! In-memory fakes of every port, shared by the unit tests of this crate.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use gatekeep_types::approval::{
    ApprovalComment, ApprovalDecision, ApprovalFilter, ApprovalRequest, ApprovalStats,
    ReviewSubmission,
};
use gatekeep_types::audit::{AuditAction, AuditEntry};
use gatekeep_types::config::EngineConfig;
use gatekeep_types::entity::{EntityRef, EntityType};
use gatekeep_types::error::RepositoryError;
use gatekeep_types::event::ApprovalEvent;
use gatekeep_types::identity::{Role, User, permissions};
use gatekeep_types::ids::{CompanyId, RoleId, UserId};
use gatekeep_types::instance::{
    InstanceStatus, StepExecution, StepExecutionStatus, WorkflowInstance,
};
use gatekeep_types::template::{
    AssigneeType, StepDefinition, StepType, TriggerType, WorkflowTemplate,
};
use serde_json::json;
use uuid::Uuid;

use crate::directory::{
    EntityStore, IdentityDirectory, Notifier, OutboundNotification, PermissionChecker,
};
use crate::event::EventPublisher;
use crate::repository::audit::AuditRepository;
use crate::repository::workflow::{TemplateFilter, TransitionBatch, WorkflowRepository};
use crate::workflow::engine::WorkflowEngine;
use crate::workflow::escalation::EscalationPolicy;

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn user_step(step_number: u32, user_id: UserId) -> StepDefinition {
    StepDefinition {
        step_number,
        name: format!("Step {step_number}"),
        step_type: StepType::Approval,
        assignee_type: AssigneeType::User,
        assignee_user_id: Some(user_id),
        assignee_role_id: None,
        is_required: true,
        timeout_hours: None,
        priority: None,
    }
}

pub fn role_step(step_number: u32, role_id: RoleId) -> StepDefinition {
    StepDefinition {
        assignee_type: AssigneeType::Role,
        assignee_user_id: None,
        assignee_role_id: Some(role_id),
        ..user_step(step_number, UserId::new())
    }
}

pub fn template_with_steps(steps: Vec<StepDefinition>) -> WorkflowTemplate {
    let now = Utc::now();
    WorkflowTemplate {
        id: Uuid::now_v7(),
        company_id: CompanyId::new(),
        name: "Purchase order approval".to_string(),
        description: None,
        entity_type: EntityType::PurchaseOrder,
        trigger_type: TriggerType::Manual,
        trigger_conditions: None,
        is_active: true,
        steps,
        created_by: UserId::new(),
        created_at: now,
        updated_at: now,
    }
}

pub fn sample_instance() -> WorkflowInstance {
    WorkflowInstance {
        id: Uuid::now_v7(),
        template_id: Uuid::now_v7(),
        entity_type: EntityType::PurchaseOrder,
        entity_id: "po-1".to_string(),
        entity_snapshot: json!({"number": "PO-1", "total": 100}),
        status: InstanceStatus::Running,
        current_step_number: Some(1),
        steps: Vec::new(),
        triggered_by: UserId::new(),
        company_id: CompanyId::new(),
        created_at: Utc::now(),
        completed_at: None,
    }
}

pub fn open_execution(step_number: u32, assigned_to: Option<UserId>) -> StepExecution {
    StepExecution {
        id: Uuid::now_v7(),
        instance_id: Uuid::now_v7(),
        step_number,
        status: StepExecutionStatus::Assigned,
        assigned_to_user_id: assigned_to,
        assigned_role_id: None,
        decided_by: None,
        decision: None,
        decision_reason: None,
        created_at: Utc::now(),
        decided_at: None,
    }
}

// ---------------------------------------------------------------------------
// Workflow repository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct WorkflowState {
    templates: Vec<WorkflowTemplate>,
    instances: Vec<WorkflowInstance>,
    executions: Vec<StepExecution>,
    requests: Vec<ApprovalRequest>,
    comments: Vec<ApprovalComment>,
    fail_commit: bool,
}

fn upsert<T>(rows: &mut Vec<T>, row: T, same: impl Fn(&T) -> bool) {
    match rows.iter_mut().find(|r| same(r)) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}

#[derive(Clone, Default)]
pub struct InMemoryWorkflowRepository {
    state: Arc<Mutex<WorkflowState>>,
}

impl InMemoryWorkflowRepository {
    pub fn insert_template(&self, template: WorkflowTemplate) {
        let mut state = self.state.lock().unwrap();
        let id = template.id;
        upsert(&mut state.templates, template, |t| t.id == id);
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.state.lock().unwrap().fail_commit = fail;
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_template(&self, template: &WorkflowTemplate) -> Result<(), RepositoryError> {
        self.insert_template(template.clone());
        Ok(())
    }

    async fn get_template(&self, id: &Uuid) -> Result<Option<WorkflowTemplate>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.templates.iter().find(|t| t.id == *id).cloned())
    }

    async fn list_templates(
        &self,
        company_id: &CompanyId,
        filter: &TemplateFilter,
    ) -> Result<Vec<WorkflowTemplate>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut templates: Vec<WorkflowTemplate> = state
            .templates
            .iter()
            .filter(|t| t.company_id == *company_id)
            .filter(|t| filter.entity_type.is_none_or(|e| t.entity_type == e))
            .filter(|t| !filter.active_only || t.is_active)
            .cloned()
            .collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.instances.iter().find(|i| i.id == *id).cloned())
    }

    async fn list_step_executions(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut executions: Vec<StepExecution> = state
            .executions
            .iter()
            .filter(|e| e.instance_id == *instance_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.step_number);
        Ok(executions)
    }

    async fn get_step_execution(&self, id: &Uuid) -> Result<Option<StepExecution>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.executions.iter().find(|e| e.id == *id).cloned())
    }

    async fn list_open_step_executions(&self) -> Result<Vec<StepExecution>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .executions
            .iter()
            .filter(|e| e.is_open())
            .cloned()
            .collect())
    }

    async fn get_request(&self, id: &Uuid) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.requests.iter().find(|r| r.id == *id).cloned())
    }

    async fn list_requests_for_instance(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut requests: Vec<ApprovalRequest> = state
            .requests
            .iter()
            .filter(|r| r.workflow_instance_id == *instance_id)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.step_number);
        Ok(requests)
    }

    async fn list_requests(
        &self,
        company_id: &CompanyId,
        filter: &ApprovalFilter,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .requests
            .iter()
            .rev()
            .filter(|r| r.company_id == *company_id)
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .filter(|r| filter.assigned_to.is_none_or(|u| r.assigned_to == Some(u)))
            .filter(|r| filter.assigned_role.is_none_or(|role| r.assigned_role == Some(role)))
            .filter(|r| filter.entity_type.is_none_or(|e| r.entity_type == e))
            .filter(|r| filter.priority.is_none_or(|p| r.priority == p))
            .filter(|r| {
                filter
                    .workflow_instance_id
                    .is_none_or(|id| r.workflow_instance_id == id)
            })
            .take(filter.limit.map_or(usize::MAX, |l| l as usize))
            .cloned()
            .collect())
    }

    async fn request_stats(&self, company_id: &CompanyId) -> Result<ApprovalStats, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut stats = ApprovalStats::default();
        for request in state.requests.iter().filter(|r| r.company_id == *company_id) {
            stats.total += 1;
            *stats.by_status.entry(request.status).or_default() += 1;
        }
        Ok(stats)
    }

    async fn list_comments(&self, request_id: &Uuid) -> Result<Vec<ApprovalComment>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .comments
            .iter()
            .filter(|c| c.approval_request_id == *request_id)
            .cloned()
            .collect())
    }

    async fn commit(&self, batch: &TransitionBatch) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_commit {
            return Err(RepositoryError::Query("database is locked".to_string()));
        }
        if let Some(instance) = &batch.instance {
            upsert(&mut state.instances, instance.clone(), |i| i.id == instance.id);
        }
        for execution in &batch.step_executions {
            upsert(&mut state.executions, execution.clone(), |e| e.id == execution.id);
        }
        for request in &batch.requests {
            upsert(&mut state.requests, request.clone(), |r| r.id == request.id);
        }
        state.comments.extend(batch.comments.iter().cloned());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Audit repository
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct InMemoryAuditRepository {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
    failing: Arc<Mutex<bool>>,
}

impl InMemoryAuditRepository {
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.entries().into_iter().map(|e| e.action).collect()
    }
}

impl AuditRepository for InMemoryAuditRepository {
    async fn append(&self, entry: &AuditEntry) -> Result<(), RepositoryError> {
        if *self.failing.lock().unwrap() {
            return Err(RepositoryError::Connection);
        }
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn list_for_entity(
        &self,
        company_id: &CompanyId,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>, RepositoryError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                e.company_id == *company_id
                    && e.entity_type == entity_type
                    && e.entity_id == entity_id
            })
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DirectoryState {
    users: Vec<User>,
    roles: Vec<Role>,
    grants: Vec<(UserId, RoleId)>,
    current_roles: HashMap<UserId, RoleId>,
    permissions: HashMap<UserId, HashSet<String>>,
}

#[derive(Clone, Default)]
pub struct FakeDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl FakeDirectory {
    pub fn add_user(&self, company_id: CompanyId, name: &str) -> UserId {
        let id = UserId::new();
        self.state.lock().unwrap().users.push(User {
            id,
            company_id,
            display_name: name.to_string(),
            email: Some(format!("{}@example.com", name.to_lowercase())),
            is_active: true,
        });
        id
    }

    pub fn deactivate(&self, user_id: UserId) {
        let mut state = self.state.lock().unwrap();
        if let Some(user) = state.users.iter_mut().find(|u| u.id == user_id) {
            user.is_active = false;
        }
    }

    pub fn add_role(&self, company_id: CompanyId, name: &str) -> RoleId {
        let id = RoleId::new();
        self.state.lock().unwrap().roles.push(Role {
            id,
            company_id,
            name: name.to_string(),
        });
        id
    }

    pub fn grant_role(&self, user_id: UserId, role_id: RoleId) {
        self.state.lock().unwrap().grants.push((user_id, role_id));
    }

    pub fn set_current_role(&self, user_id: UserId, role_id: RoleId) {
        self.state
            .lock()
            .unwrap()
            .current_roles
            .insert(user_id, role_id);
    }

    pub fn grant_permission(&self, user_id: UserId, permission: &str) {
        self.state
            .lock()
            .unwrap()
            .permissions
            .entry(user_id)
            .or_default()
            .insert(permission.to_string());
    }
}

impl IdentityDirectory for FakeDirectory {
    async fn get_user(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.users.iter().find(|u| u.id == *id).cloned())
    }

    async fn list_users_with_role(
        &self,
        role_id: &RoleId,
        company_id: &CompanyId,
    ) -> Result<Vec<User>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .users
            .iter()
            .filter(|u| u.company_id == *company_id)
            .filter(|u| state.grants.contains(&(u.id, *role_id)))
            .cloned()
            .collect())
    }

    async fn get_current_role(&self, user_id: &UserId) -> Result<Option<RoleId>, RepositoryError> {
        Ok(self.state.lock().unwrap().current_roles.get(user_id).copied())
    }

    async fn get_role(&self, id: &RoleId) -> Result<Option<Role>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.roles.iter().find(|r| r.id == *id).cloned())
    }
}

impl PermissionChecker for FakeDirectory {
    async fn has_permission(&self, user_id: &UserId, permission: &str) -> Result<bool, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .permissions
            .get(user_id)
            .is_some_and(|p| p.contains(permission)))
    }
}

#[derive(Clone, Default)]
pub struct FakeEntityStore {
    entities: Arc<Mutex<HashMap<(EntityType, String), serde_json::Value>>>,
}

impl FakeEntityStore {
    pub fn insert(&self, entity_type: EntityType, entity_id: &str, snapshot: serde_json::Value) {
        self.entities
            .lock()
            .unwrap()
            .insert((entity_type, entity_id.to_string()), snapshot);
    }
}

impl EntityStore for FakeEntityStore {
    async fn get_snapshot(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<serde_json::Value>, RepositoryError> {
        Ok(self
            .entities
            .lock()
            .unwrap()
            .get(&(entity_type, entity_id.to_string()))
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Publishers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub event: ApprovalEvent,
    pub company_id: CompanyId,
    pub targets: Option<Vec<UserId>>,
}

#[derive(Clone, Default)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<PublishedEvent>>>,
}

impl RecordingPublisher {
    pub fn all(&self) -> Vec<PublishedEvent> {
        self.published.lock().unwrap().clone()
    }

    /// Kinds of the events `user_id` would have received, in order.
    pub fn kinds_for(&self, user_id: UserId) -> Vec<&'static str> {
        self.all()
            .iter()
            .filter(|p| p.targets.as_ref().is_none_or(|t| t.contains(&user_id)))
            .map(|p| p.event.kind())
            .collect()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: &ApprovalEvent, company_id: CompanyId, targets: Option<&[UserId]>) {
        self.published.lock().unwrap().push(PublishedEvent {
            event: event.clone(),
            company_id,
            targets: targets.map(<[UserId]>::to_vec),
        });
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<OutboundNotification>>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<OutboundNotification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn publish(&self, notification: OutboundNotification) {
        self.sent.lock().unwrap().push(notification);
    }
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

pub type TestEngine = WorkflowEngine<InMemoryWorkflowRepository, InMemoryAuditRepository, FakeDirectory>;

/// An engine wired to fakes, with one company, a requester allowed to
/// trigger workflows and an admin allowed to author and cancel them.
pub struct TestEnv {
    pub engine: TestEngine,
    pub repo: InMemoryWorkflowRepository,
    pub audit: InMemoryAuditRepository,
    pub dir: FakeDirectory,
    pub publisher: RecordingPublisher,
    pub notifier: RecordingNotifier,
    pub company: CompanyId,
    pub requester: UserId,
    pub admin: UserId,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let repo = InMemoryWorkflowRepository::default();
        let audit = InMemoryAuditRepository::default();
        let dir = FakeDirectory::default();
        let publisher = RecordingPublisher::default();
        let notifier = RecordingNotifier::default();

        let company = CompanyId::new();
        let requester = dir.add_user(company, "Requester");
        dir.grant_permission(requester, permissions::TRIGGER_WORKFLOW);
        let admin = dir.add_user(company, "Admin");
        for permission in [
            permissions::CREATE_WORKFLOW,
            permissions::UPDATE_WORKFLOW,
            permissions::CANCEL_WORKFLOW,
            permissions::TRIGGER_WORKFLOW,
        ] {
            dir.grant_permission(admin, permission);
        }

        let engine = WorkflowEngine::new(
            repo.clone(),
            audit.clone(),
            dir.clone(),
            Arc::new(publisher.clone()),
            config,
        )
        .with_notifier(Arc::new(notifier.clone()));

        Self {
            engine,
            repo,
            audit,
            dir,
            publisher,
            notifier,
            company,
            requester,
            admin,
        }
    }

    pub fn with_escalation(mut self, policy: Arc<dyn EscalationPolicy>) -> Self {
        self.engine = self.engine.with_escalation_policy(policy);
        self
    }

    pub fn user(&self, name: &str) -> UserId {
        self.dir.add_user(self.company, name)
    }

    pub fn foreign_user(&self, name: &str) -> UserId {
        self.dir.add_user(CompanyId::new(), name)
    }

    pub fn role(&self, name: &str) -> RoleId {
        self.dir.add_role(self.company, name)
    }

    pub fn member(&self, name: &str, role_id: RoleId) -> UserId {
        let user_id = self.user(name);
        self.dir.grant_role(user_id, role_id);
        user_id
    }

    /// A template owned by this env's company (not stored).
    pub fn template(&self, steps: Vec<StepDefinition>) -> WorkflowTemplate {
        WorkflowTemplate {
            company_id: self.company,
            created_by: self.admin,
            ..template_with_steps(steps)
        }
    }

    pub async fn save_template(&self, steps: Vec<StepDefinition>) -> WorkflowTemplate {
        let template = self.template(steps);
        self.repo.insert_template(template.clone());
        template
    }

    pub fn po(&self, total: i64) -> EntityRef {
        EntityRef::new(
            EntityType::PurchaseOrder,
            format!("po-{total}"),
            json!({"number": format!("PO-{total}"), "total": total}),
        )
    }

    pub async fn requests_of(&self, instance_id: &Uuid) -> Vec<ApprovalRequest> {
        self.repo.list_requests_for_instance(instance_id).await.unwrap()
    }

    pub async fn instance(&self, instance_id: &Uuid) -> WorkflowInstance {
        self.repo.get_instance(instance_id).await.unwrap().unwrap()
    }

    pub async fn approve(&self, requests: &[ApprovalRequest], reviewer: UserId) {
        self.decide(requests, reviewer, ReviewSubmission::new(ApprovalDecision::Approved))
            .await;
    }

    pub async fn reject(&self, requests: &[ApprovalRequest], reviewer: UserId) {
        self.decide(
            requests,
            reviewer,
            ReviewSubmission::new(ApprovalDecision::Rejected).with_reason("not justified"),
        )
        .await;
    }

    /// Decide the open request `reviewer` holds (or the unclaimed role slot).
    async fn decide(&self, requests: &[ApprovalRequest], reviewer: UserId, submission: ReviewSubmission) {
        let request = requests
            .iter()
            .filter(|r| r.is_open())
            .find(|r| r.assigned_to == Some(reviewer))
            .or_else(|| requests.iter().find(|r| r.is_open() && r.assigned_to.is_none()))
            .expect("no open request for reviewer");
        self.engine
            .review(&request.id, reviewer, submission)
            .await
            .unwrap();
    }
}
