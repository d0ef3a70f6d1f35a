//! In-memory working copy of one instance during a transition.
//!
//! The engine loads an instance with all of its executions and requests,
//! mutates the copy, and persists only the touched rows as a single
//! [`TransitionBatch`]. Side effects are collected in [`Effects`] and only
//! run once that batch has committed.

use gatekeep_types::approval::{ApprovalComment, ApprovalRequest};
use gatekeep_types::audit::AuditEntry;
use gatekeep_types::event::ApprovalEvent;
use gatekeep_types::ids::UserId;
use gatekeep_types::instance::{StepExecution, WorkflowInstance};
use uuid::Uuid;

use crate::directory::OutboundNotification;
use crate::repository::workflow::TransitionBatch;

#[derive(Debug, Clone)]
pub(crate) struct InstanceAggregate {
    pub instance: WorkflowInstance,
    pub executions: Vec<StepExecution>,
    pub requests: Vec<ApprovalRequest>,
    pub comments: Vec<ApprovalComment>,
    instance_dirty: bool,
    dirty_executions: Vec<Uuid>,
    dirty_requests: Vec<Uuid>,
}

impl InstanceAggregate {
    /// A brand-new instance; everything will be written.
    pub fn new(instance: WorkflowInstance) -> Self {
        Self {
            instance,
            executions: Vec::new(),
            requests: Vec::new(),
            comments: Vec::new(),
            instance_dirty: true,
            dirty_executions: Vec::new(),
            dirty_requests: Vec::new(),
        }
    }

    /// An instance as currently stored; nothing is dirty yet.
    pub fn loaded(
        instance: WorkflowInstance,
        executions: Vec<StepExecution>,
        requests: Vec<ApprovalRequest>,
    ) -> Self {
        Self {
            instance,
            executions,
            requests,
            comments: Vec::new(),
            instance_dirty: false,
            dirty_executions: Vec::new(),
            dirty_requests: Vec::new(),
        }
    }

    pub fn touch_instance(&mut self) {
        self.instance_dirty = true;
    }

    pub fn push_execution(&mut self, execution: StepExecution) {
        mark(&mut self.dirty_executions, execution.id);
        self.executions.push(execution);
    }

    pub fn push_request(&mut self, request: ApprovalRequest) {
        mark(&mut self.dirty_requests, request.id);
        self.requests.push(request);
    }

    pub fn push_comment(&mut self, comment: ApprovalComment) {
        self.comments.push(comment);
    }

    pub fn execution(&self, id: Uuid) -> Option<&StepExecution> {
        self.executions.iter().find(|e| e.id == id)
    }

    pub fn execution_mut(&mut self, id: Uuid) -> Option<&mut StepExecution> {
        let execution = self.executions.iter_mut().find(|e| e.id == id)?;
        mark(&mut self.dirty_executions, id);
        Some(execution)
    }

    pub fn request(&self, id: Uuid) -> Option<&ApprovalRequest> {
        self.requests.iter().find(|r| r.id == id)
    }

    pub fn request_mut(&mut self, id: Uuid) -> Option<&mut ApprovalRequest> {
        let request = self.requests.iter_mut().find(|r| r.id == id)?;
        mark(&mut self.dirty_requests, id);
        Some(request)
    }

    pub fn request_for_execution(&self, execution_id: Uuid) -> Option<&ApprovalRequest> {
        self.requests
            .iter()
            .find(|r| r.step_execution_id == execution_id)
    }

    pub fn executions_for_step(&self, step_number: u32) -> impl Iterator<Item = &StepExecution> {
        self.executions
            .iter()
            .filter(move |e| e.step_number == step_number)
    }

    /// Touched rows only, in the order they were first touched.
    pub fn to_batch(&self) -> TransitionBatch {
        TransitionBatch {
            instance: self.instance_dirty.then(|| self.instance.clone()),
            step_executions: self
                .dirty_executions
                .iter()
                .filter_map(|id| self.execution(*id).cloned())
                .collect(),
            requests: self
                .dirty_requests
                .iter()
                .filter_map(|id| self.request(*id).cloned())
                .collect(),
            comments: self.comments.clone(),
        }
    }
}

fn mark(ids: &mut Vec<Uuid>, id: Uuid) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

/// Side effects of a transition, run after commit.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub audits: Vec<AuditEntry>,
    /// Events with a fixed recipient list.
    pub events: Vec<(ApprovalEvent, Vec<UserId>)>,
    /// Requests whose status changed, with the user who changed them. The
    /// `approval_status_changed` event is built from the final state.
    pub status_changes: Vec<(Uuid, Option<UserId>)>,
    pub notifications: Vec<OutboundNotification>,
}

impl Effects {
    pub fn audit(&mut self, entry: AuditEntry) {
        self.audits.push(entry);
    }

    pub fn emit(&mut self, event: ApprovalEvent, targets: Vec<UserId>) {
        if !targets.is_empty() {
            self.events.push((event, targets));
        }
    }

    pub fn status_changed(&mut self, request_id: Uuid, changed_by: Option<UserId>) {
        self.status_changes.retain(|(id, _)| *id != request_id);
        self.status_changes.push((request_id, changed_by));
    }

    pub fn notify(&mut self, notification: OutboundNotification) {
        if !notification.recipients.is_empty() {
            self.notifications.push(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{open_execution, sample_instance};

    #[test]
    fn test_loaded_aggregate_starts_clean() {
        let agg = InstanceAggregate::loaded(sample_instance(), vec![open_execution(1, None)], vec![]);
        assert!(agg.to_batch().is_empty());
    }

    #[test]
    fn test_only_touched_rows_are_written() {
        let first = open_execution(1, None);
        let second = open_execution(1, None);
        let second_id = second.id;
        let mut agg = InstanceAggregate::loaded(sample_instance(), vec![first, second], vec![]);

        agg.execution_mut(second_id).unwrap().status =
            gatekeep_types::instance::StepExecutionStatus::Skipped;
        agg.execution_mut(second_id).unwrap();

        let batch = agg.to_batch();
        assert!(batch.instance.is_none());
        assert_eq!(batch.step_executions.len(), 1);
        assert_eq!(batch.step_executions[0].id, second_id);
    }

    #[test]
    fn test_status_changes_keep_latest_actor() {
        let mut fx = Effects::default();
        let request_id = Uuid::now_v7();
        let reviewer = UserId::new();
        fx.status_changed(request_id, None);
        fx.status_changed(request_id, Some(reviewer));
        assert_eq!(fx.status_changes, vec![(request_id, Some(reviewer))]);
    }
}
