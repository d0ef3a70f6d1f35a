//! What happens when a step outlives its timeout.

use std::collections::HashMap;

use gatekeep_types::ids::UserId;
use gatekeep_types::instance::StepExecution;
use gatekeep_types::template::{StepDefinition, WorkflowTemplate};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationAction {
    /// Expire the step and with it the instance.
    Expire,
    /// Retire the timed-out execution and hand the step to this user.
    Reassign(UserId),
}

/// Hook consulted by `expire` for every timed-out execution.
pub trait EscalationPolicy: Send + Sync {
    fn on_timeout(
        &self,
        template: &WorkflowTemplate,
        step: &StepDefinition,
        execution: &StepExecution,
    ) -> EscalationAction;
}

/// Always expire.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpireOnTimeout;

impl EscalationPolicy for ExpireOnTimeout {
    fn on_timeout(
        &self,
        _template: &WorkflowTemplate,
        _step: &StepDefinition,
        _execution: &StepExecution,
    ) -> EscalationAction {
        EscalationAction::Expire
    }
}

/// Reassign timed-out steps to a configured fallback user.
///
/// Per-step fallbacks win over per-template ones, which win over the global
/// default. An execution already held by its fallback expires instead of
/// bouncing back to the same user forever.
#[derive(Debug, Clone, Default)]
pub struct FallbackAssigneePolicy {
    by_step: HashMap<(Uuid, u32), UserId>,
    by_template: HashMap<Uuid, UserId>,
    default_fallback: Option<UserId>,
}

impl FallbackAssigneePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, user_id: UserId) -> Self {
        self.default_fallback = Some(user_id);
        self
    }

    pub fn with_template(mut self, template_id: Uuid, user_id: UserId) -> Self {
        self.by_template.insert(template_id, user_id);
        self
    }

    pub fn with_step(mut self, template_id: Uuid, step_number: u32, user_id: UserId) -> Self {
        self.by_step.insert((template_id, step_number), user_id);
        self
    }

    fn fallback_for(&self, template_id: Uuid, step_number: u32) -> Option<UserId> {
        self.by_step
            .get(&(template_id, step_number))
            .or_else(|| self.by_template.get(&template_id))
            .copied()
            .or(self.default_fallback)
    }
}

impl EscalationPolicy for FallbackAssigneePolicy {
    fn on_timeout(
        &self,
        template: &WorkflowTemplate,
        step: &StepDefinition,
        execution: &StepExecution,
    ) -> EscalationAction {
        match self.fallback_for(template.id, step.step_number) {
            Some(fallback) if execution.assigned_to_user_id != Some(fallback) => {
                EscalationAction::Reassign(fallback)
            }
            _ => EscalationAction::Expire,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{open_execution, template_with_steps, user_step};

    #[test]
    fn test_fallback_precedence() {
        let template = template_with_steps(vec![user_step(1, UserId::new()), user_step(2, UserId::new())]);
        let global = UserId::new();
        let per_template = UserId::new();
        let per_step = UserId::new();
        let policy = FallbackAssigneePolicy::new()
            .with_default(global)
            .with_template(template.id, per_template)
            .with_step(template.id, 2, per_step);

        let exec = open_execution(1, Some(UserId::new()));
        assert_eq!(
            policy.on_timeout(&template, &template.steps[0], &exec),
            EscalationAction::Reassign(per_template)
        );
        assert_eq!(
            policy.on_timeout(&template, &template.steps[1], &exec),
            EscalationAction::Reassign(per_step)
        );

        let other = template_with_steps(vec![user_step(1, UserId::new())]);
        assert_eq!(
            policy.on_timeout(&other, &other.steps[0], &exec),
            EscalationAction::Reassign(global)
        );
    }

    #[test]
    fn test_fallback_already_holding_expires() {
        let template = template_with_steps(vec![user_step(1, UserId::new())]);
        let fallback = UserId::new();
        let policy = FallbackAssigneePolicy::new().with_default(fallback);

        let exec = open_execution(1, Some(fallback));
        assert_eq!(
            policy.on_timeout(&template, &template.steps[0], &exec),
            EscalationAction::Expire
        );
        assert_eq!(
            ExpireOnTimeout.on_timeout(&template, &template.steps[0], &exec),
            EscalationAction::Expire
        );
    }
}
