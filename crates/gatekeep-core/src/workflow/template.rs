//! Template validation and trigger matching.
//!
//! Both functions are pure. Authoring operations that touch storage and the
//! directory live on the engine (see `authoring.rs`).

use std::collections::BTreeMap;

use chrono::Utc;
use gatekeep_types::entity::EntityType;
use gatekeep_types::error::ValidationError;
use gatekeep_types::ids::{CompanyId, UserId};
use gatekeep_types::template::{
    AssigneeType, TemplateDraft, TriggerEvent, TriggerType, WorkflowTemplate,
};
use uuid::Uuid;

use super::condition;

/// Upper bound for a step timeout: one hundred years.
pub const MAX_TIMEOUT_HOURS: u32 = 876_000;

/// Check every structural rule and report all violations at once.
pub fn validate_template(template: &WorkflowTemplate) -> Result<(), ValidationError> {
    let mut violations = Vec::new();

    if template.name.trim().is_empty() {
        violations.push("name must not be empty".to_string());
    }

    if template.is_active && template.steps.is_empty() {
        violations.push("an active template must have at least one step".to_string());
    }

    // Step numbering: unique, starting at 1, no gaps.
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for step in &template.steps {
        *counts.entry(step.step_number).or_default() += 1;
    }
    for (number, count) in &counts {
        if *count > 1 {
            violations.push(format!("step number {number} is used {count} times"));
        }
    }
    if counts.contains_key(&0) {
        violations.push("step numbers start at 1".to_string());
    }
    // One violation per run of missing numbers, however wide the gap.
    let mut previous = 0u32;
    for &number in counts.keys().filter(|&&n| n > 0) {
        match number - previous {
            1 => {}
            2 => violations.push(format!("step number {} is missing", previous + 1)),
            _ => violations.push(format!(
                "step numbers {}..={} are missing",
                previous + 1,
                number - 1
            )),
        }
        previous = number;
    }

    for step in &template.steps {
        let n = step.step_number;
        if step.name.trim().is_empty() {
            violations.push(format!("step {n}: name must not be empty"));
        }

        match (step.assignee_user_id, step.assignee_role_id) {
            (Some(_), Some(_)) => violations.push(format!(
                "step {n}: set either assignee_user_id or assignee_role_id, not both"
            )),
            (None, None) if step.requires_decision() => violations.push(format!(
                "step {n}: a {} step needs an assignee",
                step.step_type
            )),
            (Some(_), None) if step.assignee_type != AssigneeType::User => violations.push(
                format!("step {n}: assignee_type is {} but assignee_user_id is set", step.assignee_type),
            ),
            (None, Some(_)) if step.assignee_type != AssigneeType::Role => violations.push(
                format!("step {n}: assignee_type is {} but assignee_role_id is set", step.assignee_type),
            ),
            _ => {}
        }

        match step.timeout_hours {
            Some(0) => violations.push(format!("step {n}: timeout_hours must be greater than zero")),
            Some(hours) if hours > MAX_TIMEOUT_HOURS => violations.push(format!(
                "step {n}: timeout_hours must be at most {MAX_TIMEOUT_HOURS}"
            )),
            _ => {}
        }
    }

    match &template.trigger_conditions {
        Some(cond) => violations.extend(condition::condition_violations(cond)),
        None if template.trigger_type == TriggerType::Threshold => {
            violations.push("a threshold trigger needs trigger_conditions".to_string());
        }
        None => {}
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(violations))
    }
}

/// Whether `template` should start an instance for this event.
///
/// Inactive templates never match. `Threshold` templates fire on both
/// creation and update; `Manual` templates only on explicit triggers.
pub fn matches_trigger(
    template: &WorkflowTemplate,
    entity_type: EntityType,
    event: TriggerEvent,
    entity_data: &serde_json::Value,
) -> bool {
    if !template.is_active || template.entity_type != entity_type {
        return false;
    }

    let event_matches = matches!(
        (template.trigger_type, event),
        (TriggerType::Manual, TriggerEvent::Manual)
            | (TriggerType::OnCreate, TriggerEvent::Created)
            | (TriggerType::OnUpdate, TriggerEvent::Updated)
            | (TriggerType::Threshold, TriggerEvent::Created | TriggerEvent::Updated)
    );

    event_matches
        && template
            .trigger_conditions
            .as_ref()
            .is_none_or(|cond| condition::evaluate(cond, entity_data))
}

/// Materialize a draft into a new template owned by `company_id`.
///
/// Steps are sorted by number; validation is left to the caller.
pub fn template_from_draft(
    draft: TemplateDraft,
    company_id: CompanyId,
    created_by: UserId,
) -> WorkflowTemplate {
    let now = Utc::now();
    let mut steps = draft.steps;
    steps.sort_by_key(|s| s.step_number);
    WorkflowTemplate {
        id: Uuid::now_v7(),
        company_id,
        name: draft.name.trim().to_string(),
        description: draft.description,
        entity_type: draft.entity_type,
        trigger_type: draft.trigger_type,
        trigger_conditions: draft.trigger_conditions,
        is_active: draft.is_active,
        steps,
        created_by,
        created_at: now,
        updated_at: now,
    }
}
