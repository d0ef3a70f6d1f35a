//! Workflow templates, assignee resolution and the instance state machine.

mod aggregate;
pub mod authoring;
pub mod condition;
pub mod engine;
pub mod escalation;
pub mod lock;
pub mod resolver;
pub mod review;
pub mod template;

pub use engine::{InstanceDetail, SweepReport, WorkflowEngine};
pub use escalation::{EscalationAction, EscalationPolicy, ExpireOnTimeout, FallbackAssigneePolicy};
pub use review::{BulkItemResult, parse_bulk_action};
