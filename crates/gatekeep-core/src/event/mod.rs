//! Real-time delivery of approval events.
//!
//! The engine publishes through the [`EventPublisher`] seam after each
//! committed transition; [`hub::NotificationHub`] is the production
//! implementation that fans events out to per-connection channels.

pub mod hub;

use gatekeep_types::event::ApprovalEvent;
use gatekeep_types::ids::{CompanyId, UserId};

/// Sink for committed approval events.
///
/// `targets = None` means every connected user of `company_id`. Publishing
/// never blocks and never fails from the caller's point of view.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &ApprovalEvent, company_id: CompanyId, targets: Option<&[UserId]>);
}
