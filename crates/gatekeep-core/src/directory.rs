//! Collaborators the engine consumes but does not own.
//!
//! Users, roles and permissions live in an identity directory; entity data
//! lives in the business system that owns purchase orders, invoices and so
//! on; outbound email/push delivery belongs to a notifier. The engine only
//! sees these traits.

use gatekeep_types::entity::EntityType;
use gatekeep_types::error::RepositoryError;
use gatekeep_types::identity::{Role, User};
use gatekeep_types::ids::{CompanyId, RoleId, UserId};
use serde::Serialize;
use uuid::Uuid;

/// Read-only view of users and roles.
pub trait IdentityDirectory: Send + Sync {
    fn get_user(
        &self,
        id: &UserId,
    ) -> impl std::future::Future<Output = Result<Option<User>, RepositoryError>> + Send;

    /// Users holding `role_id` within `company_id`, including inactive ones.
    fn list_users_with_role(
        &self,
        role_id: &RoleId,
        company_id: &CompanyId,
    ) -> impl std::future::Future<Output = Result<Vec<User>, RepositoryError>> + Send;

    /// The role the user currently acts under, if any.
    fn get_current_role(
        &self,
        user_id: &UserId,
    ) -> impl std::future::Future<Output = Result<Option<RoleId>, RepositoryError>> + Send;

    fn get_role(
        &self,
        id: &RoleId,
    ) -> impl std::future::Future<Output = Result<Option<Role>, RepositoryError>> + Send;
}

/// Permission lookups by string key (see `gatekeep_types::identity::permissions`).
pub trait PermissionChecker: Send + Sync {
    fn has_permission(
        &self,
        user_id: &UserId,
        permission: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}

/// Source of entity snapshots for triggers that only carry an id.
pub trait EntityStore: Send + Sync {
    fn get_snapshot(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<serde_json::Value>, RepositoryError>> + Send;
}

/// An out-of-band message (email, push) produced by a transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundNotification {
    pub company_id: CompanyId,
    pub recipients: Vec<UserId>,
    pub subject: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,
    pub workflow_instance_id: Uuid,
}

/// Fire-and-forget delivery of outbound notifications.
///
/// Called after a transition commits. Implementations must not block the
/// caller; failures are theirs to log.
pub trait Notifier: Send + Sync {
    fn publish(&self, notification: OutboundNotification);
}

/// Notifier that drops everything. Used when no delivery channel is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn publish(&self, notification: OutboundNotification) {
        tracing::trace!(
            subject = %notification.subject,
            recipients = notification.recipients.len(),
            "notifier disabled, dropping notification"
        );
    }
}
