//! Audit log repository trait definition.

use gatekeep_types::audit::AuditEntry;
use gatekeep_types::error::RepositoryError;
use gatekeep_types::ids::CompanyId;

/// Append-only storage for audit entries.
pub trait AuditRepository: Send + Sync {
    fn append(
        &self,
        entry: &AuditEntry,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// History of one record, oldest first.
    fn list_for_entity(
        &self,
        company_id: &CompanyId,
        entity_type: &str,
        entity_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<AuditEntry>, RepositoryError>> + Send;
}
