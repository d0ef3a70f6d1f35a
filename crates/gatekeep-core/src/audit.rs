//! Audit trail writer.
//!
//! Audit writes happen after a transition has committed. A failing audit
//! store must never undo or fail the business operation, so `record` logs
//! and carries on.

use gatekeep_types::audit::AuditEntry;
use gatekeep_types::error::RepositoryError;
use gatekeep_types::ids::CompanyId;

use crate::repository::audit::AuditRepository;

pub struct AuditTrail<A: AuditRepository> {
    repo: A,
}

impl<A: AuditRepository> AuditTrail<A> {
    pub fn new(repo: A) -> Self {
        Self { repo }
    }

    /// Append one entry, swallowing storage failures.
    pub async fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.repo.append(&entry).await {
            tracing::warn!(
                action = %entry.action,
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                error = %e,
                "failed to write audit entry"
            );
        }
    }

    pub async fn record_all(&self, entries: Vec<AuditEntry>) {
        for entry in entries {
            self.record(entry).await;
        }
    }

    pub async fn history(
        &self,
        company_id: &CompanyId,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>, RepositoryError> {
        self.repo
            .list_for_entity(company_id, entity_type, entity_id)
            .await
    }
}
