//! SQLite audit log implementation.
//!
//! Append-only storage for workflow transitions and decisions. Entries are
//! never updated or deleted.

use gatekeep_core::repository::audit::AuditRepository;
use gatekeep_types::audit::AuditEntry;
use gatekeep_types::error::RepositoryError;
use gatekeep_types::ids::CompanyId;
use sqlx::Row;

use super::pool::DatabasePool;
use super::{
    format_datetime, parse_column, parse_datetime, parse_json, parse_optional, query_error, to_json,
};

/// SQLite-backed audit log.
#[derive(Clone)]
pub struct SqliteAuditRepository {
    pool: DatabasePool,
}

impl SqliteAuditRepository {
    /// Create a new audit log backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Private Row types
// ---------------------------------------------------------------------------

struct AuditRow {
    id: String,
    company_id: String,
    entity_type: String,
    entity_id: String,
    action: String,
    actor_id: Option<String>,
    before_state: Option<String>,
    after_state: Option<String>,
    created_at: String,
}

impl AuditRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            company_id: row.try_get("company_id")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            action: row.try_get("action")?,
            actor_id: row.try_get("actor_id")?,
            before_state: row.try_get("before_state")?,
            after_state: row.try_get("after_state")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_entry(self) -> Result<AuditEntry, RepositoryError> {
        Ok(AuditEntry {
            id: parse_column("id", &self.id)?,
            company_id: parse_column("company_id", &self.company_id)?,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            action: parse_column("action", &self.action)?,
            actor_id: parse_optional("actor_id", self.actor_id.as_deref())?,
            before_state: self
                .before_state
                .as_deref()
                .map(|s| parse_json("before_state", s))
                .transpose()?,
            after_state: self
                .after_state
                .as_deref()
                .map(|s| parse_json("after_state", s))
                .transpose()?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

impl AuditRepository for SqliteAuditRepository {
    async fn append(&self, entry: &AuditEntry) -> Result<(), RepositoryError> {
        let before = entry
            .before_state
            .as_ref()
            .map(|s| to_json("before_state", s))
            .transpose()?;
        let after = entry
            .after_state
            .as_ref()
            .map(|s| to_json("after_state", s))
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO audit_log
                 (id, company_id, entity_type, entity_id, action, actor_id, before_state, after_state, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.id.to_string())
        .bind(entry.company_id.to_string())
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(entry.action.as_str())
        .bind(entry.actor_id.map(|u| u.to_string()))
        .bind(&before)
        .bind(&after)
        .bind(format_datetime(&entry.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn list_for_entity(
        &self,
        company_id: &CompanyId,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM audit_log WHERE company_id = ? AND entity_type = ? AND entity_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(company_id.to_string())
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let audit_row = AuditRow::from_row(row).map_err(query_error)?;
            entries.push(audit_row.into_entry()?);
        }
        Ok(entries)
    }
}
