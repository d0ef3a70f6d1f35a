//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `gatekeep-core` using sqlx with split
//! read/write pools. Template steps and trigger conditions are stored as JSON
//! blobs next to the indexed columns used for trigger lookups. A transition
//! batch is written in one transaction on the writer pool.

use gatekeep_core::repository::workflow::{TemplateFilter, TransitionBatch, WorkflowRepository};
use gatekeep_types::approval::{ApprovalComment, ApprovalFilter, ApprovalRequest, ApprovalStats};
use gatekeep_types::error::RepositoryError;
use gatekeep_types::ids::CompanyId;
use gatekeep_types::instance::{StepExecution, WorkflowInstance};
use gatekeep_types::template::WorkflowTemplate;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{
    format_datetime, parse_column, parse_datetime, parse_json, parse_optional,
    parse_optional_datetime, query_error, to_json,
};

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const OPEN_EXECUTION_STATUSES: &str = "('pending', 'assigned', 'more_info_required')";

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct TemplateRow {
    id: String,
    company_id: String,
    name: String,
    description: Option<String>,
    entity_type: String,
    trigger_type: String,
    trigger_conditions: Option<String>,
    is_active: bool,
    steps: String,
    created_by: String,
    created_at: String,
    updated_at: String,
}

impl TemplateRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            company_id: row.try_get("company_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            entity_type: row.try_get("entity_type")?,
            trigger_type: row.try_get("trigger_type")?,
            trigger_conditions: row.try_get("trigger_conditions")?,
            is_active: row.try_get("is_active")?,
            steps: row.try_get("steps")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_template(self) -> Result<WorkflowTemplate, RepositoryError> {
        Ok(WorkflowTemplate {
            id: parse_column("id", &self.id)?,
            company_id: parse_column("company_id", &self.company_id)?,
            name: self.name,
            description: self.description,
            entity_type: parse_column("entity_type", &self.entity_type)?,
            trigger_type: parse_column("trigger_type", &self.trigger_type)?,
            trigger_conditions: self
                .trigger_conditions
                .as_deref()
                .map(|c| parse_json("trigger_conditions", c))
                .transpose()?,
            is_active: self.is_active,
            steps: parse_json("steps", &self.steps)?,
            created_by: parse_column("created_by", &self.created_by)?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct InstanceRow {
    id: String,
    template_id: String,
    entity_type: String,
    entity_id: String,
    entity_snapshot: String,
    status: String,
    current_step_number: Option<i64>,
    steps: String,
    triggered_by: String,
    company_id: String,
    created_at: String,
    completed_at: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            template_id: row.try_get("template_id")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            entity_snapshot: row.try_get("entity_snapshot")?,
            status: row.try_get("status")?,
            current_step_number: row.try_get("current_step_number")?,
            steps: row.try_get("steps")?,
            triggered_by: row.try_get("triggered_by")?,
            company_id: row.try_get("company_id")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        Ok(WorkflowInstance {
            id: parse_column("id", &self.id)?,
            template_id: parse_column("template_id", &self.template_id)?,
            entity_type: parse_column("entity_type", &self.entity_type)?,
            entity_id: self.entity_id,
            entity_snapshot: parse_json("entity_snapshot", &self.entity_snapshot)?,
            status: parse_column("status", &self.status)?,
            current_step_number: self.current_step_number.map(|n| n as u32),
            steps: parse_json("steps", &self.steps)?,
            triggered_by: parse_column("triggered_by", &self.triggered_by)?,
            company_id: parse_column("company_id", &self.company_id)?,
            created_at: parse_datetime(&self.created_at)?,
            completed_at: parse_optional_datetime(self.completed_at.as_deref())?,
        })
    }
}

struct ExecutionRow {
    id: String,
    instance_id: String,
    step_number: i64,
    status: String,
    assigned_to_user_id: Option<String>,
    assigned_role_id: Option<String>,
    decided_by: Option<String>,
    decision: Option<String>,
    decision_reason: Option<String>,
    created_at: String,
    decided_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            step_number: row.try_get("step_number")?,
            status: row.try_get("status")?,
            assigned_to_user_id: row.try_get("assigned_to_user_id")?,
            assigned_role_id: row.try_get("assigned_role_id")?,
            decided_by: row.try_get("decided_by")?,
            decision: row.try_get("decision")?,
            decision_reason: row.try_get("decision_reason")?,
            created_at: row.try_get("created_at")?,
            decided_at: row.try_get("decided_at")?,
        })
    }

    fn into_execution(self) -> Result<StepExecution, RepositoryError> {
        Ok(StepExecution {
            id: parse_column("id", &self.id)?,
            instance_id: parse_column("instance_id", &self.instance_id)?,
            step_number: self.step_number as u32,
            status: parse_column("status", &self.status)?,
            assigned_to_user_id: parse_optional("assigned_to_user_id", self.assigned_to_user_id.as_deref())?,
            assigned_role_id: parse_optional("assigned_role_id", self.assigned_role_id.as_deref())?,
            decided_by: parse_optional("decided_by", self.decided_by.as_deref())?,
            decision: parse_optional("decision", self.decision.as_deref())?,
            decision_reason: self.decision_reason,
            created_at: parse_datetime(&self.created_at)?,
            decided_at: parse_optional_datetime(self.decided_at.as_deref())?,
        })
    }
}

struct RequestRow {
    id: String,
    workflow_instance_id: String,
    step_execution_id: String,
    step_number: i64,
    entity_type: String,
    entity_id: String,
    request_type: String,
    priority: String,
    assigned_to: Option<String>,
    assigned_role: Option<String>,
    title: String,
    description: Option<String>,
    status: String,
    decision: Option<String>,
    decision_reason: Option<String>,
    reviewed_by: Option<String>,
    requested_by: String,
    requested_at: String,
    reviewed_at: Option<String>,
    completed_at: Option<String>,
    company_id: String,
}

impl RequestRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_instance_id: row.try_get("workflow_instance_id")?,
            step_execution_id: row.try_get("step_execution_id")?,
            step_number: row.try_get("step_number")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            request_type: row.try_get("request_type")?,
            priority: row.try_get("priority")?,
            assigned_to: row.try_get("assigned_to")?,
            assigned_role: row.try_get("assigned_role")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            decision: row.try_get("decision")?,
            decision_reason: row.try_get("decision_reason")?,
            reviewed_by: row.try_get("reviewed_by")?,
            requested_by: row.try_get("requested_by")?,
            requested_at: row.try_get("requested_at")?,
            reviewed_at: row.try_get("reviewed_at")?,
            completed_at: row.try_get("completed_at")?,
            company_id: row.try_get("company_id")?,
        })
    }

    fn into_request(self) -> Result<ApprovalRequest, RepositoryError> {
        Ok(ApprovalRequest {
            id: parse_column("id", &self.id)?,
            workflow_instance_id: parse_column("workflow_instance_id", &self.workflow_instance_id)?,
            step_execution_id: parse_column("step_execution_id", &self.step_execution_id)?,
            step_number: self.step_number as u32,
            entity_type: parse_column("entity_type", &self.entity_type)?,
            entity_id: self.entity_id,
            request_type: self.request_type,
            priority: parse_column("priority", &self.priority)?,
            assigned_to: parse_optional("assigned_to", self.assigned_to.as_deref())?,
            assigned_role: parse_optional("assigned_role", self.assigned_role.as_deref())?,
            title: self.title,
            description: self.description,
            status: parse_column("status", &self.status)?,
            decision: parse_optional("decision", self.decision.as_deref())?,
            decision_reason: self.decision_reason,
            reviewed_by: parse_optional("reviewed_by", self.reviewed_by.as_deref())?,
            requested_by: parse_column("requested_by", &self.requested_by)?,
            requested_at: parse_datetime(&self.requested_at)?,
            reviewed_at: parse_optional_datetime(self.reviewed_at.as_deref())?,
            completed_at: parse_optional_datetime(self.completed_at.as_deref())?,
            company_id: parse_column("company_id", &self.company_id)?,
        })
    }
}

fn comment_from_row(row: &SqliteRow) -> Result<ApprovalComment, RepositoryError> {
    let id: String = row.try_get("id").map_err(query_error)?;
    let request_id: String = row.try_get("approval_request_id").map_err(query_error)?;
    let author_id: String = row.try_get("author_id").map_err(query_error)?;
    let created_at: String = row.try_get("created_at").map_err(query_error)?;

    Ok(ApprovalComment {
        id: parse_column("id", &id)?,
        approval_request_id: parse_column("approval_request_id", &request_id)?,
        author_id: parse_column("author_id", &author_id)?,
        comment: row.try_get("comment").map_err(query_error)?,
        is_internal: row.try_get("is_internal").map_err(query_error)?,
        created_at: parse_datetime(&created_at)?,
    })
}

fn rows_to<T, R>(
    rows: &[SqliteRow],
    from_row: impl Fn(&SqliteRow) -> Result<R, sqlx::Error>,
    convert: impl Fn(R) -> Result<T, RepositoryError>,
) -> Result<Vec<T>, RepositoryError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(convert(from_row(row).map_err(query_error)?)?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Upserts used by `commit`
// ---------------------------------------------------------------------------

async fn upsert_instance(
    conn: &mut sqlx::SqliteConnection,
    instance: &WorkflowInstance,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO workflow_instances
             (id, template_id, entity_type, entity_id, entity_snapshot, status,
              current_step_number, steps, triggered_by, company_id, created_at, completed_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
             status = excluded.status,
             current_step_number = excluded.current_step_number,
             completed_at = excluded.completed_at"#,
    )
    .bind(instance.id.to_string())
    .bind(instance.template_id.to_string())
    .bind(instance.entity_type.as_str())
    .bind(&instance.entity_id)
    .bind(to_json("entity_snapshot", &instance.entity_snapshot)?)
    .bind(instance.status.to_string())
    .bind(instance.current_step_number.map(i64::from))
    .bind(to_json("steps", &instance.steps)?)
    .bind(instance.triggered_by.to_string())
    .bind(instance.company_id.to_string())
    .bind(format_datetime(&instance.created_at))
    .bind(instance.completed_at.as_ref().map(format_datetime))
    .execute(conn)
    .await
    .map_err(query_error)?;
    Ok(())
}

async fn upsert_execution(
    conn: &mut sqlx::SqliteConnection,
    execution: &StepExecution,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO step_executions
             (id, instance_id, step_number, status, assigned_to_user_id, assigned_role_id,
              decided_by, decision, decision_reason, created_at, decided_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
             status = excluded.status,
             assigned_to_user_id = excluded.assigned_to_user_id,
             assigned_role_id = excluded.assigned_role_id,
             decided_by = excluded.decided_by,
             decision = excluded.decision,
             decision_reason = excluded.decision_reason,
             decided_at = excluded.decided_at"#,
    )
    .bind(execution.id.to_string())
    .bind(execution.instance_id.to_string())
    .bind(i64::from(execution.step_number))
    .bind(execution.status.to_string())
    .bind(execution.assigned_to_user_id.map(|u| u.to_string()))
    .bind(execution.assigned_role_id.map(|r| r.to_string()))
    .bind(execution.decided_by.map(|u| u.to_string()))
    .bind(execution.decision.map(|d| d.as_str()))
    .bind(&execution.decision_reason)
    .bind(format_datetime(&execution.created_at))
    .bind(execution.decided_at.as_ref().map(format_datetime))
    .execute(conn)
    .await
    .map_err(query_error)?;
    Ok(())
}

async fn upsert_request(
    conn: &mut sqlx::SqliteConnection,
    request: &ApprovalRequest,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO approval_requests
             (id, workflow_instance_id, step_execution_id, step_number, entity_type, entity_id,
              request_type, priority, assigned_to, assigned_role, title, description, status,
              decision, decision_reason, reviewed_by, requested_by, requested_at, reviewed_at,
              completed_at, company_id)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
             priority = excluded.priority,
             assigned_to = excluded.assigned_to,
             assigned_role = excluded.assigned_role,
             status = excluded.status,
             decision = excluded.decision,
             decision_reason = excluded.decision_reason,
             reviewed_by = excluded.reviewed_by,
             reviewed_at = excluded.reviewed_at,
             completed_at = excluded.completed_at"#,
    )
    .bind(request.id.to_string())
    .bind(request.workflow_instance_id.to_string())
    .bind(request.step_execution_id.to_string())
    .bind(i64::from(request.step_number))
    .bind(request.entity_type.as_str())
    .bind(&request.entity_id)
    .bind(&request.request_type)
    .bind(request.priority.to_string())
    .bind(request.assigned_to.map(|u| u.to_string()))
    .bind(request.assigned_role.map(|r| r.to_string()))
    .bind(&request.title)
    .bind(&request.description)
    .bind(request.status.as_str())
    .bind(request.decision.map(|d| d.as_str()))
    .bind(&request.decision_reason)
    .bind(request.reviewed_by.map(|u| u.to_string()))
    .bind(request.requested_by.to_string())
    .bind(format_datetime(&request.requested_at))
    .bind(request.reviewed_at.as_ref().map(format_datetime))
    .bind(request.completed_at.as_ref().map(format_datetime))
    .bind(request.company_id.to_string())
    .execute(conn)
    .await
    .map_err(query_error)?;
    Ok(())
}

async fn insert_comment(
    conn: &mut sqlx::SqliteConnection,
    comment: &ApprovalComment,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO approval_comments (id, approval_request_id, author_id, comment, is_internal, created_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(comment.id.to_string())
    .bind(comment.approval_request_id.to_string())
    .bind(comment.author_id.to_string())
    .bind(&comment.comment)
    .bind(comment.is_internal)
    .bind(format_datetime(&comment.created_at))
    .execute(conn)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(ref db_err) = e {
            if db_err.message().contains("UNIQUE") {
                return RepositoryError::Conflict(format!("comment {} already exists", comment.id));
            }
        }
        query_error(e)
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_template(&self, template: &WorkflowTemplate) -> Result<(), RepositoryError> {
        let steps = to_json("steps", &template.steps)?;
        let conditions = template
            .trigger_conditions
            .as_ref()
            .map(|c| to_json("trigger_conditions", c))
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_templates
                 (id, company_id, name, description, entity_type, trigger_type, trigger_conditions,
                  is_active, steps, created_by, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 description = excluded.description,
                 entity_type = excluded.entity_type,
                 trigger_type = excluded.trigger_type,
                 trigger_conditions = excluded.trigger_conditions,
                 is_active = excluded.is_active,
                 steps = excluded.steps,
                 updated_at = excluded.updated_at"#,
        )
        .bind(template.id.to_string())
        .bind(template.company_id.to_string())
        .bind(&template.name)
        .bind(&template.description)
        .bind(template.entity_type.as_str())
        .bind(template.trigger_type.to_string())
        .bind(&conditions)
        .bind(template.is_active)
        .bind(&steps)
        .bind(template.created_by.to_string())
        .bind(format_datetime(&template.created_at))
        .bind(format_datetime(&template.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_template(&self, id: &Uuid) -> Result<Option<WorkflowTemplate>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_templates WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = TemplateRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_template()?))
            }
            None => Ok(None),
        }
    }

    async fn list_templates(
        &self,
        company_id: &CompanyId,
        filter: &TemplateFilter,
    ) -> Result<Vec<WorkflowTemplate>, RepositoryError> {
        let mut sql = String::from("SELECT * FROM workflow_templates WHERE company_id = ?");
        if filter.entity_type.is_some() {
            sql.push_str(" AND entity_type = ?");
        }
        if filter.active_only {
            sql.push_str(" AND is_active = 1");
        }
        sql.push_str(" ORDER BY name ASC, id ASC");

        let mut query = sqlx::query(&sql).bind(company_id.to_string());
        if let Some(entity_type) = filter.entity_type {
            query = query.bind(entity_type.as_str());
        }

        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows_to(&rows, TemplateRow::from_row, TemplateRow::into_template)
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn list_step_executions(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM step_executions WHERE instance_id = ? ORDER BY step_number ASC, created_at ASC, id ASC",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows_to(&rows, ExecutionRow::from_row, ExecutionRow::into_execution)
    }

    async fn get_step_execution(&self, id: &Uuid) -> Result<Option<StepExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM step_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn list_open_step_executions(&self) -> Result<Vec<StepExecution>, RepositoryError> {
        let sql = format!(
            "SELECT * FROM step_executions WHERE status IN {OPEN_EXECUTION_STATUSES} ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows_to(&rows, ExecutionRow::from_row, ExecutionRow::into_execution)
    }

    async fn get_request(&self, id: &Uuid) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM approval_requests WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = RequestRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_request()?))
            }
            None => Ok(None),
        }
    }

    async fn list_requests_for_instance(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM approval_requests WHERE workflow_instance_id = ? ORDER BY step_number ASC, requested_at ASC, id ASC",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows_to(&rows, RequestRow::from_row, RequestRow::into_request)
    }

    async fn list_requests(
        &self,
        company_id: &CompanyId,
        filter: &ApprovalFilter,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let mut sql = String::from("SELECT * FROM approval_requests WHERE company_id = ?");
        let mut binds: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            binds.push(status.as_str().to_string());
        }
        if let Some(user_id) = filter.assigned_to {
            sql.push_str(" AND assigned_to = ?");
            binds.push(user_id.to_string());
        }
        if let Some(role_id) = filter.assigned_role {
            sql.push_str(" AND assigned_role = ?");
            binds.push(role_id.to_string());
        }
        if let Some(entity_type) = filter.entity_type {
            sql.push_str(" AND entity_type = ?");
            binds.push(entity_type.as_str().to_string());
        }
        if let Some(priority) = filter.priority {
            sql.push_str(" AND priority = ?");
            binds.push(priority.to_string());
        }
        if let Some(instance_id) = filter.workflow_instance_id {
            sql.push_str(" AND workflow_instance_id = ?");
            binds.push(instance_id.to_string());
        }

        sql.push_str(" ORDER BY requested_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query(&sql).bind(company_id.to_string());
        for value in binds {
            query = query.bind(value);
        }

        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows_to(&rows, RequestRow::from_row, RequestRow::into_request)
    }

    async fn request_stats(&self, company_id: &CompanyId) -> Result<ApprovalStats, RepositoryError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM approval_requests WHERE company_id = ? GROUP BY status",
        )
        .bind(company_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut stats = ApprovalStats::default();
        for row in &rows {
            let status: String = row.try_get("status").map_err(query_error)?;
            let count: i64 = row.try_get("count").map_err(query_error)?;
            stats.total += count as u64;
            stats
                .by_status
                .insert(parse_column("status", &status)?, count as u64);
        }
        Ok(stats)
    }

    async fn list_comments(&self, request_id: &Uuid) -> Result<Vec<ApprovalComment>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM approval_comments WHERE approval_request_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(request_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter().map(comment_from_row).collect()
    }

    async fn commit(&self, batch: &TransitionBatch) -> Result<(), RepositoryError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        // Parents before children so foreign keys hold inside the transaction
        if let Some(instance) = &batch.instance {
            upsert_instance(&mut *tx, instance).await?;
        }
        for execution in &batch.step_executions {
            upsert_execution(&mut *tx, execution).await?;
        }
        for request in &batch.requests {
            upsert_request(&mut *tx, request).await?;
        }
        for comment in &batch.comments {
            insert_comment(&mut *tx, comment).await?;
        }

        tx.commit().await.map_err(query_error)?;

        tracing::debug!(
            instance_id = ?batch.instance.as_ref().map(|i| i.id),
            executions = batch.step_executions.len(),
            requests = batch.requests.len(),
            comments = batch.comments.len(),
            "transition committed"
        );
        Ok(())
    }
}
