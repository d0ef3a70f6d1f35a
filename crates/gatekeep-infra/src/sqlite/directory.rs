//! SQLite-backed identity directory.
//!
//! Stores companies, users, roles, role grants and permission grants, and
//! implements the `IdentityDirectory` and `PermissionChecker` ports. The
//! write methods back the `gk directory` admin commands.

use chrono::Utc;
use gatekeep_core::directory::{IdentityDirectory, PermissionChecker};
use gatekeep_types::error::RepositoryError;
use gatekeep_types::identity::{Role, User};
use gatekeep_types::ids::{CompanyId, RoleId, UserId};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::pool::DatabasePool;
use super::{format_datetime, parse_column, parse_optional, query_error};

#[derive(Clone)]
pub struct SqliteDirectory {
    pool: DatabasePool,
}

impl SqliteDirectory {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    pub async fn create_company(&self, name: &str) -> Result<CompanyId, RepositoryError> {
        let id = CompanyId::new();
        sqlx::query("INSERT INTO companies (id, name, created_at) VALUES (?, ?, ?)")
            .bind(id.to_string())
            .bind(name)
            .bind(format_datetime(&Utc::now()))
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(id)
    }

    pub async fn create_user(
        &self,
        company_id: CompanyId,
        display_name: &str,
        email: Option<&str>,
    ) -> Result<User, RepositoryError> {
        let user = User {
            id: UserId::new(),
            company_id,
            display_name: display_name.to_string(),
            email: email.map(str::to_string),
            is_active: true,
        };
        sqlx::query(
            "INSERT INTO users (id, company_id, display_name, email, is_active, created_at) VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(user.id.to_string())
        .bind(company_id.to_string())
        .bind(&user.display_name)
        .bind(&user.email)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| map_fk_error(e, "company"))?;
        Ok(user)
    }

    pub async fn create_role(&self, company_id: CompanyId, name: &str) -> Result<Role, RepositoryError> {
        let role = Role {
            id: RoleId::new(),
            company_id,
            name: name.to_string(),
        };
        sqlx::query("INSERT INTO roles (id, company_id, name, created_at) VALUES (?, ?, ?, ?)")
            .bind(role.id.to_string())
            .bind(company_id.to_string())
            .bind(&role.name)
            .bind(format_datetime(&Utc::now()))
            .execute(&self.pool.writer)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e {
                    if db_err.message().contains("UNIQUE") {
                        return RepositoryError::Conflict(format!("role '{name}' already exists"));
                    }
                }
                map_fk_error(e, "company")
            })?;
        Ok(role)
    }

    /// Grant a role. Granting the same role twice is a no-op.
    pub async fn grant_role(&self, user_id: &UserId, role_id: &RoleId) -> Result<(), RepositoryError> {
        sqlx::query("INSERT OR IGNORE INTO user_roles (user_id, role_id) VALUES (?, ?)")
            .bind(user_id.to_string())
            .bind(role_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| map_fk_error(e, "user or role"))?;
        Ok(())
    }

    pub async fn grant_permission(&self, user_id: &UserId, permission: &str) -> Result<(), RepositoryError> {
        sqlx::query("INSERT OR IGNORE INTO permissions (user_id, permission_key) VALUES (?, ?)")
            .bind(user_id.to_string())
            .bind(permission)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| map_fk_error(e, "user"))?;
        Ok(())
    }

    pub async fn set_current_role(
        &self,
        user_id: &UserId,
        role_id: Option<&RoleId>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE users SET current_role_id = ? WHERE id = ?")
            .bind(role_id.map(|r| r.to_string()))
            .bind(user_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| map_fk_error(e, "role"))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    pub async fn set_user_active(&self, user_id: &UserId, is_active: bool) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE users SET is_active = ? WHERE id = ?")
            .bind(is_active)
            .bind(user_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

fn map_fk_error(e: sqlx::Error, what: &str) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.message().contains("FOREIGN KEY") {
            return RepositoryError::NotFound;
        }
    }
    tracing::debug!(target_kind = what, error = %e, "directory write failed");
    query_error(e)
}

fn user_from_row(row: &SqliteRow) -> Result<User, RepositoryError> {
    let id: String = row.try_get("id").map_err(query_error)?;
    let company_id: String = row.try_get("company_id").map_err(query_error)?;
    Ok(User {
        id: parse_column("id", &id)?,
        company_id: parse_column("company_id", &company_id)?,
        display_name: row.try_get("display_name").map_err(query_error)?,
        email: row.try_get("email").map_err(query_error)?,
        is_active: row.try_get("is_active").map_err(query_error)?,
    })
}

const USER_COLUMNS: &str = "u.id, u.company_id, u.display_name, u.email, u.is_active";

impl IdentityDirectory for SqliteDirectory {
    async fn get_user(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users u WHERE u.id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_users_with_role(
        &self,
        role_id: &RoleId,
        company_id: &CompanyId,
    ) -> Result<Vec<User>, RepositoryError> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users u
             JOIN user_roles ur ON ur.user_id = u.id
             WHERE ur.role_id = ? AND u.company_id = ?
             ORDER BY u.display_name ASC, u.id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(role_id.to_string())
            .bind(company_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter().map(user_from_row).collect()
    }

    async fn get_current_role(&self, user_id: &UserId) -> Result<Option<RoleId>, RepositoryError> {
        let row = sqlx::query("SELECT current_role_id FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let role: Option<String> = row.try_get("current_role_id").map_err(query_error)?;
                parse_optional("current_role_id", role.as_deref())
            }
            None => Ok(None),
        }
    }

    async fn get_role(&self, id: &RoleId) -> Result<Option<Role>, RepositoryError> {
        let row = sqlx::query("SELECT id, company_id, name FROM roles WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let id: String = row.try_get("id").map_err(query_error)?;
                let company_id: String = row.try_get("company_id").map_err(query_error)?;
                Ok(Some(Role {
                    id: parse_column("id", &id)?,
                    company_id: parse_column("company_id", &company_id)?,
                    name: row.try_get("name").map_err(query_error)?,
                }))
            }
            None => Ok(None),
        }
    }
}

impl PermissionChecker for SqliteDirectory {
    async fn has_permission(&self, user_id: &UserId, permission: &str) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM permissions WHERE user_id = ? AND permission_key = ?")
            .bind(user_id.to_string())
            .bind(permission)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        Ok(row.is_some())
    }
}
