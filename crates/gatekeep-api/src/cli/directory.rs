//! Directory administration: companies, users, roles and grants.
//!
//! These write straight to the SQLite directory and bypass the engine's
//! permission checks; they are operator commands.

use anyhow::{Context, Result};
use clap::Subcommand;
use console::style;

use gatekeep_types::ids::{CompanyId, RoleId, UserId};

use crate::state::AppState;

#[derive(Subcommand)]
pub enum DirectoryCommand {
    /// Create a company.
    AddCompany { name: String },

    /// Create an active user in a company.
    AddUser {
        #[arg(long)]
        company: CompanyId,

        /// Display name.
        name: String,

        #[arg(long)]
        email: Option<String>,
    },

    /// Create a role in a company.
    AddRole {
        #[arg(long)]
        company: CompanyId,

        name: String,
    },

    /// Give a user a role.
    GrantRole { user: UserId, role: RoleId },

    /// Give a user a permission key (e.g. create_workflow).
    GrantPermission { user: UserId, permission: String },

    /// Set (or clear, without a role) the role the user currently acts in.
    SetCurrentRole { user: UserId, role: Option<RoleId> },

    /// Mark a user inactive. Inactive users can neither act nor be assigned.
    DeactivateUser { user: UserId },
}

pub async fn handle_directory_command(
    cmd: DirectoryCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let dir = &state.directory;
    let value = match cmd {
        DirectoryCommand::AddCompany { name } => {
            let id = dir.create_company(&name).await?;
            serde_json::json!({"company_id": id, "name": name})
        }
        DirectoryCommand::AddUser {
            company,
            name,
            email,
        } => {
            let user = dir
                .create_user(company, &name, email.as_deref())
                .await
                .with_context(|| format!("company {company} does not exist"))?;
            serde_json::to_value(&user)?
        }
        DirectoryCommand::AddRole { company, name } => {
            let role = dir.create_role(company, &name).await?;
            serde_json::to_value(&role)?
        }
        DirectoryCommand::GrantRole { user, role } => {
            dir.grant_role(&user, &role).await?;
            serde_json::json!({"user_id": user, "role_id": role})
        }
        DirectoryCommand::GrantPermission { user, permission } => {
            dir.grant_permission(&user, &permission).await?;
            serde_json::json!({"user_id": user, "permission": permission})
        }
        DirectoryCommand::SetCurrentRole { user, role } => {
            dir.set_current_role(&user, role.as_ref()).await?;
            serde_json::json!({"user_id": user, "current_role_id": role})
        }
        DirectoryCommand::DeactivateUser { user } => {
            dir.set_user_active(&user, false).await?;
            serde_json::json!({"user_id": user, "is_active": false})
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!("  {} Done", style("✓").green().bold());
    if let Some(fields) = value.as_object() {
        for (key, field) in fields {
            let shown = field
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| field.to_string());
            println!("  {}  {}", style(format!("{key}:")).bold(), shown);
        }
    }
    println!();
    Ok(())
}
