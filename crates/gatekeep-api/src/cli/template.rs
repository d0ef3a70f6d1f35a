//! Template CLI commands: validate, create, list, show, deactivate.
//!
//! Template files are JSON, or TOML when the extension is `.toml`, and hold
//! a template draft (name, entity_type, trigger, steps).

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use gatekeep_core::repository::workflow::TemplateFilter;
use gatekeep_core::workflow::template::{template_from_draft, validate_template};
use gatekeep_types::entity::EntityType;
use gatekeep_types::ids::{CompanyId, UserId};
use gatekeep_types::template::{TemplateDraft, WorkflowTemplate};

use crate::cli::require_user;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum TemplateCommand {
    /// Check a template file offline without saving it.
    Validate {
        /// Path to the template draft (.json or .toml).
        file: std::path::PathBuf,
    },

    /// Create a template from a file.
    Create {
        file: std::path::PathBuf,
    },

    /// List the acting user's company templates.
    #[command(alias = "ls")]
    List {
        /// Only templates for this entity type (e.g. purchase_order).
        #[arg(long)]
        entity_type: Option<String>,

        /// Hide inactive templates.
        #[arg(long)]
        active_only: bool,
    },

    /// Show one template with its steps.
    Show { id: Uuid },

    /// Deactivate a template. Running instances are unaffected.
    Deactivate { id: Uuid },
}

/// Handle a template subcommand that needs application state.
pub async fn handle_template_command(
    cmd: TemplateCommand,
    state: &AppState,
    actor: Option<UserId>,
    json: bool,
) -> Result<()> {
    let actor = || require_user(actor);
    match cmd {
        TemplateCommand::Validate { file } => validate_file(&file, json).await,
        TemplateCommand::Create { file } => create(state, actor()?, &file, json).await,
        TemplateCommand::List {
            entity_type,
            active_only,
        } => list(state, actor()?, entity_type, active_only, json).await,
        TemplateCommand::Show { id } => show(state, actor()?, &id, json).await,
        TemplateCommand::Deactivate { id } => deactivate(state, actor()?, &id, json).await,
    }
}

/// Parse a draft from JSON, or TOML when the extension says so.
pub fn parse_draft(path: &Path, content: &str) -> Result<TemplateDraft> {
    let draft = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(content)
            .with_context(|| format!("{} is not a valid template draft", path.display()))?,
        _ => serde_json::from_str(content)
            .with_context(|| format!("{} is not a valid template draft", path.display()))?,
    };
    Ok(draft)
}

async fn read_draft(path: &Path) -> Result<TemplateDraft> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_draft(path, &content)
}

/// Structural validation only; assignees are checked against the directory
/// on `create`.
pub async fn validate_file(path: &Path, json: bool) -> Result<()> {
    let draft = read_draft(path).await?;
    let template = template_from_draft(draft, CompanyId::new(), UserId::new());
    let violations = match validate_template(&template) {
        Ok(()) => Vec::new(),
        Err(e) => e.violations,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "file": path.display().to_string(),
                "valid": violations.is_empty(),
                "violations": violations,
            }))?
        );
    } else if violations.is_empty() {
        println!();
        println!(
            "  {} {} is valid ({} step{})",
            style("✓").green().bold(),
            style(path.display()).cyan(),
            template.steps.len(),
            if template.steps.len() == 1 { "" } else { "s" }
        );
        println!();
    } else {
        println!();
        println!(
            "  {} {} has {} problem{}:",
            style("✗").red().bold(),
            style(path.display()).cyan(),
            violations.len(),
            if violations.len() == 1 { "" } else { "s" }
        );
        for violation in &violations {
            println!("    {} {violation}", style("•").dim());
        }
        println!();
    }

    if violations.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("template validation failed")
    }
}

async fn create(state: &AppState, actor: UserId, path: &Path, json: bool) -> Result<()> {
    let draft = read_draft(path).await?;
    let template = state.engine.create_template(actor, draft).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&template)?);
        return Ok(());
    }

    println!();
    println!("  {} Template created", style("✓").green().bold());
    println!();
    print_summary(&template);
    println!();
    Ok(())
}

async fn list(
    state: &AppState,
    actor: UserId,
    entity_type: Option<String>,
    active_only: bool,
    json: bool,
) -> Result<()> {
    let company_id = acting_company(state, &actor).await?;
    let entity_type = entity_type
        .map(|e| e.parse::<EntityType>().map_err(|e| anyhow::anyhow!(e)))
        .transpose()?;
    let filter = TemplateFilter {
        entity_type,
        active_only,
    };
    let templates = state.engine.list_templates(&company_id, &filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&templates)?);
        return Ok(());
    }

    if templates.is_empty() {
        println!();
        println!(
            "  {} No templates found. Create one with: {}",
            style("i").blue().bold(),
            style("gk template create <file>").yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Name").fg(Color::White),
        Cell::new("Entity").fg(Color::White),
        Cell::new("Trigger").fg(Color::White),
        Cell::new("Steps").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("ID").fg(Color::White),
    ]);

    for template in &templates {
        let status_cell = if template.is_active {
            Cell::new("● active").fg(Color::Green)
        } else {
            Cell::new("○ inactive").fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(&template.name).fg(Color::Cyan),
            Cell::new(template.entity_type.label()),
            Cell::new(template.trigger_type.to_string()),
            Cell::new(template.steps.len()),
            status_cell,
            Cell::new(template.id.to_string()).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn show(state: &AppState, actor: UserId, id: &Uuid, json: bool) -> Result<()> {
    let template = state.engine.get_template(actor, id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&template)?);
        return Ok(());
    }

    println!();
    print_summary(&template);
    println!();

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_header(vec!["#", "Step", "Type", "Assignee", "Required", "Timeout"]);
    for step in &template.steps {
        let assignee = match (step.assignee_user_id, step.assignee_role_id) {
            (Some(user), _) => format!("user {user}"),
            (None, Some(role)) => format!("role {role}"),
            (None, None) => "-".to_string(),
        };
        table.add_row(vec![
            step.step_number.to_string(),
            step.name.clone(),
            step.step_type.to_string(),
            assignee,
            if step.is_required { "yes" } else { "no" }.to_string(),
            step.timeout_hours
                .map(|h| format!("{h}h"))
                .unwrap_or_else(|| "-".to_string()),
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}

async fn deactivate(state: &AppState, actor: UserId, id: &Uuid, json: bool) -> Result<()> {
    let template = state.engine.deactivate_template(actor, id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&template)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Template '{}' deactivated",
        style("✓").green().bold(),
        style(&template.name).cyan()
    );
    println!();
    Ok(())
}

fn print_summary(template: &WorkflowTemplate) {
    println!("  {}  {}", style("Name:").bold(), style(&template.name).cyan());
    println!("  {}  {}", style("Entity:").bold(), template.entity_type.label());
    println!("  {}  {}", style("Trigger:").bold(), template.trigger_type);
    println!("  {}  {}", style("Steps:").bold(), template.steps.len());
    println!(
        "  {}  {}",
        style("ID:").bold(),
        style(template.id.to_string()).dim()
    );
}

/// Company of the acting user, failing like the engine does for unknown or
/// inactive users.
pub async fn acting_company(state: &AppState, actor: &UserId) -> Result<CompanyId> {
    use gatekeep_core::directory::IdentityDirectory;

    match state.directory.get_user(actor).await? {
        Some(user) if user.is_active => Ok(user.company_id),
        _ => anyhow::bail!("user {actor} is not an active member of any company"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeep_types::template::TriggerType;

    #[test]
    fn test_parse_json_draft() {
        let content = r#"{
            "name": "Invoices",
            "entity_type": "invoice",
            "trigger_type": "threshold",
            "trigger_conditions": {"field": "total", "op": "gt", "value": 5000},
            "steps": []
        }"#;
        let draft = parse_draft(Path::new("invoice.json"), content).unwrap();
        assert_eq!(draft.trigger_type, TriggerType::Threshold);
        assert!(draft.is_active);
        assert!(draft.trigger_conditions.is_some());
    }

    #[test]
    fn test_parse_toml_draft() {
        let role = gatekeep_types::ids::RoleId::new();
        let content = format!(
            r#"
name = "PO over 10k"
entity_type = "purchase_order"

[[steps]]
step_number = 1
name = "Finance"
type = "approval"
assignee_type = "role"
assignee_role_id = "{role}"
timeout_hours = 48
"#
        );
        let draft = parse_draft(Path::new("po.toml"), &content).unwrap();
        assert_eq!(draft.steps.len(), 1);
        assert_eq!(draft.steps[0].assignee_role_id, Some(role));
        assert_eq!(draft.steps[0].timeout_hours, Some(48));
        assert!(draft.steps[0].is_required);
    }

    #[tokio::test]
    async fn test_validate_file_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, r#"{"name": "", "entity_type": "expense", "steps": []}"#)
            .await
            .unwrap();
        assert!(validate_file(&path, true).await.is_err());

        let path = dir.path().join("ok.json");
        let user = UserId::new();
        let draft = serde_json::json!({
            "name": "Expenses",
            "entity_type": "expense",
            "steps": [{
                "step_number": 1,
                "name": "Manager",
                "type": "approval",
                "assignee_type": "user",
                "assignee_user_id": user,
            }]
        });
        tokio::fs::write(&path, draft.to_string()).await.unwrap();
        assert!(validate_file(&path, true).await.is_ok());
    }
}
