//! Approval request CLI commands: queue listing and counts.

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use gatekeep_types::approval::{ApprovalFilter, ApprovalRequest, ApprovalStatus, Priority};
use gatekeep_types::ids::UserId;

use crate::cli::template::acting_company;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum RequestCommand {
    /// List approval requests, newest first.
    #[command(alias = "ls")]
    List {
        /// Filter by status (pending, in_review, more_info_required, approved, rejected, expired).
        #[arg(long)]
        status: Option<ApprovalStatus>,

        /// Only requests assigned directly to the acting user.
        #[arg(long)]
        mine: bool,

        #[arg(long)]
        priority: Option<Priority>,

        /// Maximum number of requests (clamped to the configured limit).
        #[arg(long, short = 'n')]
        limit: Option<u32>,
    },
}

pub async fn handle_request_command(
    cmd: RequestCommand,
    state: &AppState,
    actor: UserId,
    json: bool,
) -> Result<()> {
    match cmd {
        RequestCommand::List {
            status,
            mine,
            priority,
            limit,
        } => {
            let filter = ApprovalFilter {
                status,
                assigned_to: mine.then_some(actor),
                priority,
                limit,
                ..Default::default()
            };
            list_requests(state, actor, &filter, json).await
        }
    }
}

async fn list_requests(
    state: &AppState,
    actor: UserId,
    filter: &ApprovalFilter,
    json: bool,
) -> Result<()> {
    let company_id = acting_company(state, &actor).await?;
    let requests = state.engine.get_approval_requests(&company_id, filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&requests)?);
        return Ok(());
    }

    if requests.is_empty() {
        println!();
        println!("  {} No approval requests match.", style("i").blue().bold());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Title").fg(Color::White),
        Cell::new("Step").fg(Color::White),
        Cell::new("Priority").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Assignee").fg(Color::White),
        Cell::new("Requested").fg(Color::White),
        Cell::new("ID").fg(Color::White),
    ]);

    for request in &requests {
        table.add_row(vec![
            Cell::new(&request.title).fg(Color::Cyan),
            Cell::new(request.step_number),
            priority_cell(request.priority),
            status_cell(request.status),
            Cell::new(assignee_label(request)),
            Cell::new(request.requested_at.format("%Y-%m-%d %H:%M")).fg(Color::DarkGrey),
            Cell::new(request.id.to_string()).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} request{}",
        style(requests.len()).bold(),
        if requests.len() == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

/// Counts per status for the acting user's company.
pub async fn stats(state: &AppState, actor: UserId, json: bool) -> Result<()> {
    let company_id = acting_company(state, &actor).await?;
    let stats = state.engine.get_approval_stats(&company_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!();
    println!("  {}", style("Approval requests").bold().underlined());
    println!();
    for status in [
        ApprovalStatus::Pending,
        ApprovalStatus::InReview,
        ApprovalStatus::MoreInfoRequired,
        ApprovalStatus::Approved,
        ApprovalStatus::Rejected,
        ApprovalStatus::Expired,
    ] {
        println!("  {:<20} {}", status.as_str(), style(stats.count(status)).bold());
    }
    println!();
    println!(
        "  {:<20} {}   ({} open)",
        "total",
        style(stats.total).bold(),
        style(stats.open()).yellow()
    );
    println!();
    Ok(())
}

fn assignee_label(request: &ApprovalRequest) -> String {
    match (request.assigned_to, request.assigned_role) {
        (Some(user), _) => format!("user {user}"),
        (None, Some(role)) => format!("role {role}"),
        (None, None) => "-".to_string(),
    }
}

fn status_cell(status: ApprovalStatus) -> Cell {
    let color = match status {
        ApprovalStatus::Pending => Color::Yellow,
        ApprovalStatus::InReview => Color::Blue,
        ApprovalStatus::MoreInfoRequired => Color::Magenta,
        ApprovalStatus::Approved => Color::Green,
        ApprovalStatus::Rejected => Color::Red,
        ApprovalStatus::Expired => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}

fn priority_cell(priority: Priority) -> Cell {
    let cell = Cell::new(priority.to_string());
    match priority {
        Priority::Critical | Priority::Urgent => cell.fg(Color::Red),
        Priority::High => cell.fg(Color::Yellow),
        Priority::Low | Priority::Medium => cell,
    }
}
