//! CLI command definitions and dispatch for the `gk` binary.
//!
//! Uses clap derive macros for argument parsing. Commands that act on behalf
//! of a user take it from `--as` (or `GATEKEEP_USER`).

pub mod directory;
pub mod request;
pub mod sweep;
pub mod template;

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;

use gatekeep_types::ids::UserId;

/// Approval workflows for business documents.
#[derive(Parser)]
#[command(name = "gk", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Act as this directory user.
    #[arg(long = "as", global = true, env = "GATEKEEP_USER", value_name = "USER_ID")]
    pub as_user: Option<UserId>,

    #[command(subcommand)]
    pub command: Commands,
}

/// The acting user, required by commands that go through the engine's
/// authorization checks.
pub fn require_user(as_user: Option<UserId>) -> Result<UserId> {
    as_user.ok_or_else(|| {
        anyhow::anyhow!("this command acts on behalf of a user: pass --as <USER_ID> or set GATEKEEP_USER")
    })
}

impl Cli {
    /// Default log filter derived from the verbosity flags.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn,gatekeep=info",
            1 => "info,gatekeep=debug,sqlx=warn",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API and event stream server.
    Serve {
        /// Port to listen on (defaults to the configured port).
        #[arg(long, short)]
        port: Option<u16>,

        /// Host to bind to (defaults to the configured host).
        #[arg(long)]
        host: Option<String>,
    },

    /// Expire or escalate every step that outlived its timeout, once.
    Sweep,

    /// Expire one assigned step execution now.
    Expire {
        /// Step execution id.
        step_execution_id: uuid::Uuid,
    },

    /// Author and inspect workflow templates.
    Template {
        #[command(subcommand)]
        action: template::TemplateCommand,
    },

    /// Approval request queues.
    #[command(alias = "request")]
    Requests {
        #[command(subcommand)]
        action: request::RequestCommand,
    },

    /// Request counts per status for the acting user's company.
    Stats,

    /// Manage companies, users, roles and permissions.
    Directory {
        #[command(subcommand)]
        action: directory::DirectoryCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
