//! Gatekeep CLI and REST API entry point.
//!
//! Binary name: `gk`
//!
//! Parses CLI arguments, initializes the database and the engine, then
//! dispatches to the appropriate command handler or starts the server.

mod cli;
mod http;
mod state;

use std::time::Duration;

use clap::Parser;
use clap_complete::generate;
use tokio_util::sync::CancellationToken;

use cli::template::TemplateCommand;
use cli::{Cli, Commands};
use gatekeep_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        default_filter: Some(cli.log_filter().to_string()),
        ..TracingOptions::from_env()
    };
    init_tracing(options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions and offline validation don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "gk", &mut std::io::stdout());
        return Ok(());
    }
    if let Commands::Template {
        action: TemplateCommand::Validate { file },
    } = &cli.command
    {
        return cli::template::validate_file(file, cli.json).await;
    }

    let state = AppState::init().await?;

    let result = run(cli, state).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli, state: AppState) -> anyhow::Result<()> {
    let Cli {
        json,
        as_user,
        command,
        ..
    } = cli;

    match command {
        Commands::Serve { port, host } => serve(state, host, port).await?,

        Commands::Sweep => cli::sweep::sweep(&state, json).await?,

        Commands::Expire { step_execution_id } => {
            cli::sweep::expire(&state, &step_execution_id, json).await?;
        }

        Commands::Template { action } => {
            cli::template::handle_template_command(action, &state, as_user, json).await?;
        }

        Commands::Requests { action } => {
            let actor = cli::require_user(as_user)?;
            cli::request::handle_request_command(action, &state, actor, json).await?;
        }

        Commands::Stats => {
            cli::request::stats(&state, cli::require_user(as_user)?, json).await?;
        }

        Commands::Directory { action } => {
            cli::directory::handle_directory_command(action, &state, json).await?;
        }

        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}

async fn serve(state: AppState, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| state.config.server.host.clone());
    let port = port.unwrap_or(state.config.server.port);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let background = CancellationToken::new();
    let heartbeat = state.hub.spawn_heartbeat(
        Duration::from_secs(state.config.hub.heartbeat_interval_secs),
        background.clone(),
    );
    let sweeper = cli::sweep::spawn_sweeper(
        state.engine.clone(),
        Duration::from_secs(state.config.engine.sweep_interval_secs),
        background.clone(),
    );

    println!(
        "  {} Gatekeep API listening on {}",
        console::style("⚡").bold(),
        console::style(format!("http://{addr}")).cyan()
    );
    println!("  {}", console::style("Press Ctrl+C to stop").dim());
    tracing::info!(%addr, "server started");

    let hub = state.hub.clone();
    let db_pool = state.db_pool.clone();
    let router = http::router::build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    background.cancel();
    hub.shutdown();
    let _ = heartbeat.await;
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }
    db_pool.close().await;

    println!("\n  Server stopped.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
