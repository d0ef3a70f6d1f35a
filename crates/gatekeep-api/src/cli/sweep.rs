//! Step timeout handling: the one-shot `gk sweep`, `gk expire`, and the
//! periodic sweep task run by the server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use console::style;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::state::{AppState, ConcreteEngine};

pub async fn sweep(state: &AppState, json: bool) -> Result<()> {
    let report = state.engine.sweep_expired(chrono::Utc::now()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    if report.due == 0 {
        println!("  {} No steps past their timeout.", style("✓").green().bold());
    } else {
        println!(
            "  {} {} step{} past timeout: {} expired, {} reassigned, {} failed",
            style("⏱").bold(),
            style(report.due).bold(),
            if report.due == 1 { "" } else { "s" },
            report.expired,
            report.reassigned,
            if report.failed > 0 {
                style(report.failed).red().to_string()
            } else {
                report.failed.to_string()
            }
        );
    }
    println!();
    Ok(())
}

pub async fn expire(state: &AppState, step_execution_id: &Uuid, json: bool) -> Result<()> {
    let instance = state.engine.expire(step_execution_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Step expired; instance {} is now {}",
        style("✓").green().bold(),
        style(instance.id.to_string()).dim(),
        style(instance.status).cyan()
    );
    println!();
    Ok(())
}

/// Run `sweep_expired` every `interval` until `cancel` fires.
///
/// A zero interval disables the task.
pub fn spawn_sweeper(
    engine: Arc<ConcreteEngine>,
    interval: Duration,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        tracing::info!("expiry sweep disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match engine.sweep_expired(chrono::Utc::now()).await {
                        Ok(report) if report.due > 0 => tracing::info!(
                            due = report.due,
                            expired = report.expired,
                            reassigned = report.reassigned,
                            failed = report.failed,
                            "expiry sweep finished"
                        ),
                        Ok(_) => tracing::trace!("expiry sweep found nothing due"),
                        Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
                    }
                }
            }
        }
        tracing::debug!("expiry sweep task stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;

    #[tokio::test]
    async fn test_zero_interval_disables_sweeper() {
        let state = test_state().await;
        let handle = spawn_sweeper(state.engine.clone(), Duration::ZERO, CancellationToken::new());
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let state = test_state().await;
        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(state.engine.clone(), Duration::from_millis(10), cancel.clone())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_expire_unknown_execution() {
        let state = test_state().await;
        assert!(expire(&state, &Uuid::now_v7(), true).await.is_err());
    }
}
