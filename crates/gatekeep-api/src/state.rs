//! Application state wiring the engine, the hub and the directory together.
//!
//! AppState holds the concrete instances used by both the CLI and the REST
//! API. The engine is generic over its repositories and directory; AppState
//! pins it to the SQLite implementations.

use std::path::PathBuf;
use std::sync::Arc;

use gatekeep_core::event::hub::NotificationHub;
use gatekeep_core::workflow::WorkflowEngine;
use gatekeep_infra::config::{load_global_config, resolve_data_dir};
use gatekeep_infra::notifier::LogNotifier;
use gatekeep_infra::sqlite::audit::SqliteAuditRepository;
use gatekeep_infra::sqlite::directory::SqliteDirectory;
use gatekeep_infra::sqlite::pool::DatabasePool;
use gatekeep_infra::sqlite::workflow::SqliteWorkflowRepository;
use gatekeep_types::config::GlobalConfig;

/// The engine pinned to the SQLite-backed infrastructure.
pub type ConcreteEngine =
    WorkflowEngine<SqliteWorkflowRepository, SqliteAuditRepository, SqliteDirectory>;

/// Shared application state.
///
/// Used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub hub: Arc<NotificationHub>,
    pub directory: SqliteDirectory,
    pub config: Arc<GlobalConfig>,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Initialize the application state: load config, connect to the DB,
    /// wire the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_global_config(&data_dir).await;
        let db_pool = DatabasePool::open(&data_dir).await?;

        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");
        Ok(Self::from_parts(data_dir, config, db_pool))
    }

    /// Wire the engine over an already opened pool.
    pub fn from_parts(data_dir: PathBuf, config: GlobalConfig, db_pool: DatabasePool) -> Self {
        let directory = SqliteDirectory::new(db_pool.clone());
        let hub = Arc::new(NotificationHub::new(config.hub.clone()));

        let engine = WorkflowEngine::new(
            SqliteWorkflowRepository::new(db_pool.clone()),
            SqliteAuditRepository::new(db_pool.clone()),
            directory.clone(),
            hub.clone(),
            config.engine.clone(),
        )
        .with_notifier(Arc::new(LogNotifier::new(Arc::new(directory.clone()))));

        Self {
            engine: Arc::new(engine),
            hub,
            directory,
            config: Arc::new(config),
            data_dir,
            db_pool,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// State over a fresh SQLite database in a leaked temp dir.
    pub async fn test_state() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        let pool = DatabasePool::open(&data_dir).await.unwrap();
        // Keep the directory alive for the duration of the test process.
        std::mem::forget(dir);
        AppState::from_parts(data_dir, GlobalConfig::default(), pool)
    }
}
