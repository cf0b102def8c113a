//! Application state wiring the engine to its SQLite store and HTTP clients.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tether_core::engine::Engine;
use tether_core::repository::BoxCheckpointStore;
use tether_infra::config::{load_engine_config, resolve_data_dir, resolve_database_url};
use tether_infra::http::callback::HttpCallbackNotifier;
use tether_infra::sqlite::{DatabasePool, SqliteCheckpointStore};

use crate::jobs::{DemoConfig, demo_jobs};

/// Shared application state for CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Initialize the application state: open the database, register the
    /// demo jobs and build the engine. The engine is not started.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();

        // Ensure data directory exists
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let db_url = resolve_database_url(&config, &data_dir);
        let db_pool = DatabasePool::new(&db_url).await?;

        let notifier = HttpCallbackNotifier::new(Duration::from_secs(config.callback_timeout_secs))?;

        let mut builder = Engine::builder()
            .config(config)
            .store(BoxCheckpointStore::new(SqliteCheckpointStore::new(db_pool)))
            .notifier(Arc::new(notifier));
        for job in demo_jobs(&DemoConfig::from_env()) {
            builder = builder.job(job)?;
        }

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");

        Ok(Self {
            engine: Arc::new(builder.build()),
            data_dir,
        })
    }
}
