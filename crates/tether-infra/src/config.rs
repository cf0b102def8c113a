//! Data directory and configuration loading.
//!
//! Reads `config.toml` from the data directory (`~/.tether/` unless
//! `TETHER_DATA_DIR` says otherwise) into [`EngineConfig`]. A missing or
//! malformed file yields the defaults.

use std::path::{Path, PathBuf};

use tether_types::config::EngineConfig;

use crate::sqlite::pool::database_url_for;

/// Resolve the data directory.
///
/// Priority:
/// 1. `TETHER_DATA_DIR` environment variable
/// 2. `~/.tether`
/// 3. `.tether` in the working directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TETHER_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".tether");
    }
    PathBuf::from(".tether")
}

/// Load engine configuration from `{data_dir}/config.toml`.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}

/// The database URL to open: the configured one, or the data directory's
/// `tether.db`.
pub fn resolve_database_url(config: &EngineConfig, data_dir: &Path) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| database_url_for(data_dir))
}
