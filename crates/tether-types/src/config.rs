//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the Tether data directory.
//! Every field has a default, so an empty or missing file is valid.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Tether engine.
///
/// Loaded from `~/.tether/config.toml` (or `$TETHER_DATA_DIR/config.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite connection URL. `None` means `sqlite://{data_dir}/tether.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Timeout for outbound callback POSTs.
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,

    /// Upper bound on payloads accepted by one batch invocation.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Re-drive unfinished runs when the engine starts.
    #[serde(default = "default_recover_on_start")]
    pub recover_on_start: bool,
}

fn default_event_buffer() -> usize {
    1024
}

fn default_callback_timeout_secs() -> u64 {
    10
}

fn default_max_batch_size() -> usize {
    500
}

fn default_recover_on_start() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            event_buffer: default_event_buffer(),
            callback_timeout_secs: default_callback_timeout_secs(),
            max_batch_size: default_max_batch_size(),
            recover_on_start: default_recover_on_start(),
        }
    }
}
