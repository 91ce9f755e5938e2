// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine-wide configuration shared by the scheduler, transport and updater.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for installed games (`install_dir/game_name/version/`).
    pub install_dir: PathBuf,
    /// Directory for in-flight download staging files.
    pub staging_dir: PathBuf,
    /// URL of the remote `games.json` manifest.
    pub manifest_url: String,
    /// URL of the launcher's own `update.json` manifest.
    pub update_url: String,
    /// Upper bound on simultaneously active transfers.
    pub max_concurrent_downloads: usize,
    /// Strict TLS certificate validation when true.
    pub verify_tls: bool,
    pub request_timeout: Duration,
    /// Maximum attempts per task, including the first.
    pub max_attempts: u32,
    /// Seconds the swap helper waits for the relaunched binary before rollback.
    pub swap_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("apps"),
            staging_dir: PathBuf::from("apps/.staging"),
            manifest_url: String::new(),
            update_url: String::new(),
            max_concurrent_downloads: 3,
            verify_tls: true,
            request_timeout: Duration::from_secs(30),
            max_attempts: 5,
            swap_grace_secs: 10,
        }
    }
}

impl EngineConfig {
    /// Path of the manifest cache snapshot.
    pub fn cache_path(&self) -> PathBuf {
        self.install_dir.join("games_cache.json")
    }

    /// Path of the task/marker database.
    pub fn state_db_path(&self) -> PathBuf {
        self.install_dir.join("engine_state.db")
    }
}
