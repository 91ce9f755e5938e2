// src/manifest.rs

use crate::config::EngineConfig;
use crate::models::GameManifestEntry;
use crate::transport::{TransportClient, TransportError};
use crate::version;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest fetch failed: {0}")]
    Fetch(#[from] TransportError),
    #[error("manifest parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote fetch failed and no local cache exists")]
    Unavailable,
}

/// On-disk snapshot of the last successfully parsed manifest.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestCache {
    entries: Vec<GameManifestEntry>,
    last_update: u64,
}

/// A manifest as served to the collaborator: possibly the stale cache.
#[derive(Debug)]
pub struct ManifestSnapshot {
    pub entries: Vec<GameManifestEntry>,
    /// Unix seconds of the fetch that produced these entries.
    pub fetched_at: u64,
    /// True when the remote fetch failed and this is the cached fallback.
    pub stale: bool,
}

/// Fetches the remote `games.json`, keeps an atomically-written local
/// cache, and derives installed versions from the install directory.
pub struct ManifestService {
    transport: TransportClient,
    manifest_url: String,
    cache_path: PathBuf,
    install_dir: PathBuf,
}

impl ManifestService {
    pub fn new(transport: TransportClient, config: &EngineConfig) -> Self {
        Self {
            transport,
            manifest_url: config.manifest_url.clone(),
            cache_path: config.cache_path(),
            install_dir: config.install_dir.clone(),
        }
    }

    /// Fetch the remote manifest, falling back to the local cache when the
    /// server is unreachable. Entries are annotated with the locally
    /// installed version either way.
    pub async fn refresh(&self) -> Result<ManifestSnapshot, ManifestError> {
        match self.transport.get_bytes(&self.manifest_url).await {
            Ok(bytes) => {
                let entries: Vec<GameManifestEntry> = serde_json::from_slice(&bytes)?;
                let fetched_at = unix_now();
                self.write_cache(&entries, fetched_at).await?;
                info!(count = entries.len(), "manifest refreshed from server");
                Ok(ManifestSnapshot {
                    entries: self.annotate(entries).await,
                    fetched_at,
                    stale: false,
                })
            }
            Err(err) => {
                warn!("manifest fetch failed ({err}), trying local cache");
                match self.load_cache().await {
                    Some(cache) => Ok(ManifestSnapshot {
                        fetched_at: cache.last_update,
                        entries: self.annotate(cache.entries).await,
                        stale: true,
                    }),
                    None => Err(ManifestError::Unavailable),
                }
            }
        }
    }

    /// Write the cache snapshot atomically: temp file, then rename.
    async fn write_cache(
        &self,
        entries: &[GameManifestEntry],
        last_update: u64,
    ) -> Result<(), ManifestError> {
        let cache = ManifestCache {
            entries: entries.to_vec(),
            last_update,
        };
        let data = serde_json::to_vec(&cache)?;
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp = self.cache_path.with_extension("json.tmp");
        fs::write(&temp, &data).await?;
        fs::rename(&temp, &self.cache_path).await?;
        Ok(())
    }

    async fn load_cache(&self) -> Option<ManifestCache> {
        let bytes = fs::read(&self.cache_path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Fill in `installed_version` by scanning `install_dir/<name>/` for
    /// version directories; the newest one wins.
    async fn annotate(&self, mut entries: Vec<GameManifestEntry>) -> Vec<GameManifestEntry> {
        for entry in &mut entries {
            entry.installed_version = self.installed_version(&entry.name).await;
        }
        entries
    }

    async fn installed_version(&self, game_name: &str) -> Option<String> {
        let game_dir = self.install_dir.join(game_name);
        let mut read_dir = fs::read_dir(&game_dir).await.ok()?;
        let mut newest: Option<String> = None;
        while let Ok(Some(dir_entry)) = read_dir.next_entry().await {
            match dir_entry.file_type().await {
                Ok(file_type) if file_type.is_dir() => {}
                _ => continue,
            }
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            newest = match newest {
                Some(current) if !version::is_newer(&name, &current) => Some(current),
                _ => Some(name),
            };
        }
        newest
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
