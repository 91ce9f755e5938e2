// src/updater.rs

use crate::models::{
    EngineEvent, GameManifestEntry, Requirements, TaskKind, TaskStatus, UpdateCheckState,
    UpdateState,
};
use crate::scheduler::{DownloadScheduler, SchedulerError};
use crate::state::{StateError, StateStore};
use crate::transport::{TransportClient, TransportError};
use crate::version;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Background checks are skipped if the last one is younger than this.
const CHECK_INTERVAL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update check failed: {0}")]
    Fetch(#[from] TransportError),
    #[error("update manifest parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("state store error: {0}")]
    State(#[from] StateError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("update download failed: {detail}")]
    DownloadFailed { detail: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The launcher's own `update.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateInfo {
    pub version: String,
    pub download_url: String,
    pub checksum: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub changelog: String,
}

/// Outcome of a (possibly gated) update check.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    /// The daily gate suppressed this check.
    Skipped,
    UpToDate,
    UpdateAvailable(UpdateInfo),
}

/// Compares installed vs. available launcher versions and drives the
/// download / stage / swap pipeline for self-updates.
pub struct UpdateOrchestrator {
    transport: TransportClient,
    scheduler: Arc<DownloadScheduler>,
    state: StateStore,
    events: mpsc::UnboundedSender<EngineEvent>,
    current_version: String,
    update_url: String,
    swap_grace_secs: u64,
}

impl UpdateOrchestrator {
    pub fn new(
        transport: TransportClient,
        scheduler: Arc<DownloadScheduler>,
        state: StateStore,
        events: mpsc::UnboundedSender<EngineEvent>,
        current_version: String,
        update_url: String,
        swap_grace_secs: u64,
    ) -> Self {
        Self {
            transport,
            scheduler,
            state,
            events,
            current_version,
            update_url,
            swap_grace_secs,
        }
    }

    fn emit(&self, state: UpdateState) {
        let _ = self.events.send(EngineEvent::UpdateStateChanged(state));
    }

    /// Check the remote update manifest. Unforced checks are skipped when the
    /// persisted marker is less than a day old. The marker is written after
    /// every definitive attempt; a transient network failure leaves it alone
    /// so the retry is not delayed.
    pub async fn check(&self, force: bool) -> Result<CheckOutcome, UpdateError> {
        self.emit(UpdateState::CheckPending);

        if !force {
            if let Some(marker) = self.state.read_update_marker().await? {
                if !check_due(&marker, unix_now()) {
                    info!("update check skipped, last check within 24h");
                    return Ok(CheckOutcome::Skipped);
                }
            }
        }

        self.emit(UpdateState::Comparing);

        let bytes = match self.transport.get_bytes(&self.update_url).await {
            Ok(bytes) => bytes,
            Err(TransportError::HttpStatus { status }) if (400..500).contains(&status) => {
                // The server definitively has no update manifest for us.
                self.write_marker(None).await?;
                return Err(UpdateError::Fetch(TransportError::HttpStatus { status }));
            }
            Err(err) => return Err(UpdateError::Fetch(err)),
        };

        let info: UpdateInfo = match serde_json::from_slice(&bytes) {
            Ok(info) => info,
            Err(err) => {
                self.write_marker(None).await?;
                return Err(UpdateError::Parse(err));
            }
        };

        self.write_marker(Some(info.version.clone())).await?;

        if version::is_newer(&info.version, &self.current_version) {
            info!(
                remote = %info.version,
                local = %self.current_version,
                "launcher update available"
            );
            self.emit(UpdateState::UpdateAvailable {
                version: info.version.clone(),
            });
            Ok(CheckOutcome::UpdateAvailable(info))
        } else {
            self.emit(UpdateState::UpToDate);
            Ok(CheckOutcome::UpToDate)
        }
    }

    async fn write_marker(&self, last_remote_version: Option<String>) -> Result<(), UpdateError> {
        self.state
            .write_update_marker(&UpdateCheckState {
                last_check: unix_now(),
                last_remote_version,
            })
            .await?;
        Ok(())
    }

    /// Download and verify the new launcher package through the regular
    /// scheduler pipeline; returns the staged binary path on success.
    pub async fn download_and_stage(&self, info: &UpdateInfo) -> Result<PathBuf, UpdateError> {
        self.emit(UpdateState::Downloading);

        let entry = launcher_entry(info);
        let task_id = self
            .scheduler
            .submit(entry, TaskKind::LauncherPackage)
            .await?;

        let mut verifying_seen = false;
        loop {
            let status = self.scheduler.task_status(task_id).await;
            match status {
                Some(TaskStatus::Verifying) if !verifying_seen => {
                    verifying_seen = true;
                    self.emit(UpdateState::Verifying);
                }
                Some(TaskStatus::Succeeded) => break,
                Some(TaskStatus::Failed { detail, .. }) => {
                    return Err(UpdateError::DownloadFailed { detail });
                }
                Some(TaskStatus::Cancelled) => {
                    return Err(UpdateError::DownloadFailed {
                        detail: "update download cancelled".into(),
                    });
                }
                None => {
                    return Err(UpdateError::DownloadFailed {
                        detail: "update task disappeared".into(),
                    });
                }
                _ => {}
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let staged = self
            .scheduler
            .all_tasks()
            .await
            .into_iter()
            .find(|t| t.id == task_id)
            .map(|t| t.staging_path)
            .ok_or_else(|| UpdateError::DownloadFailed {
                detail: "update task disappeared".into(),
            })?;

        self.emit(UpdateState::Staged);
        Ok(staged)
    }

    /// Hand the swap to a detached helper process that outlives us: it
    /// renames old→backup and staged→live, relaunches, and rolls back
    /// unless the relaunched binary survives the grace period. The caller
    /// must exit promptly after this returns.
    pub fn spawn_swap_helper(&self, staged: &Path) -> Result<(), UpdateError> {
        let live = std::env::current_exe()?;
        let backup = backup_path(&live);
        let marker = rollback_marker_path(&live);
        let script_path = staged.with_file_name(helper_script_name());

        // The staging file is written 0644; the relaunch needs the exec bit.
        mark_executable(staged)?;

        let script = render_helper_script(
            std::process::id(),
            &live,
            &backup,
            staged,
            &marker,
            self.swap_grace_secs,
        );
        std::fs::write(&script_path, script)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))?;
        }

        self.emit(UpdateState::Swapping);
        info!("spawning update helper {}", script_path.display());

        let mut command = helper_command(&script_path);
        command
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        Ok(())
    }

    /// Called at startup: surface the outcome of a swap attempted by the
    /// previous session. A rollback is never silently swallowed.
    pub async fn finalize_startup(&self) -> Result<Option<UpdateState>, UpdateError> {
        let live = std::env::current_exe()?;
        self.finalize_at(&live).await
    }

    async fn finalize_at(&self, live: &Path) -> Result<Option<UpdateState>, UpdateError> {
        let marker = rollback_marker_path(live);
        if let Ok(reason) = tokio::fs::read_to_string(&marker).await {
            let _ = tokio::fs::remove_file(&marker).await;
            warn!("previous launcher update was rolled back: {reason}");
            let state = UpdateState::RolledBack { reason };
            self.emit(state.clone());
            return Ok(Some(state));
        }

        let backup = backup_path(live);
        if tokio::fs::metadata(&backup).await.is_ok() {
            // The helper may still be inside its grace window and needs the
            // backup to roll back; reclaim the file only after that window.
            let delay = Duration::from_secs(self.swap_grace_secs + 5);
            let leftover = backup.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tokio::fs::remove_file(&leftover).await;
            });
            self.emit(UpdateState::Completed);
            return Ok(Some(UpdateState::Completed));
        }

        Ok(None)
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// True when enough time has passed since the last definitive check.
fn check_due(marker: &UpdateCheckState, now: u64) -> bool {
    now.saturating_sub(marker.last_check) >= CHECK_INTERVAL_SECS
}

/// The launcher package rides the normal task pipeline as a synthetic
/// manifest entry.
fn launcher_entry(info: &UpdateInfo) -> GameManifestEntry {
    let executable = info
        .download_url
        .rsplit('/')
        .next()
        .unwrap_or("launcher")
        .to_string();
    GameManifestEntry {
        name: "launcher".into(),
        version: info.version.clone(),
        installed_version: None,
        download_url: info.download_url.clone(),
        size: info.file_size,
        checksum: info.checksum.clone(),
        executable_path: PathBuf::from(executable),
        description: info.changelog.clone(),
        requirements: Requirements::default(),
    }
}

fn backup_path(live: &Path) -> PathBuf {
    live.with_extension("old")
}

fn rollback_marker_path(live: &Path) -> PathBuf {
    live.with_extension("rollback")
}

fn helper_script_name() -> &'static str {
    if cfg!(windows) {
        "apply_update.bat"
    } else {
        "apply_update.sh"
    }
}

fn helper_command(script: &Path) -> std::process::Command {
    if cfg!(windows) {
        let mut cmd = std::process::Command::new("cmd");
        cmd.arg("/C").arg(script);
        cmd
    } else {
        let mut cmd = std::process::Command::new("sh");
        cmd.arg(script);
        cmd
    }
}

#[cfg(not(windows))]
fn render_helper_script(
    pid: u32,
    live: &Path,
    backup: &Path,
    staged: &Path,
    marker: &Path,
    grace_secs: u64,
) -> String {
    format!(
        r#"#!/bin/sh
# Swap the launcher binary once the old process exits, then verify the relaunch.
while kill -0 {pid} 2>/dev/null; do sleep 1; done
mv "{live}" "{backup}" || exit 1
if ! mv "{staged}" "{live}"; then
    mv "{backup}" "{live}"
    printf 'swap rename failed' > "{marker}"
    exit 1
fi
"{live}" &
new_pid=$!
sleep {grace_secs}
if kill -0 "$new_pid" 2>/dev/null; then
    rm -f "{backup}"
else
    mv -f "{backup}" "{live}"
    printf 'relaunched binary exited within the grace period' > "{marker}"
fi
rm -f "$0"
"#,
        pid = pid,
        live = live.display(),
        backup = backup.display(),
        staged = staged.display(),
        marker = marker.display(),
        grace_secs = grace_secs,
    )
}

#[cfg(windows)]
fn render_helper_script(
    pid: u32,
    live: &Path,
    backup: &Path,
    staged: &Path,
    marker: &Path,
    grace_secs: u64,
) -> String {
    let exe_name = live
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "launcher.exe".into());
    format!(
        r#"@echo off
:wait
tasklist /fi "PID eq {pid}" | find "{pid}" >nul
if not errorlevel 1 (
    timeout /t 1 /nobreak >nul
    goto wait
)
move /Y "{live}" "{backup}" >nul || exit /b 1
move /Y "{staged}" "{live}" >nul
if errorlevel 1 (
    move /Y "{backup}" "{live}" >nul
    echo swap rename failed> "{marker}"
    exit /b 1
)
start "" "{live}"
timeout /t {grace_secs} /nobreak >nul
tasklist /fi "imagename eq {exe_name}" | find "{exe_name}" >nul
if errorlevel 1 (
    move /Y "{backup}" "{live}" >nul
    echo relaunch failed> "{marker}"
) else (
    del "{backup}" >nul
)
del "%~f0" >nul
"#,
        pid = pid,
        live = live.display(),
        backup = backup.display(),
        staged = staged.display(),
        marker = marker.display(),
        grace_secs = grace_secs,
        exe_name = exe_name,
    )
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    async fn orchestrator(
        dir: &Path,
        swap_grace_secs: u64,
    ) -> (UpdateOrchestrator, mpsc::UnboundedReceiver<EngineEvent>) {
        let config = EngineConfig {
            install_dir: dir.to_path_buf(),
            staging_dir: dir.join(".staging"),
            ..Default::default()
        };
        let state = StateStore::new(&dir.join("state.db")).await.unwrap();
        let transport = TransportClient::new(true, Duration::from_secs(2));
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(
            DownloadScheduler::new(&config, state.clone(), transport.clone(), tx.clone())
                .await
                .unwrap(),
        );
        let orch = UpdateOrchestrator::new(
            transport,
            scheduler,
            state,
            tx,
            "1.0.0".into(),
            String::new(),
            swap_grace_secs,
        );
        (orch, rx)
    }

    #[test]
    fn daily_gate_blocks_recent_checks() {
        let marker = UpdateCheckState {
            last_check: 1_000_000,
            last_remote_version: None,
        };
        assert!(!check_due(&marker, 1_000_000 + CHECK_INTERVAL_SECS - 1));
        assert!(check_due(&marker, 1_000_000 + CHECK_INTERVAL_SECS));
        // A clock that went backwards behaves as "recent".
        assert!(!check_due(&marker, 999_999));
    }

    #[test]
    fn launcher_entry_mirrors_update_info() {
        let info = UpdateInfo {
            version: "1.1.0".into(),
            download_url: "http://example.com/dl/launcher-1.1.0.bin".into(),
            checksum: "ABC123".into(),
            file_size: 4096,
            changelog: "fixes".into(),
        };
        let entry = launcher_entry(&info);
        assert_eq!(entry.name, "launcher");
        assert_eq!(entry.version, "1.1.0");
        assert_eq!(entry.size, 4096);
        assert_eq!(entry.executable_path, PathBuf::from("launcher-1.1.0.bin"));
    }

    #[cfg(unix)]
    #[test]
    fn staged_binary_gains_exec_bit() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("launcher_1.1.0.part");
        std::fs::write(&staged, b"\x7fELF").unwrap();
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert_eq!(
            std::fs::metadata(&staged).unwrap().permissions().mode() & 0o111,
            0
        );

        mark_executable(&staged).unwrap();
        let mode = std::fs::metadata(&staged).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111, "staged binary must be executable");
    }

    #[tokio::test]
    async fn rollback_marker_is_surfaced_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, mut rx) = orchestrator(dir.path(), 0).await;

        let live = dir.path().join("gamedock");
        let marker = rollback_marker_path(&live);
        tokio::fs::write(&marker, "relaunch failed").await.unwrap();

        let outcome = orch.finalize_at(&live).await.unwrap();
        assert_eq!(
            outcome,
            Some(UpdateState::RolledBack {
                reason: "relaunch failed".into()
            })
        );
        assert!(!marker.exists(), "marker consumed after surfacing");
        assert!(matches!(
            rx.recv().await,
            Some(EngineEvent::UpdateStateChanged(UpdateState::RolledBack { .. }))
        ));
    }

    #[tokio::test]
    async fn leftover_backup_survives_the_grace_window() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _rx) = orchestrator(dir.path(), 5).await;

        let live = dir.path().join("gamedock");
        let backup = backup_path(&live);
        tokio::fs::write(&backup, b"old binary").await.unwrap();

        let outcome = orch.finalize_at(&live).await.unwrap();
        assert_eq!(outcome, Some(UpdateState::Completed));
        // The helper still needs the backup for a rollback while its
        // health check runs; reclamation must not happen synchronously.
        assert!(backup.exists());
    }

    #[cfg(not(windows))]
    #[test]
    fn helper_script_contains_swap_and_rollback_steps() {
        let script = render_helper_script(
            4242,
            Path::new("/opt/launcher/gamedock"),
            Path::new("/opt/launcher/gamedock.old"),
            Path::new("/opt/launcher/.staging/launcher_1.1.0.part"),
            Path::new("/opt/launcher/gamedock.rollback"),
            10,
        );
        assert!(script.contains("kill -0 4242"));
        assert!(script.contains(r#"mv "/opt/launcher/gamedock" "/opt/launcher/gamedock.old""#));
        assert!(script.contains("sleep 10"));
        assert!(script.contains("gamedock.rollback"));
        // Rollback restores the backup over the live path.
        assert!(script.contains(r#"mv -f "/opt/launcher/gamedock.old" "/opt/launcher/gamedock""#));
    }
}
