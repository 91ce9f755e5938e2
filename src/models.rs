// src/models.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One entry of the remote `games.json` manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameManifestEntry {
    pub name: String,
    /// Latest version available on the server.
    pub version: String,
    /// Version currently installed locally, derived from the install dir scan.
    #[serde(default)]
    pub installed_version: Option<String>,
    pub download_url: String,
    /// Expected archive size in bytes.
    pub size: u64,
    /// Expected MD5 digest of the archive, lower-case hex.
    pub checksum: String,
    /// Executable location relative to the versioned install root.
    pub executable_path: PathBuf,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requirements: Requirements,
}

impl GameManifestEntry {
    /// True when no version is installed or the remote version is newer.
    pub fn wants_install(&self) -> bool {
        match &self.installed_version {
            None => true,
            Some(local) => crate::version::is_newer(&self.version, local),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Requirements {
    #[serde(default)]
    pub ram_gb: Option<u32>,
    #[serde(default)]
    pub storage_gb: Option<u32>,
}

/// What the verified artifact is for; decides the success path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskKind {
    /// A game archive, handed to the archive installer on success.
    GameArchive,
    /// The launcher's own package; the verified file stays staged for the swap.
    LauncherPackage,
}

/// Classification of a terminal task failure, carried on `TaskFailed` events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    /// Retryable network-level failure (DNS, TCP, timeout, dropped stream).
    TransientNetwork,
    /// Checksum mismatch; never retried with the same bytes.
    Integrity,
    /// Corrupt or unsupported archive.
    Format,
    /// Permission, disk-full, rename failure.
    Filesystem,
    /// Non-2xx/206 HTTP response.
    HttpStatus(u16),
}

/// Per-task state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskStatus {
    Pending,
    Active,
    /// Interrupted by a transient failure; eligible for re-admission.
    Resumable,
    Verifying,
    Succeeded,
    Failed { kind: FailureKind, detail: String },
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }
}

/// The persistent state of a single download task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: u64,
    pub entry: GameManifestEntry,
    pub kind: TaskKind,
    /// Where bytes are written before verification and promotion.
    pub staging_path: PathBuf,
    pub expected_size: u64,
    pub expected_checksum: String,
    pub bytes_transferred: u64,
    pub status: TaskStatus,
    /// Attempts so far, including the first.
    pub attempts: u32,
}

impl DownloadTask {
    pub fn new(id: u64, entry: GameManifestEntry, kind: TaskKind, staging_dir: &Path) -> Self {
        let staging_path = staging_dir.join(format!("{}_{}.part", entry.name, entry.version));
        let expected_size = entry.size;
        let expected_checksum = entry.checksum.to_ascii_lowercase();
        Self {
            id,
            entry,
            kind,
            staging_path,
            expected_size,
            expected_checksum,
            bytes_transferred: 0,
            status: TaskStatus::Pending,
            attempts: 0,
        }
    }
}

/// Record of a completed install. Created only after successful extraction
/// and validation; superseded, never mutated, when a new version lands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallRecord {
    pub game_name: String,
    pub version: String,
    pub install_root: PathBuf,
    pub executable_path: PathBuf,
}

/// Update orchestrator state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateState {
    CheckPending,
    Comparing,
    UpToDate,
    UpdateAvailable { version: String },
    Downloading,
    Verifying,
    Staged,
    Swapping,
    Completed,
    RolledBack { reason: String },
}

/// Persisted marker gating the daily background update check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateCheckState {
    /// Unix seconds of the last definitive check attempt.
    pub last_check: u64,
    pub last_remote_version: Option<String>,
}

/// Events delivered to the collaborator (UI/controller) over the engine channel.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TaskProgress {
        task_id: u64,
        bytes: u64,
        total: u64,
    },
    TaskSucceeded {
        task_id: u64,
        record: InstallRecord,
    },
    TaskFailed {
        task_id: u64,
        kind: FailureKind,
        detail: String,
    },
    TaskCancelled {
        task_id: u64,
    },
    UpdateStateChanged(UpdateState),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, version: &str) -> GameManifestEntry {
        GameManifestEntry {
            name: name.into(),
            version: version.into(),
            installed_version: None,
            download_url: format!("http://example.com/{name}.zip"),
            size: 1000,
            checksum: "ABC123".into(),
            executable_path: PathBuf::from("game.exe"),
            description: String::new(),
            requirements: Requirements::default(),
        }
    }

    #[test]
    fn task_lowercases_expected_checksum() {
        let task = DownloadTask::new(
            1,
            entry("Foo", "1.0.0"),
            TaskKind::GameArchive,
            Path::new("/tmp"),
        );
        assert_eq!(task.expected_checksum, "abc123");
        assert_eq!(task.staging_path, Path::new("/tmp/Foo_1.0.0.part"));
    }

    #[test]
    fn wants_install_follows_version_ordering() {
        let mut e = entry("Foo", "1.4.0");
        assert!(e.wants_install());
        e.installed_version = Some("1.3.9".into());
        assert!(e.wants_install());
        e.installed_version = Some("1.4.0".into());
        assert!(!e.wants_install());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Failed {
            kind: FailureKind::Integrity,
            detail: String::new()
        }
        .is_terminal());
        assert!(!TaskStatus::Resumable.is_terminal());
        assert!(!TaskStatus::Active.is_terminal());
    }
}
