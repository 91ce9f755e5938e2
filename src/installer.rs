// src/installer.rs

use crate::models::{FailureKind, GameManifestEntry, InstallRecord};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("archive extraction failed: {0}")]
    Extraction(String),
    #[error("declared executable {0} missing after extraction")]
    MissingExecutable(PathBuf),
    #[error("failed to promote staging directory: {0}")]
    Promotion(#[source] std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstallError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            InstallError::Extraction(_) | InstallError::MissingExecutable(_) => FailureKind::Format,
            InstallError::Promotion(_) | InstallError::Io(_) => FailureKind::Filesystem,
        }
    }
}

/// Install a verified archive into `install_dir/game_name/version/`.
///
/// The archive is extracted into a fresh staging directory, the declared
/// executable is checked, and only then is staging atomically promoted.
/// A previous install of the same version is replaced only after the new
/// staging directory is fully validated; any failure leaves it untouched.
/// Consumes the archive file on success.
pub async fn install_archive(
    archive_path: &Path,
    entry: &GameManifestEntry,
    install_dir: &Path,
) -> Result<InstallRecord, InstallError> {
    let game_dir = install_dir.join(&entry.name);
    let target = game_dir.join(&entry.version);
    let staging = game_dir.join(format!(".staging-{}-{}", entry.version, nonce()));

    fs::create_dir_all(&staging).await?;

    let result = extract_and_promote(archive_path, entry, &staging, &target).await;
    if result.is_err() {
        // Never leave a half-extracted staging directory behind.
        let _ = fs::remove_dir_all(&staging).await;
        return result;
    }

    let _ = fs::remove_file(archive_path).await;
    info!(
        game = %entry.name,
        version = %entry.version,
        "installed to {}",
        target.display()
    );

    Ok(InstallRecord {
        game_name: entry.name.clone(),
        version: entry.version.clone(),
        install_root: target,
        executable_path: entry.executable_path.clone(),
    })
}

async fn extract_and_promote(
    archive_path: &Path,
    entry: &GameManifestEntry,
    staging: &Path,
    target: &Path,
) -> Result<InstallRecord, InstallError> {
    let archive = archive_path.to_path_buf();
    let dest = staging.to_path_buf();
    tokio::task::spawn_blocking(move || extract_zip(&archive, &dest))
        .await
        .map_err(|e| InstallError::Extraction(format!("extraction task failed: {e}")))??;

    let executable = staging.join(&entry.executable_path);
    match fs::metadata(&executable).await {
        Ok(meta) if meta.is_file() => {}
        _ => return Err(InstallError::MissingExecutable(entry.executable_path.clone())),
    }

    promote(staging, target, &entry.version).await?;

    Ok(InstallRecord {
        game_name: entry.name.clone(),
        version: entry.version.clone(),
        install_root: target.to_path_buf(),
        executable_path: entry.executable_path.clone(),
    })
}

/// Atomically swing the validated staging directory into place. If the
/// target version already exists (reinstall), it is moved aside first and
/// restored should the final rename fail.
async fn promote(staging: &Path, target: &Path, version: &str) -> Result<(), InstallError> {
    if fs::metadata(target).await.is_ok() {
        let displaced = target.with_file_name(format!(".previous-{}-{}", version, nonce()));
        fs::rename(target, &displaced)
            .await
            .map_err(InstallError::Promotion)?;
        match fs::rename(staging, target).await {
            Ok(()) => {
                let _ = fs::remove_dir_all(&displaced).await;
                Ok(())
            }
            Err(err) => {
                // Put the old version back before reporting failure.
                let _ = fs::rename(&displaced, target).await;
                Err(InstallError::Promotion(err))
            }
        }
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(staging, target)
            .await
            .map_err(InstallError::Promotion)
    }
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), InstallError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| InstallError::Extraction(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| InstallError::Extraction(e.to_string()))?;
        // enclosed_name rejects paths that escape the destination.
        let rel = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => continue,
        };
        let out_path = dest.join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out_file)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))?;
        }
    }

    debug!("extracted {} into {}", archive_path.display(), dest.display());
    Ok(())
}

fn nonce() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Requirements;
    use std::io::Write;

    fn entry(name: &str, version: &str, executable: &str) -> GameManifestEntry {
        GameManifestEntry {
            name: name.into(),
            version: version.into(),
            installed_version: None,
            download_url: String::new(),
            size: 0,
            checksum: String::new(),
            executable_path: PathBuf::from(executable),
            description: String::new(),
            requirements: Requirements::default(),
        }
    }

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (name, contents) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn installs_archive_and_consumes_it() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("foo.zip");
        write_zip(
            &archive,
            &[("foo.exe", b"binary".as_ref()), ("data/level1.dat", b"level")],
        );

        let entry = entry("Foo", "1.0.0", "foo.exe");
        let record = install_archive(&archive, &entry, dir.path()).await.unwrap();

        let root = dir.path().join("Foo").join("1.0.0");
        assert_eq!(record.install_root, root);
        assert!(root.join("foo.exe").is_file());
        assert!(root.join("data/level1.dat").is_file());
        assert!(!archive.exists(), "archive consumed after install");
    }

    #[tokio::test]
    async fn missing_executable_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("foo.zip");
        write_zip(&archive, &[("readme.txt", b"hi".as_ref())]);

        let entry = entry("Foo", "1.0.0", "foo.exe");
        let err = install_archive(&archive, &entry, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::MissingExecutable(_)));
        assert_eq!(err.failure_kind(), FailureKind::Format);

        assert!(!dir.path().join("Foo").join("1.0.0").exists());
        // No staging debris either.
        let leftover: Vec<_> = std::fs::read_dir(dir.path().join("Foo"))
            .unwrap()
            .collect();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn corrupt_archive_leaves_previous_install_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry("Foo", "1.0.0", "foo.exe");

        let archive = dir.path().join("good.zip");
        write_zip(&archive, &[("foo.exe", b"v1".as_ref())]);
        install_archive(&archive, &entry, dir.path()).await.unwrap();

        let bad = dir.path().join("bad.zip");
        std::fs::write(&bad, b"this is not a zip file").unwrap();
        let err = install_archive(&bad, &entry, dir.path()).await.unwrap_err();
        assert!(matches!(err, InstallError::Extraction(_)));

        let exe = dir.path().join("Foo").join("1.0.0").join("foo.exe");
        assert_eq!(std::fs::read(exe).unwrap(), b"v1");
    }

    #[tokio::test]
    async fn reinstall_replaces_only_after_validation() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry("Foo", "1.0.0", "foo.exe");

        let first = dir.path().join("first.zip");
        write_zip(&first, &[("foo.exe", b"old".as_ref())]);
        install_archive(&first, &entry, dir.path()).await.unwrap();

        let second = dir.path().join("second.zip");
        write_zip(
            &second,
            &[("foo.exe", b"new".as_ref()), ("extra.dat", b"x".as_ref())],
        );
        install_archive(&second, &entry, dir.path()).await.unwrap();

        let root = dir.path().join("Foo").join("1.0.0");
        assert_eq!(std::fs::read(root.join("foo.exe")).unwrap(), b"new");
        assert!(root.join("extra.dat").is_file());
    }
}
