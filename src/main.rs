// src/main.rs

use anyhow::{bail, Context, Result};
use gamedock::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| "list".into());

    let mut config = EngineConfig::default();
    if let Ok(url) = std::env::var("GAMEDOCK_MANIFEST_URL") {
        config.manifest_url = url;
    }
    if let Ok(url) = std::env::var("GAMEDOCK_UPDATE_URL") {
        config.update_url = url;
    }
    tokio::fs::create_dir_all(&config.install_dir).await?;
    tokio::fs::create_dir_all(&config.staging_dir).await?;

    let state = StateStore::new(&config.state_db_path())
        .await
        .context("opening state database")?;
    let transport = TransportClient::new(config.verify_tls, config.request_timeout);
    let manifest = ManifestService::new(transport.clone(), &config);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let scheduler = Arc::new(
        DownloadScheduler::new(&config, state.clone(), transport.clone(), events_tx.clone())
            .await?,
    );
    let scheduler_loop = scheduler.clone();
    let scheduler_handle = tokio::spawn(async move { scheduler_loop.run().await });

    let event_printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                EngineEvent::TaskProgress {
                    task_id,
                    bytes,
                    total,
                } => {
                    if total > 0 {
                        println!(
                            "[task {task_id}] {bytes}/{total} bytes ({:.1}%)",
                            bytes as f64 / total as f64 * 100.0
                        );
                    } else {
                        println!("[task {task_id}] {bytes} bytes");
                    }
                }
                EngineEvent::TaskSucceeded { task_id, record } => {
                    println!(
                        "[task {task_id}] installed {} {} at {}",
                        record.game_name,
                        record.version,
                        record.install_root.display()
                    );
                }
                EngineEvent::TaskFailed {
                    task_id,
                    kind,
                    detail,
                } => {
                    println!("[task {task_id}] failed ({kind:?}): {detail}");
                }
                EngineEvent::TaskCancelled { task_id } => {
                    println!("[task {task_id}] cancelled");
                }
                EngineEvent::UpdateStateChanged(state) => {
                    println!("[updater] {state:?}");
                }
            }
        }
    });

    let updater = UpdateOrchestrator::new(
        transport,
        scheduler.clone(),
        state,
        events_tx,
        CURRENT_VERSION.to_string(),
        config.update_url.clone(),
        config.swap_grace_secs,
    );
    if let Some(outcome) = updater.finalize_startup().await? {
        println!("previous update attempt: {outcome:?}");
    }

    match command.as_str() {
        "list" => {
            let snapshot = manifest.refresh().await.context("loading manifest")?;
            if snapshot.stale {
                println!("(offline: showing cached manifest)");
            }
            for entry in &snapshot.entries {
                let installed = entry
                    .installed_version
                    .as_deref()
                    .unwrap_or("not installed");
                println!("{:<24} {:>10}  (local: {installed})", entry.name, entry.version);
            }
        }
        "install" => {
            let name = match args.next() {
                Some(name) => name,
                None => bail!("usage: gamedock install <game-name>"),
            };
            let snapshot = manifest.refresh().await.context("loading manifest")?;
            let entry = snapshot
                .entries
                .into_iter()
                .find(|e| e.name == name)
                .with_context(|| format!("no manifest entry named {name:?}"))?;
            if !entry.wants_install() {
                println!("{name} is already up to date");
            } else {
                let task_id = scheduler.submit(entry, TaskKind::GameArchive).await?;
                wait_for_task(&scheduler, task_id).await?;
            }
        }
        "update" => match updater.check(true).await? {
            CheckOutcome::Skipped | CheckOutcome::UpToDate => {
                println!("launcher is up to date ({CURRENT_VERSION})");
            }
            CheckOutcome::UpdateAvailable(info) => {
                println!("updating launcher to {}", info.version);
                let staged = updater.download_and_stage(&info).await?;
                updater.spawn_swap_helper(&staged)?;
                println!("restarting to apply the update");
                return Ok(());
            }
        },
        other => bail!("unknown command {other:?} (expected list, install or update)"),
    }

    scheduler_handle.abort();
    let _ = scheduler_handle.await;
    drop(scheduler);
    drop(updater);
    let _ = event_printer.await;
    Ok(())
}

async fn wait_for_task(scheduler: &DownloadScheduler, task_id: u64) -> Result<()> {
    loop {
        match scheduler.task_status(task_id).await {
            Some(status) if status.is_terminal() => {
                if let TaskStatus::Failed { detail, .. } = status {
                    bail!("install failed: {detail}");
                }
                return Ok(());
            }
            Some(_) => tokio::time::sleep(Duration::from_millis(500)).await,
            None => bail!("task disappeared from scheduler"),
        }
    }
}
