// src/scheduler.rs

use crate::config::EngineConfig;
use crate::installer;
use crate::models::{
    DownloadTask, EngineEvent, FailureKind, GameManifestEntry, InstallRecord, TaskKind, TaskStatus,
};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::state::{StateError, StateStore};
use crate::transport::TransportClient;
use crate::worker::{self, WorkerError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    State(#[from] StateError),
    #[error("task with ID {0} not found")]
    TaskNotFound(u64),
    #[error("entry {0} already has a download in flight")]
    DuplicateTask(String),
}

/// The central component owning the state and lifecycle of all download
/// tasks. At most `max_concurrent` tasks are active at once; admission is
/// first-submitted-first-served among pending tasks whenever a slot frees.
pub struct DownloadScheduler {
    state: StateStore,
    transport: TransportClient,
    tasks: Arc<Mutex<HashMap<u64, Arc<Mutex<DownloadTask>>>>>,
    active_workers: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    cancellation_tokens: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    retry: RetryPolicy,
    max_concurrent: usize,
    staging_dir: PathBuf,
    install_dir: PathBuf,
    next_task_id: AtomicU64,
}

impl DownloadScheduler {
    pub async fn new(
        config: &EngineConfig,
        state: StateStore,
        transport: TransportClient,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Self, SchedulerError> {
        let tasks_map = Arc::new(Mutex::new(HashMap::new()));
        // In-flight tasks from a previous run arrive already demoted to
        // Resumable; they are re-admitted on re-submission.
        let loaded_tasks = state.load_all_tasks().await?;
        let mut max_id = 0;

        {
            let mut tasks_lock = tasks_map.lock().await;
            for task in loaded_tasks {
                if task.id > max_id {
                    max_id = task.id;
                }
                tasks_lock.insert(task.id, Arc::new(Mutex::new(task)));
            }
        }

        Ok(Self {
            state,
            transport,
            tasks: tasks_map,
            active_workers: Arc::new(Mutex::new(HashMap::new())),
            cancellation_tokens: Arc::new(Mutex::new(HashMap::new())),
            events,
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                ..Default::default()
            },
            max_concurrent: config.max_concurrent_downloads,
            staging_dir: config.staging_dir.clone(),
            install_dir: config.install_dir.clone(),
            next_task_id: AtomicU64::new(max_id + 1),
        })
    }

    /// Submit a download for a manifest entry. A second submission while the
    /// entry has a non-terminal task is rejected. A `Resumable` task for the
    /// same entry, version and checksum is re-admitted instead of duplicated;
    /// a resumable task for an older version is superseded so stale bytes are
    /// never resumed under a new submission.
    pub async fn submit(
        &self,
        entry: GameManifestEntry,
        kind: TaskKind,
    ) -> Result<u64, SchedulerError> {
        let mut superseded = None;
        {
            let tasks = self.tasks.lock().await;
            for task_arc in tasks.values() {
                let mut task = task_arc.lock().await;
                if task.entry.name == entry.name && !task.status.is_terminal() {
                    if task.status == TaskStatus::Resumable {
                        if task.entry.version == entry.version
                            && task.expected_checksum == entry.checksum.to_ascii_lowercase()
                        {
                            task.status = TaskStatus::Pending;
                            self.state.save_task(&task).await?;
                            info!(task_id = task.id, game = %entry.name, "re-admitted resumable task");
                            return Ok(task.id);
                        }
                        superseded = Some(task_arc.clone());
                        break;
                    }
                    return Err(SchedulerError::DuplicateTask(entry.name));
                }
            }
        }

        if let Some(task_arc) = superseded {
            let mut task = task_arc.lock().await;
            task.status = TaskStatus::Cancelled;
            let _ = tokio::fs::remove_file(&task.staging_path).await;
            self.state.delete_task(task.id).await?;
            let _ = self.events.send(EngineEvent::TaskCancelled { task_id: task.id });
            info!(task_id = task.id, game = %entry.name, "superseded stale resumable task");
        }

        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let task = DownloadTask::new(task_id, entry, kind, &self.staging_dir);
        self.state.save_task(&task).await?;
        info!(task_id, game = %task.entry.name, "task queued");
        self.tasks
            .lock()
            .await
            .insert(task_id, Arc::new(Mutex::new(task)));
        Ok(task_id)
    }

    /// Admission loop: fills free slots with pending tasks in submission
    /// order. Runs until the owning runtime drops it.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.prune_completed_workers().await;

            let mut startable_tasks = Vec::new();
            {
                let tasks_lock = self.tasks.lock().await;
                let workers_lock = self.active_workers.lock().await;
                let available_slots = self.max_concurrent.saturating_sub(workers_lock.len());

                if available_slots > 0 {
                    let mut pending_candidates = Vec::new();
                    for (id, task_arc) in tasks_lock.iter() {
                        if workers_lock.contains_key(id) {
                            continue;
                        }
                        if let Ok(task) = task_arc.try_lock() {
                            if task.status == TaskStatus::Pending {
                                pending_candidates.push(*id);
                            }
                        }
                    }

                    // Task ids are monotonic, so submission order is id order.
                    pending_candidates.sort_unstable();

                    for task_id in pending_candidates.into_iter().take(available_slots) {
                        if let Some(task_arc) = tasks_lock.get(&task_id) {
                            startable_tasks.push(task_arc.clone());
                        }
                    }
                }
            }

            for task_arc in startable_tasks {
                self.spawn_worker(task_arc).await;
            }

            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn spawn_worker(self: &Arc<Self>, task_arc: Arc<Mutex<DownloadTask>>) {
        let cancellation_token = CancellationToken::new();
        let task_id = {
            let mut task = task_arc.lock().await;
            task.status = TaskStatus::Active;
            task.attempts += 1;
            if let Err(err) = self.state.save_task(&task).await {
                warn!(task_id = task.id, "failed to persist activation: {err}");
            }
            task.id
        };

        self.cancellation_tokens
            .lock()
            .await
            .insert(task_id, cancellation_token.clone());

        let this = self.clone();

        let handle = tokio::spawn(async move {
            debug!(task_id, "worker starting");

            // Periodic saver keeps resume state fresh while the transfer runs.
            let saver_handle = {
                let task_clone = task_arc.clone();
                let store = this.state.clone();
                let saver_token = cancellation_token.clone();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                            _ = saver_token.cancelled() => break,
                        }
                        let task = task_clone.lock().await;
                        if task.status == TaskStatus::Active {
                            if let Err(err) = store.save_task(&task).await {
                                warn!(task_id = task.id, "periodic save failed: {err}");
                            }
                        } else {
                            break;
                        }
                    }
                })
            };

            let result = worker::run(
                &this.transport,
                task_arc.clone(),
                &this.events,
                cancellation_token.clone(),
            )
            .await;

            cancellation_token.cancel();
            let _ = saver_handle.await;

            this.finish_task(task_arc, result).await;
        });

        self.active_workers.lock().await.insert(task_id, handle);
    }

    /// Resolve a finished worker: success hands the artifact to the
    /// installer, transient failures go back through the retry policy,
    /// everything else is terminal. Emits the terminal event exactly once.
    async fn finish_task(self: &Arc<Self>, task_arc: Arc<Mutex<DownloadTask>>, result: Result<(), WorkerError>) {
        match result {
            Ok(()) => self.complete_success(task_arc).await,
            Err(WorkerError::Cancelled) => {
                let mut task = task_arc.lock().await;
                task.status = TaskStatus::Cancelled;
                // No partial files survive cancellation, and terminal tasks
                // have nothing left worth persisting across a restart.
                let _ = tokio::fs::remove_file(&task.staging_path).await;
                if let Err(err) = self.state.delete_task(task.id).await {
                    warn!(task_id = task.id, "failed to prune cancelled task: {err}");
                }
                let _ = self.events.send(EngineEvent::TaskCancelled { task_id: task.id });
                info!(task_id = task.id, "task cancelled");
            }
            Err(err) => {
                let kind = err
                    .failure_kind()
                    .unwrap_or(FailureKind::TransientNetwork);
                let (task_id, attempts) = {
                    let task = task_arc.lock().await;
                    (task.id, task.attempts)
                };

                match self.retry.decide(attempts, kind) {
                    RetryDecision::RetryAfter(delay) => {
                        {
                            let mut task = task_arc.lock().await;
                            task.status = TaskStatus::Resumable;
                            if let Err(err) = self.state.save_task(&task).await {
                                warn!(task_id, "failed to persist resumable state: {err}");
                            }
                        }
                        warn!(task_id, attempts, "transient failure ({err}), retrying in {delay:?}");

                        let this = self.clone();
                        let task_clone = task_arc.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let mut task = task_clone.lock().await;
                            // A cancellation during backoff wins.
                            if task.status == TaskStatus::Resumable {
                                task.status = TaskStatus::Pending;
                                if let Err(err) = this.state.save_task(&task).await {
                                    warn!(task_id, "failed to persist retry: {err}");
                                }
                            }
                        });
                    }
                    RetryDecision::NoRetry => {
                        let detail = err.to_string();
                        self.fail_task(&task_arc, kind, detail).await;
                    }
                }
            }
        }
    }

    async fn complete_success(self: &Arc<Self>, task_arc: Arc<Mutex<DownloadTask>>) {
        let (task_id, kind, entry, staging_path) = {
            let task = task_arc.lock().await;
            (
                task.id,
                task.kind,
                task.entry.clone(),
                task.staging_path.clone(),
            )
        };

        let outcome = match kind {
            TaskKind::GameArchive => {
                installer::install_archive(&staging_path, &entry, &self.install_dir)
                    .await
                    .map_err(|err| (err.failure_kind(), err.to_string()))
            }
            // The launcher package stays where it is; the update
            // orchestrator owns the staged binary from here.
            TaskKind::LauncherPackage => Ok(InstallRecord {
                game_name: entry.name.clone(),
                version: entry.version.clone(),
                install_root: staging_path
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_default(),
                executable_path: staging_path
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_default(),
            }),
        };

        match outcome {
            Ok(record) => {
                {
                    let mut task = task_arc.lock().await;
                    task.status = TaskStatus::Succeeded;
                    if let Err(err) = self.state.delete_task(task.id).await {
                        warn!(task_id, "failed to prune completed task: {err}");
                    }
                }
                let _ = self.events.send(EngineEvent::TaskSucceeded { task_id, record });
                info!(task_id, game = %entry.name, "task succeeded");
            }
            Err((kind, detail)) => self.fail_task(&task_arc, kind, detail).await,
        }
    }

    async fn fail_task(&self, task_arc: &Arc<Mutex<DownloadTask>>, kind: FailureKind, detail: String) {
        let task_id = {
            let mut task = task_arc.lock().await;
            task.status = TaskStatus::Failed {
                kind,
                detail: detail.clone(),
            };
            // Terminal failures discard staged bytes.
            let _ = tokio::fs::remove_file(&task.staging_path).await;
            if let Err(err) = self.state.delete_task(task.id).await {
                warn!(task_id = task.id, "failed to prune failed task: {err}");
            }
            task.id
        };
        let _ = self.events.send(EngineEvent::TaskFailed {
            task_id,
            kind,
            detail,
        });
        error!(task_id, ?kind, "task failed terminally");
    }

    async fn prune_completed_workers(&self) {
        let mut finished_ids = Vec::new();
        {
            let workers = self.active_workers.lock().await;
            for (id, handle) in workers.iter() {
                if handle.is_finished() {
                    finished_ids.push(*id);
                }
            }
        }

        if !finished_ids.is_empty() {
            let mut workers = self.active_workers.lock().await;
            let mut tokens = self.cancellation_tokens.lock().await;
            for id in finished_ids {
                debug!(task_id = id, "pruning completed worker");
                workers.remove(&id);
                tokens.remove(&id);
            }
        }
    }

    /// Cancel a pending or active task. Active transfers close their stream
    /// promptly; partial staging data is discarded either way. No automatic
    /// retry follows a cancellation.
    pub async fn cancel(&self, task_id: u64) -> Result<(), SchedulerError> {
        if let Some(token) = self.cancellation_tokens.lock().await.get(&task_id) {
            info!(task_id, "cancelling active task");
            token.cancel();
            return Ok(());
        }

        let tasks = self.tasks.lock().await;
        let task_arc = tasks
            .get(&task_id)
            .ok_or(SchedulerError::TaskNotFound(task_id))?;
        let mut task = task_arc.lock().await;
        match task.status {
            TaskStatus::Pending | TaskStatus::Resumable => {
                task.status = TaskStatus::Cancelled;
                let _ = tokio::fs::remove_file(&task.staging_path).await;
                self.state.delete_task(task.id).await?;
                let _ = self.events.send(EngineEvent::TaskCancelled { task_id });
                info!(task_id, "pending task cancelled");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub async fn task_status(&self, task_id: u64) -> Option<TaskStatus> {
        let tasks = self.tasks.lock().await;
        let task_arc = tasks.get(&task_id)?;
        let task = task_arc.lock().await;
        Some(task.status.clone())
    }

    /// Snapshot of every known task.
    pub async fn all_tasks(&self) -> Vec<DownloadTask> {
        let tasks_lock = self.tasks.lock().await;
        let mut result = Vec::with_capacity(tasks_lock.len());
        for task_arc in tasks_lock.values() {
            result.push(task_arc.lock().await.clone());
        }
        result.sort_unstable_by_key(|t| t.id);
        result
    }

    pub async fn active_count(&self) -> usize {
        self.active_workers.lock().await.len()
    }
}
