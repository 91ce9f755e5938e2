// src/state.rs

use crate::models::{DownloadTask, TaskStatus, UpdateCheckState};
use rusqlite::params;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

const UPDATE_MARKER_KEY: &str = "update_check";

/// Persists download tasks and the update-check marker to SQLite, so
/// interrupted transfers survive a restart.
#[derive(Clone)]
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open (and if needed create) the state database.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS tasks (
                        id              INTEGER PRIMARY KEY,
                        task_data       TEXT NOT NULL
                    )",
                    [],
                )?;
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS meta (
                        key             TEXT PRIMARY KEY,
                        value           TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Save (insert or update) a task.
    pub async fn save_task(&self, task: &DownloadTask) -> Result<(), StateError> {
        let task_data = serde_json::to_string(task)?;
        let task_id = task.id;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO tasks (id, task_data) VALUES (?1, ?2)",
                    params![task_id, task_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Load all persisted tasks. Tasks that were in flight when the
    /// previous process stopped are demoted to `Resumable` so the
    /// scheduler can re-admit them.
    pub async fn load_all_tasks(&self) -> Result<Vec<DownloadTask>, StateError> {
        let mut tasks = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT task_data FROM tasks ORDER BY id")?;
                let task_iter = stmt.query_map([], |row| {
                    let task_data: String = row.get(0)?;
                    let task: DownloadTask = serde_json::from_str(&task_data).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            0,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?;
                    Ok(task)
                })?;

                let tasks = task_iter.collect::<Result<Vec<DownloadTask>, rusqlite::Error>>()?;
                Ok(tasks)
            })
            .await?;

        for task in &mut tasks {
            if matches!(task.status, TaskStatus::Active | TaskStatus::Verifying) {
                task.status = TaskStatus::Resumable;
            }
        }
        Ok(tasks)
    }

    /// Delete a task by its ID.
    pub async fn delete_task(&self, task_id: u64) -> Result<(), StateError> {
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Read the daily update-check marker, if one was ever written.
    pub async fn read_update_marker(&self) -> Result<Option<UpdateCheckState>, StateError> {
        let value: Option<String> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT value FROM meta WHERE key = ?1")?;
                let mut rows = stmt.query_map(params![UPDATE_MARKER_KEY], |row| row.get(0))?;
                match rows.next() {
                    Some(row) => Ok(Some(row?)),
                    None => Ok(None),
                }
            })
            .await?;

        match value {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Write the update-check marker. Callers must only do this after a
    /// definitive check attempt, never on a transient network failure.
    pub async fn write_update_marker(&self, marker: &UpdateCheckState) -> Result<(), StateError> {
        let value = serde_json::to_string(marker)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                    params![UPDATE_MARKER_KEY, value],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
