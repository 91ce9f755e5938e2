// src/worker.rs

use crate::integrity::{self, IntegrityError, StreamingDigest};
use crate::models::{DownloadTask, EngineEvent, FailureKind, TaskStatus};
use crate::transport::{TransportClient, TransportError};
use futures_util::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("network error: {0}")]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("download incomplete: received {received} of {total} bytes")]
    Incomplete { received: u64, total: u64 },
    #[error("download cancelled")]
    Cancelled,
}

impl WorkerError {
    /// Failure classification for events and retry decisions.
    /// `None` for cancellation, which is terminal but not a failure.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            WorkerError::Transport(TransportError::HttpStatus { status }) => {
                Some(FailureKind::HttpStatus(*status))
            }
            // A certificate failure is surfaced with its own detail text but
            // shares the bounded-retry budget of other network failures.
            WorkerError::Transport(_) => Some(FailureKind::TransientNetwork),
            WorkerError::Incomplete { .. } => Some(FailureKind::TransientNetwork),
            WorkerError::Io(_) => Some(FailureKind::Filesystem),
            WorkerError::Integrity(_) => Some(FailureKind::Integrity),
            WorkerError::Cancelled => None,
        }
    }
}

/// Run one transfer to completion: open the transport at the resume offset,
/// stream into the staging file while hashing, then verify the whole file.
///
/// Progress events are emitted on every buffer flush in non-decreasing byte
/// order; the terminal event is the scheduler's responsibility.
pub(crate) async fn run(
    transport: &TransportClient,
    task: Arc<Mutex<DownloadTask>>,
    events: &mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
) -> Result<(), WorkerError> {
    let (task_id, url, staging_path, expected_size, expected_checksum) = {
        let task = task.lock().await;
        (
            task.id,
            task.entry.download_url.clone(),
            task.staging_path.clone(),
            task.expected_size,
            task.expected_checksum.clone(),
        )
    };

    if let Some(parent) = staging_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Resume from whatever a previous attempt left in staging.
    let offset = match tokio::fs::metadata(&staging_path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    let transfer = transport.open(&url, offset).await?;
    let resumed = transfer.resumed_from > 0;
    if offset > 0 && !resumed {
        debug!(task_id, "server ignored range request, restarting from zero");
    }

    let total = if expected_size > 0 {
        expected_size
    } else {
        transfer.total_size.unwrap_or(0)
    };

    let mut file = if resumed {
        OpenOptions::new().append(true).open(&staging_path).await?
    } else {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&staging_path)
            .await?
    };

    // Digest accumulated inline covers fresh downloads only; resumed files
    // are re-hashed from offset zero after the stream ends.
    let mut digest = StreamingDigest::new();
    let mut bytes = transfer.resumed_from;
    let mut stream = transfer.response.bytes_stream();

    // Reported progress never regresses, even when a later attempt had to
    // restart from byte zero.
    let mut reported = {
        let task = task.lock().await;
        task.bytes_transferred.max(bytes)
    };

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            chunk = stream.next() => match chunk {
                Some(chunk) => chunk.map_err(TransportError::from_reqwest)?,
                None => break,
            },
        };

        file.write_all(&chunk).await?;
        if !resumed {
            digest.update(&chunk);
        }
        bytes += chunk.len() as u64;
        reported = reported.max(bytes);

        {
            let mut task = task.lock().await;
            task.bytes_transferred = bytes;
        }
        let _ = events.send(EngineEvent::TaskProgress {
            task_id,
            bytes: reported,
            total,
        });
    }

    file.flush().await?;
    drop(file);

    if total > 0 && bytes < total {
        return Err(WorkerError::Incomplete {
            received: bytes,
            total,
        });
    }

    {
        let mut task = task.lock().await;
        task.status = TaskStatus::Verifying;
    }

    let actual = if resumed {
        integrity::md5_file(&staging_path).await?
    } else {
        digest.finish()
    };
    integrity::verify(&expected_checksum, &actual)?;

    debug!(task_id, bytes, "transfer verified");
    Ok(())
}
