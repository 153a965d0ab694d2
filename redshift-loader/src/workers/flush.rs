use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tracing::{Instrument, debug, error};

use crate::batch::{BatchId, FlushBatch, RejectedRecord};
use crate::error::{ErrorKind, LoaderError};
use crate::loader_error;
use crate::merger::BatchLoader;
use crate::naming::TableName;
use crate::staging::StagingClient;
use crate::warehouse::Warehouse;

/// Work queued for the flush worker of one stream. Tasks run in the order they were queued.
#[derive(Debug)]
pub enum FlushTask {
    /// Evolve, stage and merge a sealed batch.
    Merge(FlushBatch),
    /// Write records refused by coercion to dead-letter storage.
    Reject {
        id: BatchId,
        chunk: u64,
        records: Vec<RejectedRecord>,
    },
    /// Swap a shadow table in once every earlier batch of the stream is merged.
    Activate {
        id: BatchId,
        table: TableName,
        shadow: TableName,
    },
}

/// Outcome of a [`FlushTask`], reported back to the engine.
#[derive(Debug)]
pub enum FlushEvent {
    Completed {
        stream: String,
        batch_id: BatchId,
        rows_loaded: u64,
    },
    RejectsWritten {
        stream: String,
        batch_id: BatchId,
        count: usize,
    },
    Activated {
        stream: String,
        batch_id: BatchId,
        table: TableName,
        swapped: bool,
    },
    /// The task failed. The worker stops after the first failure and abandons the tasks
    /// queued behind it, reporting each of them as failed too.
    Failed {
        stream: String,
        batch_id: BatchId,
        error: LoaderError,
    },
}

impl FlushTask {
    pub fn batch_id(&self) -> BatchId {
        match self {
            FlushTask::Merge(batch) => batch.id,
            FlushTask::Reject { id, .. } | FlushTask::Activate { id, .. } => *id,
        }
    }
}

/// Runs the tasks of one stream until its queue closes or a task fails.
///
/// Each task runs on its own spawned task while holding a pool permit, so a panic surfaces
/// as [`ErrorKind::FlushWorkerPanic`] instead of tearing the worker down silently. After a
/// failure the queue is closed and every batch still queued goes to dead-letter storage.
pub(super) async fn run_flush_worker<W, S>(
    stream: String,
    loader: Arc<BatchLoader<W, S>>,
    permits: Arc<Semaphore>,
    mut tasks: mpsc::Receiver<FlushTask>,
    events: mpsc::UnboundedSender<FlushEvent>,
) where
    W: Warehouse,
    S: StagingClient,
{
    while let Some(task) = tasks.recv().await {
        let batch_id = task.batch_id();

        let Ok(permit) = permits.clone().acquire_owned().await else {
            debug!(%stream, "flush worker permits closed, stopping");
            return;
        };

        let handle = {
            let stream = stream.clone();
            let loader = loader.clone();
            tokio::spawn(
                async move {
                    let event = execute(&stream, &loader, task).await;
                    drop(permit);
                    event
                }
                .in_current_span(),
            )
        };

        let event = match handle.await {
            Ok(event) => event,
            Err(join_err) => {
                error!(%stream, error = %join_err, "flush task panicked");
                FlushEvent::Failed {
                    stream: stream.clone(),
                    batch_id,
                    error: loader_error!(
                        ErrorKind::FlushWorkerPanic,
                        "Flush task panicked",
                        join_err
                    ),
                }
            }
        };

        let failed = matches!(event, FlushEvent::Failed { .. });
        if events.send(event).is_err() {
            break;
        }
        if failed {
            tasks.close();
            abandon_queued(&stream, &loader, batch_id, &mut tasks, &events).await;
            break;
        }
    }

    debug!(%stream, "flush worker stopped");
}

/// Empties a closed queue after `failed_batch` failed.
///
/// Queued merges go to dead-letter storage instead of the warehouse. Rejected records are
/// still written while version activations are dropped. Merges and activations are reported
/// as [`ErrorKind::InvalidState`] failures so the engine keeps the original failure as the
/// cause of the run.
async fn abandon_queued<W, S>(
    stream: &str,
    loader: &BatchLoader<W, S>,
    failed_batch: BatchId,
    tasks: &mut mpsc::Receiver<FlushTask>,
    events: &mpsc::UnboundedSender<FlushEvent>,
) where
    W: Warehouse,
    S: StagingClient,
{
    while let Some(task) = tasks.recv().await {
        let batch_id = task.batch_id();
        let stopped = loader_error!(
            ErrorKind::InvalidState,
            "Flush worker stopped after an earlier batch of the stream failed",
            format!("stream `{stream}`, failed batch {failed_batch}")
        );

        let event = match task {
            FlushTask::Merge(batch) => {
                let error = match loader.abandon(&batch, &stopped).await {
                    Ok(()) => stopped,
                    Err(dead_letter_err) => dead_letter_err,
                };
                FlushEvent::Failed {
                    stream: stream.to_string(),
                    batch_id,
                    error,
                }
            }
            task @ FlushTask::Reject { .. } => execute(stream, loader, task).await,
            FlushTask::Activate { .. } => FlushEvent::Failed {
                stream: stream.to_string(),
                batch_id,
                error: stopped,
            },
        };

        if events.send(event).is_err() {
            return;
        }
    }
}

async fn execute<W, S>(stream: &str, loader: &BatchLoader<W, S>, task: FlushTask) -> FlushEvent
where
    W: Warehouse,
    S: StagingClient,
{
    let stream = stream.to_string();

    match task {
        FlushTask::Merge(batch) => match loader.process(&batch).await {
            Ok(merged) => FlushEvent::Completed {
                stream,
                batch_id: merged.batch_id,
                rows_loaded: merged.rows_loaded,
            },
            Err(error) => FlushEvent::Failed {
                stream,
                batch_id: batch.id,
                error,
            },
        },
        FlushTask::Reject { id, chunk, records } => {
            match loader.reject(&stream, chunk, &records).await {
                Ok(()) => FlushEvent::RejectsWritten {
                    stream,
                    batch_id: id,
                    count: records.len(),
                },
                Err(error) => FlushEvent::Failed {
                    stream,
                    batch_id: id,
                    error,
                },
            }
        }
        FlushTask::Activate { id, table, shadow } => {
            match loader.activate(&table, &shadow).await {
                Ok(swapped) => FlushEvent::Activated {
                    stream,
                    batch_id: id,
                    table,
                    swapped,
                },
                Err(error) => FlushEvent::Failed {
                    stream,
                    batch_id: id,
                    error,
                },
            }
        }
    }
}
