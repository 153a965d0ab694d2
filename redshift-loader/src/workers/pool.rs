use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::SendError;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info_span};

use crate::error::{ErrorKind, LoaderError, LoaderResult};
use crate::loader_error;
use crate::merger::BatchLoader;
use crate::staging::StagingClient;
use crate::warehouse::Warehouse;
use crate::workers::flush::{FlushEvent, FlushTask, run_flush_worker};

/// Flush workers keyed by stream.
///
/// Every stream gets its own worker and bounded task queue, created on first use, so batches
/// of one stream are merged one at a time and in order. A shared semaphore bounds how many
/// tasks run at once across streams. A full queue makes [`FlushWorkerPool::submit`] wait,
/// which throttles the reader.
#[derive(Debug)]
pub struct FlushWorkerPool<W, S> {
    loader: Arc<BatchLoader<W, S>>,
    permits: Arc<Semaphore>,
    queue_capacity: usize,
    queues: HashMap<String, mpsc::Sender<FlushTask>>,
    join_set: JoinSet<String>,
    events_tx: mpsc::UnboundedSender<FlushEvent>,
}

impl<W, S> FlushWorkerPool<W, S>
where
    W: Warehouse,
    S: StagingClient,
{
    /// Creates the pool and the receiver of the events its workers report.
    pub fn new(
        loader: BatchLoader<W, S>,
        max_parallelism: usize,
        queue_capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<FlushEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pool = Self {
            loader: Arc::new(loader),
            permits: Arc::new(Semaphore::new(max_parallelism.max(1))),
            queue_capacity: queue_capacity.max(1),
            queues: HashMap::new(),
            join_set: JoinSet::new(),
            events_tx,
        };

        (pool, events_rx)
    }

    /// Queues a task for the worker of `stream`, waiting while its queue is full.
    ///
    /// Fails with [`ErrorKind::InvalidState`] when the worker stopped after a failed task. A
    /// batch refused that way is written to dead-letter storage first.
    pub async fn submit(&mut self, stream: &str, task: FlushTask) -> LoaderResult<()> {
        let sender = match self.queues.get(stream) {
            Some(sender) => sender.clone(),
            None => self.spawn_worker(stream),
        };

        let Err(SendError(task)) = sender.send(task).await else {
            return Ok(());
        };

        let err = loader_error!(
            ErrorKind::InvalidState,
            "Flush worker of the stream has stopped",
            format!("stream `{stream}`")
        );
        let FlushTask::Merge(batch) = task else {
            return Err(err);
        };
        if let Err(dead_letter_err) = self.loader.abandon(&batch, &err).await {
            return Err(LoaderError::from(vec![dead_letter_err, err]));
        }

        Err(err)
    }

    /// Number of streams with a worker.
    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    /// Closes every queue and waits for the workers to finish their queued tasks.
    ///
    /// Events keep flowing to the receiver until this returns. Panicked workers are reported
    /// as [`ErrorKind::FlushWorkerPanic`].
    pub async fn shutdown(mut self) -> LoaderResult<()> {
        self.queues.clear();

        let mut errors = Vec::new();
        while let Some(result) = self.join_set.join_next().await {
            match result {
                Ok(stream) => debug!(%stream, "flush worker finished"),
                Err(err) => {
                    error!(error = %err, "flush worker panicked");
                    errors.push(loader_error!(
                        ErrorKind::FlushWorkerPanic,
                        "Flush worker panicked",
                        err
                    ));
                }
            }
        }

        if !errors.is_empty() {
            return Err(LoaderError::from(errors));
        }

        Ok(())
    }

    fn spawn_worker(&mut self, stream: &str) -> mpsc::Sender<FlushTask> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let span = info_span!("flush_worker", stream = %stream);

        let worker = run_flush_worker(
            stream.to_string(),
            self.loader.clone(),
            self.permits.clone(),
            rx,
            self.events_tx.clone(),
        );
        let stream_name = stream.to_string();
        self.join_set.spawn(
            async move {
                worker.await;
                stream_name
            }
            .instrument(span),
        );

        debug!(stream, "spawned flush worker");
        self.queues.insert(stream.to_string(), tx.clone());

        tx
    }
}
