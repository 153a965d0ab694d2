//! The loading engine: reads protocol messages, buffers records, dispatches flush batches to
//! the workers and forwards checkpoints once their data is merged.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use metrics::counter;
use redshift_config::shared::UnknownColumnsPolicy;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::batch::{BatchId, RejectedRecord};
use crate::buffer::{Admission, FlushReason, RecordBuffer};
use crate::checkpoint::CheckpointEmitter;
use crate::concurrency::shutdown::ShutdownRx;
use crate::context::EngineContext;
use crate::error::{ErrorKind, LoaderError, LoaderResult};
use crate::merger::BatchLoader;
use crate::metrics::{
    MESSAGE_TYPE_LABEL, STREAM_LABEL, TARGET_CHECKPOINTS_EMITTED_TOTAL,
    TARGET_MESSAGES_RECEIVED_TOTAL, TARGET_RECORDS_REJECTED_TOTAL,
};
use crate::protocol::{ActivateVersionMessage, Message, RecordMessage, StateMessage, decode_line};
use crate::registry::{SchemaUpdate, StreamRegistry};
use crate::staging::StagingClient;
use crate::warehouse::Warehouse;
use crate::workers::{FlushEvent, FlushTask, FlushWorkerPool};

/// Period of the idle check that flushes streams past their fill timeout.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Rejected records of one stream are written out once this many have accumulated.
const REJECTED_CHUNK_SIZE: usize = 1_000;

/// Counters of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub messages: u64,
    pub records: u64,
    pub rejected_records: u64,
    pub batches: u64,
    pub rows_loaded: u64,
    pub checkpoints: u64,
}

/// Drives one run over an input of newline-delimited protocol messages.
///
/// The reader is single threaded. Batches are merged by one worker per stream, bounded by the
/// configured parallelism. A STATE message is written to the output once every batch that
/// existed when it arrived has been merged.
///
/// On a fatal error the engine stops reading, lets queued merges finish and returns the error
/// without writing any further checkpoint. On end of input or shutdown every buffered record
/// is flushed and merged first.
pub struct Engine<W, S> {
    ctx: EngineContext<W, S>,
    registry: StreamRegistry,
    buffer: RecordBuffer,
    checkpoints: CheckpointEmitter,
    pool: Option<FlushWorkerPool<W, S>>,
    events: mpsc::UnboundedReceiver<FlushEvent>,
    in_flight: HashSet<BatchId>,
    rejected: HashMap<String, Vec<RejectedRecord>>,
    reject_chunks: HashMap<String, u64>,
    errors: Vec<LoaderError>,
    summary: RunSummary,
    shutdown_rx: ShutdownRx,
}

impl<W, S> Engine<W, S>
where
    W: Warehouse,
    S: StagingClient,
{
    pub fn new(ctx: EngineContext<W, S>, shutdown_rx: ShutdownRx) -> Self {
        let (pool, events) = FlushWorkerPool::new(
            BatchLoader::new(ctx.clone()),
            ctx.config.max_parallelism,
            ctx.config.stream_queue_capacity,
        );

        Self {
            registry: StreamRegistry::new(ctx.config.clone()),
            buffer: RecordBuffer::new(ctx.config.clone()),
            checkpoints: CheckpointEmitter::new(),
            pool: Some(pool),
            events,
            in_flight: HashSet::new(),
            rejected: HashMap::new(),
            reject_chunks: HashMap::new(),
            errors: Vec::new(),
            summary: RunSummary::default(),
            shutdown_rx,
            ctx,
        }
    }

    /// Consumes `input` until it ends, shutdown is requested or a fatal error occurs, writing
    /// released checkpoints to `output`.
    pub async fn run<R, O>(mut self, input: R, output: &mut O) -> LoaderResult<RunSummary>
    where
        R: AsyncBufRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let span = info_span!("engine", run_id = %self.ctx.run_id);
        async move {
            info!("starting loading engine");

            match self.read_input(input, output).await {
                Ok(()) => {
                    if let Err(err) = self.flush_remaining().await {
                        self.fail(err);
                    }
                }
                Err(err) => self.fail(err),
            }

            self.drain(output).await;

            if !self.errors.is_empty() {
                return Err(root_cause(std::mem::take(&mut self.errors)));
            }

            info!(
                messages = self.summary.messages,
                records = self.summary.records,
                batches = self.summary.batches,
                rows = self.summary.rows_loaded,
                checkpoints = self.summary.checkpoints,
                "loading engine finished"
            );

            Ok(self.summary)
        }
        .instrument(span)
        .await
    }

    async fn read_input<R, O>(&mut self, input: R, output: &mut O) -> LoaderResult<()>
    where
        R: AsyncBufRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.wait_for_shutdown() => {
                    info!("shutdown requested, flushing buffered records");
                    return Ok(());
                }

                Some(event) = self.events.recv() => {
                    self.on_event(event, output).await?;
                }

                _ = tick.tick() => {
                    self.buffer.flush_expired(Instant::now());
                    self.dispatch().await?;
                }

                line = lines.next_line() => {
                    match line? {
                        Some(line) => self.on_line(&line, output).await?,
                        None => {
                            info!("input exhausted");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn on_line<O>(&mut self, line: &str, output: &mut O) -> LoaderResult<()>
    where
        O: AsyncWrite + Unpin,
    {
        let Some(message) = decode_line(line)? else {
            return Ok(());
        };

        self.summary.messages += 1;
        counter!(TARGET_MESSAGES_RECEIVED_TOTAL, MESSAGE_TYPE_LABEL => message.type_name())
            .increment(1);

        match message {
            Message::Schema(schema) => {
                let update = self.registry.register_or_update_schema(&schema)?;
                if update != SchemaUpdate::Unchanged {
                    debug!(stream = %schema.stream, ?update, "schema registered");
                }
            }
            Message::Record(record) => self.on_record(record).await?,
            Message::State(Some(state)) => self.on_state(state, output).await?,
            Message::State(None) => debug!("STATE message with a null value, nothing to forward"),
            Message::ActivateVersion(activate) => self.on_activate_version(activate).await?,
        }

        self.dispatch().await
    }

    async fn on_record(&mut self, record: RecordMessage) -> LoaderResult<()> {
        if self.ctx.config.unknown_columns == UnknownColumnsPolicy::Evolve {
            let flattened = self
                .registry
                .get(&record.stream)?
                .flatten(&record.record, self.ctx.config.data_flattening_max_level);
            self.registry
                .evolve_from_record(&record.stream, &flattened)?;
        }

        let state = self.registry.get(&record.stream)?;
        match self.buffer.add(state, &record, Instant::now())? {
            Admission::Buffered => self.summary.records += 1,
            Admission::Rejected(rejected) => {
                self.summary.rejected_records += 1;
                counter!(TARGET_RECORDS_REJECTED_TOTAL, STREAM_LABEL => record.stream.clone())
                    .increment(1);
                warn!(stream = %record.stream, error = %rejected.error, "record rejected");

                let pending = self.rejected.entry(record.stream.clone()).or_default();
                pending.push(rejected);
                if pending.len() >= REJECTED_CHUNK_SIZE {
                    self.submit_rejected(&record.stream).await?;
                }
            }
        }

        Ok(())
    }

    async fn on_state<O>(&mut self, state: StateMessage, output: &mut O) -> LoaderResult<()>
    where
        O: AsyncWrite + Unpin,
    {
        self.submit_all_rejected().await?;
        self.dispatch().await?;

        let outstanding = self
            .in_flight
            .iter()
            .copied()
            .chain(self.buffer.open_batch_ids())
            .collect::<Vec<_>>();
        debug!(outstanding = outstanding.len(), "checkpoint received");

        let released = self.checkpoints.push(state, outstanding);
        self.emit(released, output).await
    }

    /// Drains the stream and queues the swap of the activated version's shadow table behind
    /// its batches.
    async fn on_activate_version(&mut self, message: ActivateVersionMessage) -> LoaderResult<()> {
        let state = self.registry.get(&message.stream)?;
        let previous = state.active_version();
        let table = state.target().table.clone();

        self.buffer
            .flush_stream(&message.stream, FlushReason::VersionChange);
        self.submit_rejected(&message.stream).await?;
        self.dispatch().await?;

        if previous == Some(message.version) {
            debug!(stream = %message.stream, version = message.version, "version already active");
            return Ok(());
        }

        self.registry
            .set_active_version(&message.stream, message.version)?;
        info!(
            stream = %message.stream,
            version = message.version,
            ?previous,
            "activating table version"
        );

        let id = self.buffer.allocate_batch_id();
        let shadow = table.versioned(message.version);
        self.submit(&message.stream, id, FlushTask::Activate { id, table, shadow })
            .await
    }

    fn on_event_bookkeeping(&mut self, event: FlushEvent) -> LoaderResult<BatchId> {
        match event {
            FlushEvent::Completed {
                stream,
                batch_id,
                rows_loaded,
            } => {
                debug!(%stream, %batch_id, rows = rows_loaded, "batch completed");
                self.summary.batches += 1;
                self.summary.rows_loaded += rows_loaded;
                self.in_flight.remove(&batch_id);
                Ok(batch_id)
            }
            FlushEvent::RejectsWritten {
                stream,
                batch_id,
                count,
            } => {
                debug!(%stream, %batch_id, count, "rejected records written");
                self.in_flight.remove(&batch_id);
                Ok(batch_id)
            }
            FlushEvent::Activated {
                stream,
                batch_id,
                table,
                swapped,
            } => {
                debug!(%stream, %batch_id, %table, swapped, "table version activated");
                self.in_flight.remove(&batch_id);
                Ok(batch_id)
            }
            FlushEvent::Failed {
                stream,
                batch_id,
                error,
            } => {
                error!(%stream, %batch_id, error = %error, "flush task failed");
                self.in_flight.remove(&batch_id);
                Err(error)
            }
        }
    }

    async fn on_event<O>(&mut self, event: FlushEvent, output: &mut O) -> LoaderResult<()>
    where
        O: AsyncWrite + Unpin,
    {
        let batch_id = self.on_event_bookkeeping(event)?;
        let released = self.checkpoints.complete(batch_id);

        self.emit(released, output).await
    }

    /// Submits every sealed batch to its stream's worker.
    async fn dispatch(&mut self) -> LoaderResult<()> {
        for batch in self.buffer.drain_ready() {
            let stream = batch.stream.clone();
            let id = batch.id;
            self.submit(&stream, id, FlushTask::Merge(batch)).await?;
        }

        Ok(())
    }

    async fn submit(&mut self, stream: &str, id: BatchId, task: FlushTask) -> LoaderResult<()> {
        let Some(pool) = self.pool.as_mut() else {
            return Ok(());
        };

        self.in_flight.insert(id);
        pool.submit(stream, task).await
    }

    async fn submit_rejected(&mut self, stream: &str) -> LoaderResult<()> {
        let Some(records) = self.rejected.remove(stream) else {
            return Ok(());
        };
        if records.is_empty() {
            return Ok(());
        }

        let chunk = self.reject_chunks.entry(stream.to_string()).or_default();
        *chunk += 1;
        let chunk = *chunk;

        let id = self.buffer.allocate_batch_id();
        self.submit(stream, id, FlushTask::Reject { id, chunk, records })
            .await
    }

    async fn submit_all_rejected(&mut self) -> LoaderResult<()> {
        let mut streams = self.rejected.keys().cloned().collect::<Vec<_>>();
        streams.sort();

        for stream in streams {
            self.submit_rejected(&stream).await?;
        }

        Ok(())
    }

    /// Seals and submits everything still buffered.
    async fn flush_remaining(&mut self) -> LoaderResult<()> {
        self.buffer.flush_all(FlushReason::Drain);
        self.submit_all_rejected().await?;
        self.dispatch().await
    }

    /// Waits for the workers to finish queued tasks and processes their last events.
    async fn drain<O>(&mut self, output: &mut O)
    where
        O: AsyncWrite + Unpin,
    {
        let Some(pool) = self.pool.take() else {
            return;
        };

        info!(
            in_flight = self.in_flight.len(),
            workers = pool.workers(),
            "draining flush workers"
        );
        if let Err(err) = pool.shutdown().await {
            self.fail(err);
        }

        while let Some(event) = self.events.recv().await {
            if let Err(err) = self.on_event(event, output).await {
                self.fail(err);
            }
        }

        if self.errors.is_empty() && self.checkpoints.pending() > 0 {
            warn!(
                pending = self.checkpoints.pending(),
                "checkpoints still pending after drain"
            );
        }
    }

    /// Writes released checkpoints, unless the run has already failed.
    async fn emit<O>(&mut self, states: Vec<StateMessage>, output: &mut O) -> LoaderResult<()>
    where
        O: AsyncWrite + Unpin,
    {
        if !self.errors.is_empty() {
            return Ok(());
        }

        for state in states {
            output.write_all(state.payload().as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;

            self.summary.checkpoints += 1;
            counter!(TARGET_CHECKPOINTS_EMITTED_TOTAL).increment(1);
            debug!("checkpoint emitted");
        }

        Ok(())
    }

    fn fail(&mut self, err: LoaderError) {
        if self.errors.is_empty() {
            error!(error = %err, "run failed, draining without further checkpoints");
        }
        self.errors.push(err);
    }
}

/// Drops errors about stopped workers when the failure that stopped them is known.
fn root_cause(errors: Vec<LoaderError>) -> LoaderError {
    let (stopped, causes): (Vec<_>, Vec<_>) = errors
        .into_iter()
        .partition(|err| err.kind() == ErrorKind::InvalidState);

    if causes.is_empty() {
        LoaderError::from(stopped)
    } else {
        LoaderError::from(causes)
    }
}
