//! In-process pipeline: generator lanes feed source tasks, which shuffle their rows to one receiver
//! per partition, where consumer tasks drain them.
//!
//! ```text
//!  epoch clock ──▶ source (lane 0) ──┐            ┌──▶ receiver 0 ──▶ consumer 0 ──┐
//!              ──▶ source (lane 1) ──┼─ shuffle ──┤                                ├──▶ coordinator
//!              ──▶ source (lane n) ──┘            └──▶ receiver p ──▶ consumer p ──┘        │
//!                     │                                                                    │
//!                     └──────────────────── commit log ◀─── commit epoch ──────────────────┘
//! ```
//!
//! The epoch clock is a watch channel holding the current epoch. A source closes every epoch below
//! the clock's value: it appends the epoch's rows to its commit log (the offset is the epoch) and
//! writes them through its shuffle writer. When the clock stops, because the configured duration
//! elapsed or shutdown was requested, every source closes the epoch it is in and exits, and every
//! consumer exits after that final epoch ended. Any task failure cancels all the others.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;
use crate::commitlog::tracker::CommitTracker;
use crate::config::Settings;
use crate::coordinator::CoordinatorHandle;
use crate::error::Error;
use crate::generator::{GeneratorLane, RateGenerator};
use crate::message::{Epoch, Offset, Received, Row, WriterId};
use crate::partitioner::{HashPartitioner, Partitioner};
use crate::shuffle::receiver::{ReceiverConfig, ReceiverEndpoint, ReceiverHandle};
use crate::shuffle::writer::ShuffleWriter;

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// Last epoch every source closed.
    pub final_epoch: Epoch,
    pub committed_epoch: Option<Epoch>,
    pub rows_generated: u64,
    pub rows_consumed: u64,
}

/// Runs the pipeline until `shutdown` is cancelled or the configured duration elapsed, then drains
/// it. Returns the first task error, if any.
pub async fn run_pipeline(settings: &Settings, shutdown: CancellationToken) -> Result<PipelineReport> {
    // cancelled on the first task failure, unlike `shutdown` this is not graceful
    let abort = CancellationToken::new();

    let generator = RateGenerator::new(settings.generator.clone(), abort.clone())?;
    let writers = settings.generator.num_lanes;
    let partitioner: Arc<dyn Partitioner> = Arc::new(HashPartitioner::new(settings.partitions));

    let mut receivers = Vec::with_capacity(settings.partitions as usize);
    for partition in 0..settings.partitions {
        let config = ReceiverConfig::new(partition, writers).with_capacity(settings.receiver_capacity);
        receivers.push(ReceiverEndpoint::new(config, abort.clone())?);
    }
    let handles: Vec<ReceiverHandle> = receivers.iter().map(ReceiverEndpoint::handle).collect();

    let trackers: Vec<CommitTracker<Vec<Row>>> = (0..writers)
        .map(|lane| CommitTracker::new(WriterId(lane)))
        .collect();
    let coordinator = CoordinatorHandle::new(settings.partitions, trackers.clone(), Epoch::default());

    let (clock_tx, clock_rx) = watch::channel(Epoch::default());
    let clock = tokio::spawn(run_clock(
        clock_tx,
        settings.epoch_interval,
        settings.run_duration,
        shutdown,
        abort.clone(),
    ));

    let mut sources = Vec::with_capacity(writers as usize);
    for (lane, tracker) in generator.lanes().into_iter().zip(trackers) {
        let writer = ShuffleWriter::new(
            WriterId(lane.lane()),
            Arc::clone(&partitioner),
            handles.clone(),
            settings.writer.clone(),
            abort.clone(),
        )?;
        let source = Source {
            lane,
            tracker,
            writer,
            clock: clock_rx.clone(),
            abort: abort.clone(),
        };
        sources.push(spawn_task(source.run(), abort.clone()));
    }
    drop(handles);

    let mut consumers = Vec::with_capacity(receivers.len());
    for receiver in receivers {
        let consumer = consume(receiver, coordinator.clone(), clock_rx.clone());
        consumers.push(spawn_task(consumer, abort.clone()));
    }
    info!(
        lanes = writers,
        partitions = settings.partitions,
        "Pipeline started"
    );

    let (rows_generated, source_err) = join_all(sources).await;
    let (rows_consumed, consumer_err) = join_all(consumers).await;
    let final_epoch = clock.await?;

    if let Some(err) = source_err.or(consumer_err) {
        error!(?err, "Pipeline failed");
        return Err(err);
    }

    let report = PipelineReport {
        final_epoch,
        committed_epoch: coordinator.committed_epoch().await?,
        rows_generated,
        rows_consumed,
    };
    info!(?report, "Pipeline drained");
    Ok(report)
}

/// Advances the epoch every `epoch_interval` until shutdown, the deadline, or an abort. Dropping the
/// sender tells the sources the current epoch is the last one.
async fn run_clock(
    clock: watch::Sender<Epoch>,
    epoch_interval: Duration,
    run_duration: Option<Duration>,
    shutdown: CancellationToken,
    abort: CancellationToken,
) -> Epoch {
    let start = Instant::now();
    let mut ticker = interval_at(start + epoch_interval, epoch_interval);
    let deadline = async {
        match run_duration {
            Some(duration) => sleep_until(start + duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                clock.send_modify(|epoch| *epoch = epoch.next());
                let epoch = *clock.borrow();
                debug!(%epoch, "Epoch advanced");
            }
            _ = &mut deadline => {
                info!("Run duration elapsed, stopping the epoch clock");
                break;
            }
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, stopping the epoch clock");
                break;
            }
            _ = abort.cancelled() => break,
        }
    }
    *clock.borrow()
}

struct Source {
    lane: GeneratorLane,
    tracker: CommitTracker<Vec<Row>>,
    writer: ShuffleWriter<ReceiverHandle>,
    clock: watch::Receiver<Epoch>,
    abort: CancellationToken,
}

impl Source {
    /// Returns the number of rows generated.
    async fn run(mut self) -> Result<u64> {
        // every source starts at the first epoch even if the clock already moved on, the epochs it
        // missed are closed on the first change
        let mut epoch = Epoch::default();
        let mut batch = Vec::new();
        let mut generated = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = self.abort.cancelled() => return Err(Error::Cancelled),
                changed = self.clock.changed() => {
                    if changed.is_err() {
                        // the clock stopped, the epoch we are in is the last one
                        self.close_epoch(epoch, std::mem::take(&mut batch)).await?;
                        break;
                    }
                    let target = *self.clock.borrow_and_update();
                    while epoch < target {
                        self.close_epoch(epoch, std::mem::take(&mut batch)).await?;
                        epoch = epoch.next();
                    }
                }
                row = self.lane.next_row() => {
                    batch.push(row?.into_row()?);
                    generated += 1;
                }
            }
        }

        info!(writer_id = %self.writer.writer_id(), %epoch, generated, "Source finished");
        Ok(generated)
    }

    async fn close_epoch(&self, epoch: Epoch, rows: Vec<Row>) -> Result<()> {
        let offset = self.tracker.append(rows.clone());
        if offset != Offset::try_from(epoch)? {
            return Err(Error::Invariant(format!(
                "source {} buffered epoch {epoch} at offset {offset}",
                self.tracker.source()
            )));
        }
        self.writer
            .write_epoch(epoch, tokio_stream::iter(rows))
            .await?;
        Ok(())
    }
}

/// Drains one receiver and reports every finished epoch. Returns the number of rows consumed.
async fn consume(
    mut receiver: ReceiverEndpoint,
    coordinator: CoordinatorHandle,
    clock: watch::Receiver<Epoch>,
) -> Result<u64> {
    let partition = receiver.partition_idx();
    let mut consumed = 0u64;
    loop {
        match receiver.next().await? {
            Received::Row { .. } => consumed += 1,
            Received::EpochEnd(epoch) => {
                coordinator.epoch_done(partition, epoch).await?;
                // the clock is closed before any source closes the final epoch
                if clock.has_changed().is_err() && epoch >= *clock.borrow() {
                    break;
                }
            }
        }
    }
    info!(partition, consumed, "Consumer finished");
    Ok(consumed)
}

fn spawn_task<F>(task: F, abort: CancellationToken) -> JoinHandle<Result<u64>>
where
    F: Future<Output = Result<u64>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = task.await;
        if let Err(e) = &result {
            if *e != Error::Cancelled {
                error!(?e, "Task failed, cancelling the pipeline");
            }
            abort.cancel();
        }
        result
    })
}

/// Sums the task results and keeps the root cause: a real error wins over the cancellations it
/// caused in other tasks.
async fn join_all(tasks: Vec<JoinHandle<Result<u64>>>) -> (u64, Option<Error>) {
    let mut total = 0;
    let mut first_err: Option<Error> = None;
    for task in tasks {
        let err = match task.await {
            Ok(Ok(count)) => {
                total += count;
                continue;
            }
            Ok(Err(e)) => e,
            Err(e) => Error::from(e),
        };
        if first_err.as_ref().is_none_or(|prev| *prev == Error::Cancelled) {
            first_err = Some(err);
        }
    }
    (total, first_err)
}
