//! Writer half of the shuffle. A [ShuffleWriter] is owned by one upstream task and pushes the rows of
//! one epoch at a time to the receiver endpoints, followed by an epoch marker on every endpoint.
//!
//! Sends are strictly one at a time, the next row goes out only after the previous one was
//! acknowledged. Per-sender ordering of the [Endpoint] therefore carries over to the receivers, and
//! an epoch marker always trails every row the writer sent for that epoch.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::Result;
use crate::error::Error;
use crate::message::{Epoch, Row, ShuffleMessage, WriterId};
use crate::metrics::{metrics, writer_partition_labels};
use crate::partitioner::Partitioner;
use crate::shuffle::Endpoint;

const DEFAULT_SEND_TIMEOUT_MILLIS: u64 = 30_000;
const DEFAULT_RETRY_INTERVAL_MILLIS: u64 = 10;
const DEFAULT_MAX_SEND_ATTEMPTS: u16 = 5;
/// Only every n-th retry of a send is logged.
const RETRY_LOG_EVERY: u16 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct WriterConfig {
    /// Upper bound for a single send, including time spent in back-pressure.
    pub send_timeout: Duration,
    pub retry_interval: Duration,
    /// Total attempts per message, the first one included.
    pub max_send_attempts: u16,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MILLIS),
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MILLIS),
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
        }
    }
}

/// What one [ShuffleWriter::write_epoch] call delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochWriteSummary {
    pub epoch: Epoch,
    /// Rows acknowledged per partition, indexed by partition.
    pub rows_per_partition: Vec<usize>,
    pub markers_sent: usize,
}

impl EpochWriteSummary {
    pub fn rows_total(&self) -> usize {
        self.rows_per_partition.iter().sum()
    }
}

pub struct ShuffleWriter<E> {
    writer_id: WriterId,
    partitioner: Arc<dyn Partitioner>,
    /// `endpoints[i]` owns partition `i`.
    endpoints: Vec<E>,
    config: WriterConfig,
    cancel_token: CancellationToken,
}

impl<E> ShuffleWriter<E>
where
    E: Endpoint + Sync,
{
    pub fn new(
        writer_id: WriterId,
        partitioner: Arc<dyn Partitioner>,
        endpoints: Vec<E>,
        config: WriterConfig,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Config(format!(
                "writer {writer_id} has no endpoints to write to"
            )));
        }
        if partitioner.partitions() as usize != endpoints.len() {
            return Err(Error::Config(format!(
                "writer {writer_id}: partitioner routes to {} partitions but {} endpoints were given",
                partitioner.partitions(),
                endpoints.len()
            )));
        }
        if config.max_send_attempts == 0 {
            return Err(Error::Config(
                "max_send_attempts must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            writer_id,
            partitioner,
            endpoints,
            config,
            cancel_token,
        })
    }

    pub fn writer_id(&self) -> WriterId {
        self.writer_id
    }

    /// Sends every row of `rows` to the endpoint of its partition and, once the stream is
    /// exhausted, an epoch marker to every endpoint, including the ones that got no rows. The
    /// stream must contain exactly the rows of `epoch`.
    ///
    /// The first send that cannot be delivered fails the whole epoch; the owning task is expected
    /// to be restarted with the same writer id at a fresh epoch.
    pub async fn write_epoch<S>(&self, epoch: Epoch, mut rows: S) -> Result<EpochWriteSummary>
    where
        S: Stream<Item = Row> + Unpin,
    {
        let mut summary = EpochWriteSummary {
            epoch,
            rows_per_partition: vec![0; self.endpoints.len()],
            markers_sent: 0,
        };

        while let Some(row) = rows.next().await {
            let partition = self.partitioner.partition(&row);
            let message = ShuffleMessage::Row {
                writer_id: self.writer_id,
                epoch,
                row,
            };
            self.send_with_retry(partition, message).await?;

            if let Some(count) = summary.rows_per_partition.get_mut(partition as usize) {
                *count += 1;
            }
            metrics()
                .shuffle
                .rows_sent_total
                .get_or_create(&writer_partition_labels(self.writer_id.0, partition))
                .inc();
        }

        for partition in 0..self.endpoints.len() as u16 {
            let marker = ShuffleMessage::EpochMarker {
                writer_id: self.writer_id,
                epoch,
            };
            self.send_with_retry(partition, marker).await?;
            summary.markers_sent += 1;
            metrics()
                .shuffle
                .markers_sent_total
                .get_or_create(&writer_partition_labels(self.writer_id.0, partition))
                .inc();
        }

        debug!(
            writer_id = %self.writer_id,
            %epoch,
            rows = summary.rows_total(),
            "epoch written"
        );
        Ok(summary)
    }

    /// Sends the message to the endpoint owning `partition`, retrying transient delivery failures
    /// (including timeouts) until `max_send_attempts` is used up.
    async fn send_with_retry(&self, partition: u16, message: ShuffleMessage) -> Result<()> {
        let Some(endpoint) = self.endpoints.get(partition as usize) else {
            return Err(Error::Invariant(format!(
                "partitioner returned partition {partition}, only {} endpoints exist",
                self.endpoints.len()
            )));
        };

        let mut attempt = 0u16;
        let mut log_counter = RETRY_LOG_EVERY;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return Err(Error::Cancelled),
                outcome = timeout(self.config.send_timeout, endpoint.send(message.clone())) => outcome,
            };

            let err = match outcome {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => Error::Delivery(format!(
                    "send to {} timed out after {:?}",
                    endpoint.address(),
                    self.config.send_timeout
                )),
            };

            if !err.is_retryable() {
                error!(?err, address = endpoint.address(), "Send rejected by endpoint");
                return Err(err);
            }
            if attempt >= self.config.max_send_attempts {
                error!(
                    ?err,
                    address = endpoint.address(),
                    attempt,
                    "Giving up on send, retries exhausted"
                );
                return Err(Error::Delivery(format!(
                    "writer {} could not deliver to {} after {attempt} attempts: {err}",
                    self.writer_id,
                    endpoint.address()
                )));
            }

            if log_counter >= RETRY_LOG_EVERY {
                warn!(
                    ?err,
                    address = endpoint.address(),
                    attempt,
                    "Send failed, retrying (throttled logging)"
                );
                log_counter = 0;
            }
            log_counter += 1;
            metrics()
                .shuffle
                .send_retries_total
                .get_or_create(&writer_partition_labels(self.writer_id.0, partition))
                .inc();

            tokio::select! {
                _ = self.cancel_token.cancelled() => return Err(Error::Cancelled),
                _ = sleep(self.config.retry_interval) => {}
            }
        }
    }
}
