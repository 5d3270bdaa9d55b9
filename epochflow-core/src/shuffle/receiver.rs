//! Per-partition mailbox. Any number of writers deliver [ShuffleMessage]s concurrently through a
//! [ReceiverHandle]; the single local consumer pulls rows with [ReceiverEndpoint::next], which
//! reports [Received::EpochEnd] only once every known writer has sent its epoch marker.
//!
//! The end of an epoch is tracked with an explicit per-writer [MarkerState]. The number of known
//! writers is configuration, never derived from traffic, because a writer that has nothing to send
//! is indistinguishable from one that is merely slow.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Result;
use crate::error::Error;
use crate::message::{Epoch, Received, Row, ShuffleMessage, WriterId};
use crate::metrics::{metrics, partition_labels};
use crate::shuffle::Endpoint;

const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub partition_idx: u16,
    /// Number of upstream writers; writer ids are `0..upstream_writers`.
    pub upstream_writers: u16,
    /// First epoch the consumer will observe.
    pub start_epoch: Epoch,
    /// Max rows queued before row deliveries are held back (see [ReceiverHandle::send]).
    pub capacity: usize,
}

impl ReceiverConfig {
    pub fn new(partition_idx: u16, upstream_writers: u16) -> Self {
        Self {
            partition_idx,
            upstream_writers,
            start_epoch: Epoch::default(),
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn with_start_epoch(mut self, start_epoch: Epoch) -> Self {
        self.start_epoch = start_epoch;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Marker state of one writer. It only ever moves forward: `Closed(e)` means the writer has no
/// further rows for `e` or any earlier epoch, so the marker of a superseding task attempt (which
/// starts at a fresh epoch) also closes whatever epoch its predecessor left open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    Pending,
    Closed(Epoch),
}

impl MarkerState {
    fn is_closed_for(&self, epoch: Epoch) -> bool {
        matches!(self, MarkerState::Closed(closed) if *closed >= epoch)
    }
}

#[derive(Debug)]
struct ReceiverState {
    current_epoch: Epoch,
    /// Indexed by writer id.
    markers: Vec<MarkerState>,
    /// Rows per epoch. Rows of a fast writer that already moved past the current epoch wait here
    /// until their epoch becomes current.
    queues: BTreeMap<Epoch, VecDeque<(WriterId, Row)>>,
    queued: usize,
}

impl ReceiverState {
    fn new(upstream_writers: u16, start_epoch: Epoch) -> Self {
        Self {
            current_epoch: start_epoch,
            markers: vec![MarkerState::Pending; upstream_writers as usize],
            queues: BTreeMap::new(),
            queued: 0,
        }
    }

    fn all_closed(&self) -> bool {
        let epoch = self.current_epoch;
        self.markers.iter().all(|m| m.is_closed_for(epoch))
    }

    fn current_queue_len(&self) -> usize {
        self.queues.get(&self.current_epoch).map_or(0, VecDeque::len)
    }

    /// Rows of the current epoch only wait for the consumer to drain the current epoch. Rows of a
    /// future epoch wait for the whole mailbox, they cannot be drained before the epoch barrier.
    /// Markers never wait, so the barrier can always be crossed.
    fn has_room_for(&self, epoch: Epoch, capacity: usize) -> bool {
        if epoch == self.current_epoch {
            self.current_queue_len() < capacity
        } else {
            self.queued < capacity
        }
    }

    /// Drop the finished epoch and move on; writers that only closed earlier epochs are pending
    /// again while writers that already closed a later epoch stay closed.
    fn advance(&mut self) -> Epoch {
        let ended = self.current_epoch;
        if let Some(leftover) = self.queues.remove(&ended) {
            self.queued -= leftover.len();
        }
        self.current_epoch = ended.next();
        let current = self.current_epoch;
        for marker in self.markers.iter_mut() {
            if !marker.is_closed_for(current) {
                *marker = MarkerState::Pending;
            }
        }
        ended
    }
}

#[derive(Debug)]
struct Shared {
    config: ReceiverConfig,
    state: Mutex<ReceiverState>,
    /// Woken when a row or a marker arrives.
    data_ready: Notify,
    /// Woken when the consumer frees up room or crosses an epoch barrier.
    space_available: Notify,
    cancel_token: CancellationToken,
    address: String,
}

impl Shared {
    fn record_pending(&self, queued: usize) {
        metrics()
            .shuffle
            .pending_rows
            .get_or_create(&partition_labels(self.config.partition_idx))
            .set(queued as i64);
    }

    fn writer_index(&self, writer_id: WriterId) -> Result<usize> {
        if writer_id.0 >= self.config.upstream_writers {
            return Err(Error::Config(format!(
                "writer {writer_id} is not one of the {} writers known to {}",
                self.config.upstream_writers, self.address
            )));
        }
        Ok(writer_id.0 as usize)
    }

    async fn deliver(&self, message: ShuffleMessage) -> Result<()> {
        match message {
            ShuffleMessage::Row {
                writer_id,
                epoch,
                row,
            } => self.deliver_row(writer_id, epoch, row).await,
            ShuffleMessage::EpochMarker { writer_id, epoch } => {
                self.deliver_marker(writer_id, epoch)
            }
        }
    }

    async fn deliver_row(&self, writer_id: WriterId, epoch: Epoch, row: Row) -> Result<()> {
        let idx = self.writer_index(writer_id)?;
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if epoch < state.current_epoch {
                    return Err(Error::StaleEpoch(format!(
                        "row from writer {writer_id} for epoch {epoch}, {} is at epoch {}",
                        self.address, state.current_epoch
                    )));
                }
                if state
                    .markers
                    .get(idx)
                    .is_some_and(|m| m.is_closed_for(epoch))
                {
                    return Err(Error::StaleEpoch(format!(
                        "row from writer {writer_id} for epoch {epoch} after its epoch marker"
                    )));
                }
                if state.has_room_for(epoch, self.config.capacity) {
                    state
                        .queues
                        .entry(epoch)
                        .or_default()
                        .push_back((writer_id, row));
                    state.queued += 1;
                    self.record_pending(state.queued);
                    drop(state);

                    metrics()
                        .shuffle
                        .rows_received_total
                        .get_or_create(&partition_labels(self.config.partition_idx))
                        .inc();
                    self.data_ready.notify_waiters();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.cancel_token.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    fn deliver_marker(&self, writer_id: WriterId, epoch: Epoch) -> Result<()> {
        let idx = self.writer_index(writer_id)?;
        {
            let mut state = self.state.lock();
            if epoch < state.current_epoch {
                debug!(
                    address = %self.address,
                    %writer_id,
                    %epoch,
                    "ignoring marker for an epoch that already ended"
                );
                return Ok(());
            }
            let Some(marker) = state.markers.get_mut(idx) else {
                return Err(Error::Invariant(format!("no marker slot for writer {writer_id}")));
            };
            match *marker {
                MarkerState::Closed(closed) if closed >= epoch => {
                    debug!(address = %self.address, %writer_id, %epoch, "duplicate epoch marker");
                }
                _ => *marker = MarkerState::Closed(epoch),
            }
        }
        self.data_ready.notify_waiters();
        Ok(())
    }
}

/// The mailbox of one partition together with its consumer-facing pull interface. There is exactly
/// one consumer per partition, hence `next` takes `&mut self`; writers use [ReceiverHandle]s.
#[derive(Debug)]
pub struct ReceiverEndpoint {
    shared: Arc<Shared>,
}

impl ReceiverEndpoint {
    /// Creates the endpoint. The cancellation token wakes a consumer or a writer blocked on this
    /// endpoint when the owning task is stopped.
    pub fn new(config: ReceiverConfig, cancel_token: CancellationToken) -> Result<Self> {
        if config.upstream_writers == 0 {
            return Err(Error::Config(format!(
                "receiver {} needs at least one upstream writer",
                config.partition_idx
            )));
        }
        if config.capacity == 0 {
            return Err(Error::Config(format!(
                "receiver {} capacity must be greater than zero",
                config.partition_idx
            )));
        }

        let state = ReceiverState::new(config.upstream_writers, config.start_epoch);
        let address = format!("receiver-{}", config.partition_idx);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                data_ready: Notify::new(),
                space_available: Notify::new(),
                cancel_token,
                address,
            }),
        })
    }

    /// Handle writers use to deliver messages to this endpoint.
    pub fn handle(&self) -> ReceiverHandle {
        ReceiverHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn partition_idx(&self) -> u16 {
        self.shared.config.partition_idx
    }

    /// Returns the next row of the current epoch. If none is queued it waits until a row arrives or
    /// all known writers closed the current epoch, in which case the epoch ends and the receiver
    /// moves to the next one. Returns [Error::Cancelled] if the owning task is stopped meanwhile.
    pub async fn next(&mut self) -> Result<Received> {
        let shared = &self.shared;
        loop {
            let notified = shared.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.state.lock();
                let current = state.current_epoch;
                if let Some((writer_id, row)) = state
                    .queues
                    .get_mut(&current)
                    .and_then(VecDeque::pop_front)
                {
                    state.queued -= 1;
                    shared.record_pending(state.queued);
                    drop(state);
                    shared.space_available.notify_waiters();
                    return Ok(Received::Row { writer_id, row });
                }

                if state.all_closed() {
                    let ended = state.advance();
                    shared.record_pending(state.queued);
                    drop(state);

                    metrics()
                        .shuffle
                        .epochs_closed_total
                        .get_or_create(&partition_labels(shared.config.partition_idx))
                        .inc();
                    debug!(address = %shared.address, epoch = %ended, "epoch ended");
                    // rows of the next epoch may have been held back
                    shared.space_available.notify_waiters();
                    return Ok(Received::EpochEnd(ended));
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shared.cancel_token.cancelled() => {
                    warn!(address = %shared.address, "receiver cancelled while waiting for data");
                    return Err(Error::Cancelled);
                }
            }
        }
    }

    /// Epoch the consumer is currently reading.
    pub fn current_epoch(&self) -> Epoch {
        self.shared.state.lock().current_epoch
    }

    /// Rows queued across all epochs.
    pub fn pending_rows(&self) -> usize {
        self.shared.state.lock().queued
    }

    pub fn marker_state(&self, writer_id: WriterId) -> Option<MarkerState> {
        self.shared
            .state
            .lock()
            .markers
            .get(writer_id.0 as usize)
            .copied()
    }
}

/// Writer-facing side of a [ReceiverEndpoint]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ReceiverHandle {
    shared: Arc<Shared>,
}

impl Endpoint for ReceiverHandle {
    /// Accepts the message, or fails it with a protocol error. A row waits for room (back-pressure)
    /// before it is acknowledged.
    async fn send(&self, message: ShuffleMessage) -> Result<()> {
        self.shared.deliver(message).await
    }

    fn address(&self) -> &str {
        &self.shared.address
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn row(writer: u16, epoch: u64, value: &'static str) -> ShuffleMessage {
        ShuffleMessage::Row {
            writer_id: WriterId(writer),
            epoch: Epoch(epoch),
            row: Row::from(value),
        }
    }

    fn marker(writer: u16, epoch: u64) -> ShuffleMessage {
        ShuffleMessage::EpochMarker {
            writer_id: WriterId(writer),
            epoch: Epoch(epoch),
        }
    }

    fn received(writer: u16, value: &'static str) -> Received {
        Received::Row {
            writer_id: WriterId(writer),
            row: Row::from(value),
        }
    }

    fn receiver(writers: u16) -> ReceiverEndpoint {
        ReceiverEndpoint::new(ReceiverConfig::new(0, writers), CancellationToken::new()).unwrap()
    }

    #[tokio::test]
    async fn test_rows_then_epoch_end() {
        let mut receiver = receiver(1);
        let handle = receiver.handle();

        for value in ["A", "B", "C"] {
            handle.send(row(0, 0, value)).await.unwrap();
        }
        handle.send(marker(0, 0)).await.unwrap();

        assert_eq!(receiver.next().await.unwrap(), received(0, "A"));
        assert_eq!(receiver.next().await.unwrap(), received(0, "B"));
        assert_eq!(receiver.next().await.unwrap(), received(0, "C"));
        assert_eq!(receiver.next().await.unwrap(), Received::EpochEnd(Epoch(0)));
        assert_eq!(receiver.current_epoch(), Epoch(1));
        assert_eq!(receiver.marker_state(WriterId(0)), Some(MarkerState::Pending));
    }

    #[tokio::test]
    async fn test_epoch_end_waits_for_every_known_writer() {
        let mut receiver = receiver(3);
        let handle = receiver.handle();

        handle.send(marker(0, 0)).await.unwrap();
        handle.send(marker(2, 0)).await.unwrap();

        // writer 1 never sent anything yet, the epoch must stay open
        let pending = tokio::time::timeout(Duration::from_millis(50), receiver.next()).await;
        assert!(pending.is_err());

        handle.send(marker(1, 0)).await.unwrap();
        assert_eq!(receiver.next().await.unwrap(), Received::EpochEnd(Epoch(0)));
    }

    #[tokio::test]
    async fn test_blocked_next_wakes_on_row() {
        let mut receiver = receiver(1);
        let handle = receiver.handle();

        let consumer = tokio::spawn(async move {
            let first = receiver.next().await.unwrap();
            (receiver, first)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.send(row(0, 0, "late")).await.unwrap();

        let (_, first) = consumer.await.unwrap();
        assert_eq!(first, received(0, "late"));
    }

    #[tokio::test]
    async fn test_future_epoch_rows_wait_for_barrier() {
        let mut receiver = receiver(2);
        let handle = receiver.handle();

        // writer 0 is fast and already writing epoch 1
        handle.send(row(0, 0, "a0")).await.unwrap();
        handle.send(marker(0, 0)).await.unwrap();
        handle.send(row(0, 1, "a1")).await.unwrap();
        handle.send(row(1, 0, "b0")).await.unwrap();

        assert_eq!(receiver.next().await.unwrap(), received(0, "a0"));
        assert_eq!(receiver.next().await.unwrap(), received(1, "b0"));
        // a1 belongs to epoch 1 and must not leak into epoch 0
        let pending = tokio::time::timeout(Duration::from_millis(50), receiver.next()).await;
        assert!(pending.is_err());

        handle.send(marker(1, 0)).await.unwrap();
        assert_eq!(receiver.next().await.unwrap(), Received::EpochEnd(Epoch(0)));
        assert_eq!(receiver.next().await.unwrap(), received(0, "a1"));
    }

    #[tokio::test]
    async fn test_marker_state_survives_barrier_for_faster_writer() {
        let mut receiver = receiver(2);
        let handle = receiver.handle();

        handle.send(marker(0, 0)).await.unwrap();
        handle.send(marker(0, 1)).await.unwrap();
        handle.send(marker(1, 0)).await.unwrap();

        assert_eq!(receiver.next().await.unwrap(), Received::EpochEnd(Epoch(0)));
        assert_eq!(
            receiver.marker_state(WriterId(0)),
            Some(MarkerState::Closed(Epoch(1)))
        );
        assert_eq!(receiver.marker_state(WriterId(1)), Some(MarkerState::Pending));

        handle.send(marker(1, 1)).await.unwrap();
        assert_eq!(receiver.next().await.unwrap(), Received::EpochEnd(Epoch(1)));
    }

    #[tokio::test]
    async fn test_superseded_attempt_closed_by_later_epoch_marker() {
        let mut receiver = receiver(1);
        let handle = receiver.handle();

        // first attempt of writer 0 dies half way through epoch 0
        handle.send(row(0, 0, "partial")).await.unwrap();
        // the retried attempt runs at a fresh epoch and sends its full set
        handle.send(row(0, 1, "full-1")).await.unwrap();
        handle.send(row(0, 1, "full-2")).await.unwrap();
        handle.send(marker(0, 1)).await.unwrap();

        assert_eq!(receiver.next().await.unwrap(), received(0, "partial"));
        assert_eq!(receiver.next().await.unwrap(), Received::EpochEnd(Epoch(0)));
        assert_eq!(receiver.next().await.unwrap(), received(0, "full-1"));
        assert_eq!(receiver.next().await.unwrap(), received(0, "full-2"));
        assert_eq!(receiver.next().await.unwrap(), Received::EpochEnd(Epoch(1)));
    }

    #[tokio::test]
    async fn test_duplicate_and_stale_markers_are_ignored() {
        let mut receiver = receiver(1);
        let handle = receiver.handle();

        handle.send(marker(0, 0)).await.unwrap();
        handle.send(marker(0, 0)).await.unwrap();
        assert_eq!(receiver.next().await.unwrap(), Received::EpochEnd(Epoch(0)));

        // epoch 0 already ended, a late marker for it changes nothing
        handle.send(marker(0, 0)).await.unwrap();
        assert_eq!(receiver.marker_state(WriterId(0)), Some(MarkerState::Pending));
        let pending = tokio::time::timeout(Duration::from_millis(30), receiver.next()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_rejects_stale_rows_and_unknown_writers() {
        let mut receiver = receiver(1);
        let handle = receiver.handle();

        handle.send(marker(0, 0)).await.unwrap();
        let err = handle.send(row(0, 0, "after-marker")).await.unwrap_err();
        assert!(matches!(err, Error::StaleEpoch(_)));

        assert_eq!(receiver.next().await.unwrap(), Received::EpochEnd(Epoch(0)));
        let err = handle.send(row(0, 0, "too-late")).await.unwrap_err();
        assert!(matches!(err, Error::StaleEpoch(_)));

        let err = handle.send(row(5, 1, "stranger")).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = handle.send(marker(5, 1)).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_capacity_holds_back_rows_until_consumed() {
        let mut receiver = ReceiverEndpoint::new(
            ReceiverConfig::new(0, 1).with_capacity(2),
            CancellationToken::new(),
        )
        .unwrap();
        let handle = receiver.handle();

        handle.send(row(0, 0, "1")).await.unwrap();
        handle.send(row(0, 0, "2")).await.unwrap();

        let blocked = handle.clone();
        let third = tokio::spawn(async move { blocked.send(row(0, 0, "3")).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!third.is_finished());
        assert_eq!(receiver.pending_rows(), 2);

        assert_eq!(receiver.next().await.unwrap(), received(0, "1"));
        third.await.unwrap().unwrap();
        assert_eq!(receiver.pending_rows(), 2);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_next() {
        let cancel = CancellationToken::new();
        let mut receiver =
            ReceiverEndpoint::new(ReceiverConfig::new(3, 1), cancel.clone()).unwrap();

        let consumer = tokio::spawn(async move { receiver.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(consumer.await.unwrap(), Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_writer_waiting_for_room() {
        let cancel = CancellationToken::new();
        let receiver = ReceiverEndpoint::new(
            ReceiverConfig::new(0, 1).with_capacity(1),
            cancel.clone(),
        )
        .unwrap();
        let handle = receiver.handle();
        handle
            .send(ShuffleMessage::Row {
                writer_id: WriterId(0),
                epoch: Epoch(0),
                row: Row::from("a"),
            })
            .await
            .unwrap();

        let blocked = tokio::spawn(async move {
            handle
                .send(ShuffleMessage::Row {
                    writer_id: WriterId(0),
                    epoch: Epoch(0),
                    row: Row::from("b"),
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        cancel.cancel();
        assert_eq!(blocked.await.unwrap(), Err(Error::Cancelled));
        assert_eq!(receiver.pending_rows(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_corrupt_state() {
        let writers = 8u16;
        let rows_per_writer = 200usize;
        let mut receiver = receiver(writers);

        let mut tasks = Vec::new();
        for w in 0..writers {
            let handle = receiver.handle();
            tasks.push(tokio::spawn(async move {
                for i in 0..rows_per_writer {
                    handle
                        .send(ShuffleMessage::Row {
                            writer_id: WriterId(w),
                            epoch: Epoch(0),
                            row: Row::new(format!("{w}-{i}")),
                        })
                        .await
                        .unwrap();
                }
                handle.send(marker(w, 0)).await.unwrap();
            }));
        }

        let mut per_writer = vec![0usize; writers as usize];
        loop {
            match receiver.next().await.unwrap() {
                Received::Row { writer_id, .. } => {
                    if let Some(count) = per_writer.get_mut(writer_id.0 as usize) {
                        *count += 1;
                    }
                }
                Received::EpochEnd(epoch) => {
                    assert_eq!(epoch, Epoch(0));
                    break;
                }
            }
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(per_writer.iter().all(|c| *c == rows_per_writer));
        assert_eq!(receiver.pending_rows(), 0);
    }

    #[test]
    fn test_invalid_config() {
        let err = ReceiverEndpoint::new(ReceiverConfig::new(0, 0), CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = ReceiverEndpoint::new(
            ReceiverConfig::new(0, 1).with_capacity(0),
            CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
