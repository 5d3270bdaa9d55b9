//! Decides when an epoch is durably processed. Every consumer reports the epochs it finished; once
//! all partitions finished an epoch, its offset is committed on the commit log of every source and
//! the buffered batches for it can go.
//!
//! The coordinator is an actor: a single task owns the bookkeeping and [CoordinatorHandle]s talk to
//! it over a channel.

use std::collections::{BTreeMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::Result;
use crate::commitlog::tracker::CommitTracker;
use crate::error::Error;
use crate::message::{Epoch, Offset};

const CHANNEL_SIZE: usize = 100;

enum ActorMessage {
    EpochDone {
        partition: u16,
        epoch: Epoch,
        respond_to: oneshot::Sender<Result<()>>,
    },
    CommittedEpoch {
        respond_to: oneshot::Sender<Option<Epoch>>,
    },
}

struct Coordinator<B> {
    partitions: u16,
    sources: Vec<CommitTracker<B>>,
    /// Partitions that finished each not yet committed epoch.
    reports: BTreeMap<Epoch, HashSet<u16>>,
    next_to_commit: Epoch,
    committed: Option<Epoch>,
    receiver: mpsc::Receiver<ActorMessage>,
}

impl<B> Coordinator<B> {
    async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            self.handle_message(message);
        }
    }

    fn handle_message(&mut self, message: ActorMessage) {
        match message {
            ActorMessage::EpochDone {
                partition,
                epoch,
                respond_to,
            } => {
                let result = self.handle_epoch_done(partition, epoch);
                let _ = respond_to.send(result);
            }
            ActorMessage::CommittedEpoch { respond_to } => {
                let _ = respond_to.send(self.committed);
            }
        }
    }

    fn handle_epoch_done(&mut self, partition: u16, epoch: Epoch) -> Result<()> {
        if partition >= self.partitions {
            return Err(Error::Invariant(format!(
                "epoch report from partition {partition}, only {} partitions exist",
                self.partitions
            )));
        }
        if epoch < self.next_to_commit {
            debug!(partition, %epoch, "report for an already committed epoch");
            return Ok(());
        }
        self.reports.entry(epoch).or_default().insert(partition);

        // epochs commit strictly in order
        while self
            .reports
            .get(&self.next_to_commit)
            .is_some_and(|done| done.len() == self.partitions as usize)
        {
            let epoch = self.next_to_commit;
            let offset = Offset::try_from(epoch)?;
            for source in &self.sources {
                source.commit(offset).inspect_err(|e| {
                    error!(?e, source = %source.source(), %epoch, "Failed to commit epoch");
                })?;
            }
            self.reports.remove(&epoch);
            self.next_to_commit = epoch.next();
            self.committed = Some(epoch);
            debug!(%epoch, sources = self.sources.len(), "Epoch committed");
        }
        Ok(())
    }
}

/// Handle to the coordinator actor, cheap to clone.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<ActorMessage>,
}

impl CoordinatorHandle {
    /// Spawns the coordinator for `partitions` consumers, committing on every tracker in `sources`.
    /// The first epoch to commit is `start_epoch`.
    pub fn new<B>(partitions: u16, sources: Vec<CommitTracker<B>>, start_epoch: Epoch) -> Self
    where
        B: Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(CHANNEL_SIZE);
        let coordinator = Coordinator {
            partitions,
            sources,
            reports: BTreeMap::new(),
            next_to_commit: start_epoch,
            committed: None,
            receiver,
        };
        tokio::spawn(coordinator.run());
        Self { sender }
    }

    /// Reports that `partition` consumed every row of `epoch`. Resolves after any commit this report
    /// triggered went through.
    pub async fn epoch_done(&self, partition: u16, epoch: Epoch) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(ActorMessage::EpochDone {
                partition,
                epoch,
                respond_to,
            })
            .await
            .map_err(|e| Error::Task(format!("coordinator stopped: {e}")))?;
        response
            .await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }

    /// Newest committed epoch, `None` before the first commit.
    pub async fn committed_epoch(&self) -> Result<Option<Epoch>> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(ActorMessage::CommittedEpoch { respond_to })
            .await
            .map_err(|e| Error::Task(format!("coordinator stopped: {e}")))?;
        response
            .await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::message::WriterId;

    fn sources(n: u16, epochs: u32) -> Vec<CommitTracker<u32>> {
        (0..n)
            .map(|s| {
                let tracker = CommitTracker::new(WriterId(s));
                for e in 0..epochs {
                    tracker.append(e);
                }
                tracker
            })
            .collect()
    }

    #[tokio::test]
    async fn test_commits_once_all_partitions_reported() {
        let sources = sources(2, 3);
        let coordinator = CoordinatorHandle::new(2, sources.clone(), Epoch(0));

        coordinator.epoch_done(0, Epoch(0)).await.unwrap();
        assert_eq!(coordinator.committed_epoch().await.unwrap(), None);
        assert!(sources.iter().all(|s| s.retained() == 3));

        coordinator.epoch_done(1, Epoch(0)).await.unwrap();
        assert_eq!(coordinator.committed_epoch().await.unwrap(), Some(Epoch(0)));
        for source in &sources {
            assert_eq!(source.last_committed(), Offset::new(0));
            assert_eq!(source.retained(), 2);
        }
    }

    #[tokio::test]
    async fn test_commits_in_epoch_order() {
        let sources = sources(1, 3);
        let coordinator = CoordinatorHandle::new(2, sources.clone(), Epoch(0));

        // partition 1 is ahead, epoch 1 is complete before epoch 0
        coordinator.epoch_done(0, Epoch(0)).await.unwrap();
        coordinator.epoch_done(0, Epoch(1)).await.unwrap();
        coordinator.epoch_done(1, Epoch(1)).await.unwrap();
        assert_eq!(coordinator.committed_epoch().await.unwrap(), None);

        coordinator.epoch_done(1, Epoch(0)).await.unwrap();
        assert_eq!(coordinator.committed_epoch().await.unwrap(), Some(Epoch(1)));
        assert_eq!(sources[0].last_committed(), Offset::new(1));
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_reports() {
        let sources = sources(1, 2);
        let coordinator = CoordinatorHandle::new(1, sources.clone(), Epoch(0));

        coordinator.epoch_done(0, Epoch(0)).await.unwrap();
        coordinator.epoch_done(0, Epoch(0)).await.unwrap();
        assert_eq!(sources[0].last_committed(), Offset::new(0));

        let err = coordinator.epoch_done(3, Epoch(1)).await.unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[tokio::test]
    async fn test_commit_failure_is_surfaced() {
        // the source log was committed ahead of the coordinator
        let sources = sources(1, 4);
        sources[0].commit(Offset::new(2)).unwrap();
        let coordinator = CoordinatorHandle::new(1, sources.clone(), Epoch(0));

        let err = coordinator.epoch_done(0, Epoch(0)).await.unwrap_err();
        assert_eq!(
            err,
            Error::OutOfOrderCommit {
                requested: Offset::new(0),
                last_committed: Offset::new(2),
            }
        );
        assert_eq!(sources[0].last_committed(), Offset::new(2));
        assert_eq!(coordinator.committed_epoch().await.unwrap(), None);
    }
}
