//! Commit tracking for one source. All operations on a source's buffer are serialized under a single
//! lock; they are short and never await, so a blocking mutex is enough.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::Result;
use crate::commitlog::buffer::EpochBuffer;
use crate::error::Error;
use crate::message::{Offset, WriterId};
use crate::metrics::{metrics, writer_labels};

/// Cloneable handle to the commit log of one source. Clones share the same buffer.
#[derive(Debug)]
pub struct CommitTracker<B> {
    source: WriterId,
    buffer: Arc<Mutex<EpochBuffer<B>>>,
}

impl<B> Clone for CommitTracker<B> {
    fn clone(&self) -> Self {
        Self {
            source: self.source,
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl<B> CommitTracker<B> {
    pub fn new(source: WriterId) -> Self {
        Self {
            source,
            buffer: Arc::new(Mutex::new(EpochBuffer::new())),
        }
    }

    pub fn source(&self) -> WriterId {
        self.source
    }

    /// Buffers the batch and returns its offset.
    pub fn append(&self, batch: B) -> Offset {
        let mut buffer = self.buffer.lock();
        let offset = buffer.append(batch);
        self.record_retained(buffer.len());
        offset
    }

    /// Marks everything up to and including `target` as durably processed and discards those
    /// batches. Committing the current watermark again is a no-op. Moving the watermark backwards
    /// fails with [Error::OutOfOrderCommit] and leaves the log untouched. A target past the newest
    /// batch discards everything retained, and later appends are numbered after it.
    pub fn commit(&self, target: Offset) -> Result<()> {
        let mut buffer = self.buffer.lock();
        let last_committed = buffer.last_committed();

        if target < last_committed {
            error!(
                source = %self.source,
                requested = %target,
                %last_committed,
                "Out of order commit"
            );
            return Err(Error::OutOfOrderCommit {
                requested: target,
                last_committed,
            });
        }
        if target == last_committed {
            return Ok(());
        }

        let trimmed = buffer.trim_through(target);
        buffer.set_last_committed(target);
        self.record_retained(buffer.len());
        drop(buffer);

        let labels = writer_labels(self.source.0);
        metrics().commit.commits_total.get_or_create(&labels).inc();
        metrics()
            .commit
            .trimmed_batches_total
            .get_or_create(&labels)
            .inc_by(trimmed as u64);
        debug!(source = %self.source, offset = %target, trimmed, "committed");
        Ok(())
    }

    /// Batches covering `(start, end]`, for replay. The range must lie within what is still
    /// retained: `start` may not be behind the committed offset (already discarded) and `end` may
    /// not be past the newest appended offset (not produced yet).
    pub fn set_range(&self, start: Offset, end: Offset) -> Result<Vec<(Offset, B)>>
    where
        B: Clone,
    {
        if start > end {
            return Err(Error::Invariant(format!(
                "invalid range ({start}, {end}] for source {}",
                self.source
            )));
        }

        let buffer = self.buffer.lock();
        if start < buffer.last_committed() {
            return Err(Error::Invariant(format!(
                "range ({start}, {end}] for source {} starts behind committed offset {}",
                self.source,
                buffer.last_committed()
            )));
        }
        if end > buffer.latest_offset() {
            return Err(Error::Invariant(format!(
                "range ({start}, {end}] for source {} ends past newest offset {}",
                self.source,
                buffer.latest_offset()
            )));
        }

        Ok(buffer.range(start, end).cloned().collect())
    }

    pub fn last_committed(&self) -> Offset {
        self.buffer.lock().last_committed()
    }

    pub fn latest_offset(&self) -> Offset {
        self.buffer.lock().latest_offset()
    }

    /// Number of batches not yet committed.
    pub fn retained(&self) -> usize {
        self.buffer.lock().len()
    }

    fn record_retained(&self, retained: usize) {
        metrics()
            .commit
            .retained_batches
            .get_or_create(&writer_labels(self.source.0))
            .set(retained as i64);
    }
}
