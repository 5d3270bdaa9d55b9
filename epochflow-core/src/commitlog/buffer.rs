use std::collections::VecDeque;

use crate::message::Offset;

/// Batches in offset order, each tagged with the sequential offset it was appended at. The buffer
/// itself enforces nothing beyond ordering, the commit rules live in the tracker.
#[derive(Debug)]
pub struct EpochBuffer<B> {
    batches: VecDeque<(Offset, B)>,
    latest: Offset,
    last_committed: Offset,
}

impl<B> Default for EpochBuffer<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> EpochBuffer<B> {
    pub fn new() -> Self {
        Self {
            batches: VecDeque::new(),
            latest: Offset::UNCOMMITTED,
            last_committed: Offset::UNCOMMITTED,
        }
    }

    /// Appends the batch and returns the offset it was assigned. The first offset is 0; offsets
    /// saturate at `i64::MAX`.
    pub fn append(&mut self, batch: B) -> Offset {
        let offset = Offset::new(self.latest.value().saturating_add(1));
        self.latest = offset;
        self.batches.push_back((offset, batch));
        offset
    }

    /// Drops every batch with an offset `<= offset` and returns how many were dropped.
    pub fn trim_through(&mut self, offset: Offset) -> usize {
        let mut trimmed = 0;
        while self.batches.front().is_some_and(|(o, _)| *o <= offset) {
            self.batches.pop_front();
            trimmed += 1;
        }
        trimmed
    }

    /// Batches with offsets in `(start, end]`, oldest first.
    pub fn range(&self, start: Offset, end: Offset) -> impl Iterator<Item = &(Offset, B)> {
        self.batches
            .iter()
            .skip_while(move |(o, _)| *o <= start)
            .take_while(move |(o, _)| *o <= end)
    }

    pub fn last_committed(&self) -> Offset {
        self.last_committed
    }

    /// Moves the committed watermark. Offsets handed out later are always past it, even when the
    /// watermark is ahead of everything appended so far.
    pub(crate) fn set_last_committed(&mut self, offset: Offset) {
        self.last_committed = offset;
        self.latest = self.latest.max(offset);
    }

    /// Offset of the newest appended batch, [Offset::UNCOMMITTED] if nothing was appended yet.
    pub fn latest_offset(&self) -> Offset {
        self.latest
    }

    /// Number of batches still held.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}
