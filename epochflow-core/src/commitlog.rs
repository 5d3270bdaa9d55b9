//! Epoch-bounded buffering of produced batches and the commit discipline that decides when they may
//! be discarded.
//!
//! A source appends one batch per epoch and gets back its [Offset]. Batches stay replayable through
//! [tracker::CommitTracker::set_range] until downstream processing durably advanced past them and
//! the batch's offset was committed. Commits only ever move forward.

/// Offset-ordered storage of batches.
pub mod buffer;
/// Commit tracking on top of [buffer::EpochBuffer].
pub mod tracker;
