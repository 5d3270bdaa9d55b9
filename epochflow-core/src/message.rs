use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An opaque, immutable, already-encoded record. It has no identity beyond its content and is safe
/// to resend. It is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Row {
    pub payload: Bytes,
}

impl Row {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<&'static str> for Row {
    fn from(value: &'static str) -> Self {
        Row::new(Bytes::from_static(value.as_bytes()))
    }
}

/// Identifies a logical upstream writer (source partition). A retried task attempt reuses the
/// WriterId of the attempt it supersedes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriterId(pub u16);

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discrete, monotonically increasing progress unit, driven externally.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Watermark meaning "all data up to and including this value has been produced/consumed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Offset(pub i64);

impl Offset {
    /// Sentinel for "nothing committed yet".
    pub const UNCOMMITTED: Offset = Offset(-1);

    pub fn new(offset: i64) -> Self {
        Offset(offset)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

/// Epochs are buffered at the offset with the same number. Epochs past `i64::MAX` have no offset.
impl TryFrom<Epoch> for Offset {
    type Error = crate::Error;

    fn try_from(epoch: Epoch) -> crate::Result<Self> {
        i64::try_from(epoch.0)
            .map(Offset)
            .map_err(|_| crate::Error::Invariant(format!("epoch {epoch} has no commit offset")))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two message kinds a shuffle writer sends to a receiver endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ShuffleMessage {
    /// A data row produced by `writer_id` during `epoch`.
    Row {
        writer_id: WriterId,
        epoch: Epoch,
        row: Row,
    },
    /// `writer_id` has no further rows for `epoch` (and for any earlier epoch) on this receiver.
    EpochMarker { writer_id: WriterId, epoch: Epoch },
}

impl ShuffleMessage {
    pub fn writer_id(&self) -> WriterId {
        match self {
            ShuffleMessage::Row { writer_id, .. } => *writer_id,
            ShuffleMessage::EpochMarker { writer_id, .. } => *writer_id,
        }
    }

    pub fn epoch(&self) -> Epoch {
        match self {
            ShuffleMessage::Row { epoch, .. } => *epoch,
            ShuffleMessage::EpochMarker { epoch, .. } => *epoch,
        }
    }
}

/// What the local consumer of a receiver endpoint pulls.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Row { writer_id: WriterId, row: Row },
    /// Every known writer has closed this epoch and all of its rows were handed out.
    EpochEnd(Epoch),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_ordering_and_sentinel() {
        assert!(Offset::UNCOMMITTED < Offset::new(0));
        assert_eq!(Offset::try_from(Epoch(7)).unwrap(), Offset::new(7));
        assert_eq!(
            Offset::try_from(Epoch(i64::MAX as u64)).unwrap(),
            Offset::new(i64::MAX)
        );
        assert!(matches!(
            Offset::try_from(Epoch(u64::MAX)),
            Err(crate::Error::Invariant(_))
        ));
        assert_eq!(Offset::new(-1).to_string(), "-1");
    }

    #[test]
    fn test_shuffle_message_accessors() {
        let row = ShuffleMessage::Row {
            writer_id: WriterId(2),
            epoch: Epoch(4),
            row: Row::from("a"),
        };
        assert_eq!(row.writer_id(), WriterId(2));
        assert_eq!(row.epoch(), Epoch(4));

        let marker = ShuffleMessage::EpochMarker {
            writer_id: WriterId(1),
            epoch: Epoch(9),
        };
        assert_eq!(marker.writer_id(), WriterId(1));
        assert_eq!(marker.epoch(), Epoch(9));
        assert_eq!(marker.epoch().next(), Epoch(10));
    }
}
