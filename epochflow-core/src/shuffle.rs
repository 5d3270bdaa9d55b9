//! Epoch-synchronized shuffle between upstream writer tasks and per-partition receiver endpoints.
//!
//! A [writer::ShuffleWriter] routes every row of an epoch to the [Endpoint] owning the row's
//! partition, one acknowledged send at a time, and then tells every endpoint that the epoch is over
//! for it. A [receiver::ReceiverEndpoint] collects rows and epoch markers from all writers and hands
//! them to its local consumer, reporting the end of an epoch only after every known writer closed it.
//!
//! ```text
//!  writer 0 ──┬── Row / EpochMarker ──▶ receiver 0 ──▶ consumer 0
//!             └── Row / EpochMarker ──▶ receiver 1 ──▶ consumer 1
//!  writer 1 ──┬── Row / EpochMarker ──▶ receiver 0
//!             └── Row / EpochMarker ──▶ receiver 1
//! ```

use crate::message::ShuffleMessage;

/// Receiver side of the shuffle.
pub mod receiver;
/// Writer side of the shuffle.
pub mod writer;

#[cfg(test)]
pub(crate) mod test_utils;

/// An addressable endpoint with an ordered, acknowledged send. Resolving `send` means the
/// receiver accepted the message; an error means it did not and the message may be resent.
#[trait_variant::make(Endpoint: Send)]
pub trait LocalEndpoint {
    /// Deliver the message and wait for the acknowledgment.
    async fn send(&self, message: ShuffleMessage) -> crate::Result<()>;

    /// Address of the endpoint, used for logging.
    fn address(&self) -> &str;
}
