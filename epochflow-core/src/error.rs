use thiserror::Error;

use crate::message::Offset;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Fatal at construction time, never retried.
    #[error("Config Error - {0}")]
    Config(String),

    /// A commit referenced an offset behind what was already committed. This is a scheduler bug
    /// and must be surfaced.
    #[error("Out of order commit - requested {requested}, last committed {last_committed}")]
    OutOfOrderCommit {
        requested: Offset,
        last_committed: Offset,
    },

    /// A programming-invariant was broken upstream (e.g. an invalid range request).
    #[error("Invariant Violation - {0}")]
    Invariant(String),

    /// Sending to an endpoint failed or timed out.
    #[error("Delivery Error - {0}")]
    Delivery(String),

    /// A row arrived for an epoch the receiver has already closed.
    #[error("Stale Epoch - {0}")]
    StaleEpoch(String),

    /// The owning task was stopped while the operation was in progress.
    #[error("Cancellation Token Cancelled")]
    Cancelled,

    #[error("Serde Error - {0}")]
    Serde(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),

    #[error("Task Error - {0}")]
    Task(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}

impl Error {
    /// Whether the shuffle writer may retry the operation that produced this error. Only transient
    /// transport failures qualify; everything else is either fatal or a protocol violation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Delivery(_))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Error::Task(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::Config("partition count mismatch".to_string()).to_string(),
            "Config Error - partition count mismatch"
        );
        assert_eq!(
            Error::OutOfOrderCommit {
                requested: Offset::new(3),
                last_committed: Offset::new(5),
            }
            .to_string(),
            "Out of order commit - requested 3, last committed 5"
        );
        assert_eq!(Error::Cancelled.to_string(), "Cancellation Token Cancelled");
    }

    #[test]
    fn test_only_delivery_is_retryable() {
        assert!(Error::Delivery("timeout".to_string()).is_retryable());
        assert!(!Error::StaleEpoch("3".to_string()).is_retryable());
        assert!(!Error::Config("bad".to_string()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }
}
