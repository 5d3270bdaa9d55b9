//! Endpoints for exercising the shuffle writer without receivers: one that records what it was sent
//! and one that fails or stalls on demand.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::Result;
use crate::error::Error;
use crate::message::ShuffleMessage;
use crate::shuffle::Endpoint;

/// Acknowledges everything and keeps the messages in arrival order.
#[derive(Debug, Clone)]
pub(crate) struct RecordingEndpoint {
    address: String,
    messages: Arc<Mutex<Vec<ShuffleMessage>>>,
}

impl RecordingEndpoint {
    pub(crate) fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn messages(&self) -> Vec<ShuffleMessage> {
        self.messages.lock().clone()
    }
}

impl Endpoint for RecordingEndpoint {
    async fn send(&self, message: ShuffleMessage) -> Result<()> {
        self.messages.lock().push(message);
        Ok(())
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// Controls the failures a [FaultyEndpoint] injects.
#[derive(Debug, Default)]
pub(crate) struct FaultInjector {
    /// Fail the next N sends.
    fail_next_sends: AtomicUsize,
    /// Artificial send latency in milliseconds.
    send_latency_ms: AtomicU64,
    /// Every send, failed or not.
    attempts: AtomicUsize,
}

impl FaultInjector {
    pub(crate) fn fail_sends(&self, count: usize) {
        self.fail_next_sends.store(count, Ordering::Relaxed);
    }

    pub(crate) fn set_latency(&self, latency: Duration) {
        self.send_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    fn should_fail_send(&self) -> bool {
        self.fail_next_sends
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                if c > 0 { Some(c - 1) } else { None }
            })
            .is_ok()
    }

    async fn apply_latency(&self) {
        let ms = self.send_latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// A [RecordingEndpoint] behind a [FaultInjector]. Failed sends are not recorded.
#[derive(Debug, Clone)]
pub(crate) struct FaultyEndpoint {
    inner: RecordingEndpoint,
    injector: Arc<FaultInjector>,
}

impl FaultyEndpoint {
    pub(crate) fn new(address: impl Into<String>) -> Self {
        Self {
            inner: RecordingEndpoint::new(address),
            injector: Arc::new(FaultInjector::default()),
        }
    }

    pub(crate) fn injector(&self) -> &FaultInjector {
        &self.injector
    }

    pub(crate) fn inner(&self) -> &RecordingEndpoint {
        &self.inner
    }
}

impl Endpoint for FaultyEndpoint {
    async fn send(&self, message: ShuffleMessage) -> Result<()> {
        self.injector.attempts.fetch_add(1, Ordering::Relaxed);
        self.injector.apply_latency().await;
        if self.injector.should_fail_send() {
            return Err(Error::Delivery(format!(
                "injected failure on {}",
                self.inner.address
            )));
        }
        self.inner.send(message).await
    }

    fn address(&self) -> &str {
        self.inner.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Epoch, WriterId};

    #[tokio::test]
    async fn test_fault_injector_fails_exactly_n_sends() {
        let endpoint = FaultyEndpoint::new("faulty");
        endpoint.injector().fail_sends(2);
        let marker = ShuffleMessage::EpochMarker {
            writer_id: WriterId(0),
            epoch: Epoch(0),
        };

        assert!(endpoint.send(marker.clone()).await.is_err());
        assert!(endpoint.send(marker.clone()).await.is_err());
        assert!(endpoint.send(marker.clone()).await.is_ok());
        assert_eq!(endpoint.injector().attempts(), 3);
        assert_eq!(endpoint.inner().messages(), vec![marker]);
    }
}
