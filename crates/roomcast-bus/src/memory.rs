//! In-process bus backed by Tokio `broadcast` channels.
//!
//! Clones share the same channel table, so several bridges in one process
//! (or one test) behave like separate gateways on a common bus.

use crate::traits::{Bus, BusError, PayloadHandler, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Default per-channel buffer.
const DEFAULT_CAPACITY: usize = 1024;

/// In-memory bus.
#[derive(Clone)]
pub struct MemoryBus {
    channels: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl MemoryBus {
    /// Create a bus with the default per-channel buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus retaining up to `capacity` undelivered payloads per channel.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of live subscriptions on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        // Publishing to a channel nobody listens on is not an error.
        if let Ok(count) = self.sender(channel).send(payload) {
            trace!(channel = %channel, receivers = count, "Published");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: PayloadHandler,
    ) -> Result<Subscription, BusError> {
        let mut rx = self.sender(channel).subscribe();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let name = channel.to_string();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    res = rx.recv() => match res {
                        Ok(payload) => handler(payload).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %name, skipped, "Subscription lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(Subscription::new(channel, handle, cancel))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
