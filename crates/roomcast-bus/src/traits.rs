//! Bus abstraction traits for roomcast.
//!
//! A bus moves opaque payloads between gateway processes on named channels.
//! Per-channel ordering is whatever the backend provides; nothing here adds
//! or removes ordering guarantees.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Callback invoked for every payload received on a subscription.
pub type PayloadHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus is shut down or the subscription was closed.
    #[error("Bus closed")]
    Closed,

    /// Backend failure.
    #[error("Bus backend error: {0}")]
    Backend(String),

    /// Redis failure.
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// A publish/subscribe transport shared by gateway processes.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload on `channel`.
    ///
    /// Safe to call concurrently from many tasks.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to `channel`, invoking `handler` for each payload.
    ///
    /// Returns once the subscription is established: anything published on
    /// the channel after this returns reaches the handler.
    async fn subscribe(
        &self,
        channel: &str,
        handler: PayloadHandler,
    ) -> Result<Subscription, BusError>;

    /// Backend name (e.g., "memory", "redis").
    fn name(&self) -> &'static str;
}

/// A handle to a running subscription task.
///
/// The task is owned by the handle. Dropping the handle cancels the task;
/// [`stop`](Subscription::stop) also waits for it to finish.
pub struct Subscription {
    channel: String,
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Wrap a spawned subscription task and its cancellation token.
    #[must_use]
    pub fn new(channel: impl Into<String>, handle: JoinHandle<()>, cancel: CancellationToken) -> Self {
        Self {
            channel: channel.into(),
            handle: Some(handle),
            cancel,
        }
    }

    /// Channel this subscription listens on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Cancel the task and wait until it exits.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Whether the task is still running and not cancelled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("active", &self.is_active())
            .finish()
    }
}
