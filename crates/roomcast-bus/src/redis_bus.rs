//! Redis Pub/Sub bus with automatic resubscription.
//!
//! Publishing goes through one shared `ConnectionManager`, which reconnects
//! on its own and is safe to clone into concurrent publishers. Each
//! subscription owns a dedicated Pub/Sub connection; when that connection
//! drops, the subscription task reconnects with exponential backoff until it
//! is stopped.

use crate::backoff::BackoffConfig;
use crate::traits::{Bus, BusError, PayloadHandler, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, Msg};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Redis-backed bus for inter-process messaging.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
    backoff: BackoffConfig,
}

impl RedisBus {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1/`).
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str, backoff: BackoffConfig) -> Result<Self, BusError> {
        let client = Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        info!("Connected to Redis bus");

        Ok(Self {
            client,
            publisher,
            backoff,
        })
    }
}

/// Open a Pub/Sub connection and subscribe it to `channel`.
async fn open_stream(client: &Client, channel: &str) -> Result<BoxStream<'static, Msg>, BusError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub.into_on_message().boxed())
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 =
            redis::AsyncCommands::publish(&mut conn, channel, payload.as_ref()).await?;
        debug!(channel = %channel, receivers, "Published");
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: PayloadHandler,
    ) -> Result<Subscription, BusError> {
        // Established before returning so no publish after this is missed.
        let mut stream = open_stream(&self.client, channel).await?;

        let client = self.client.clone();
        let backoff = self.backoff.clone();
        let topic = channel.to_string();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            debug!(channel = %topic, "Redis subscription stopped");
                            return;
                        }
                        msg = stream.next() => match msg {
                            Some(msg) => match msg.get_payload::<Vec<u8>>() {
                                Ok(payload) => handler(Bytes::from(payload)).await,
                                Err(e) => error!(channel = %topic, error = %e, "Redis payload decode error"),
                            },
                            None => break,
                        },
                    }
                }

                warn!(channel = %topic, "Redis subscription dropped, resubscribing");

                let mut failures: u32 = 0;
                stream = loop {
                    if backoff.exhausted(failures) {
                        error!(channel = %topic, failures, "Redis resubscribe retries exhausted, giving up");
                        return;
                    }

                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(backoff.delay(failures)) => {}
                    }

                    match open_stream(&client, &topic).await {
                        Ok(stream) => {
                            info!(channel = %topic, "Redis subscription restored");
                            break stream;
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(channel = %topic, error = %e, failures, "Redis resubscribe failed");
                        }
                    }
                };
            }
        });

        Ok(Subscription::new(channel, handle, cancel))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
