//! WebSocket-backed [`Connection`].
//!
//! The write half of an upgraded socket lives behind an async mutex so the
//! broadcaster, the keepalive duty and history replay can share it. The read
//! half stays with the connection's read loop.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt};
use roomcast_core::{Connection, ConnectionId, SendError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Normal closure status code.
const CLOSE_NORMAL: u16 = 1000;

/// One upgraded WebSocket stream.
///
/// Generic over the write half so the keepalive and close paths can run
/// against any message sink.
pub struct WsConnection<S = SplitSink<WebSocket, Message>> {
    id: ConnectionId,
    room_id: String,
    user_id: String,
    sink: Mutex<S>,
    open: AtomicBool,
    /// Set once the close handshake has been attempted.
    closed: AtomicBool,
    cancel: CancellationToken,
    write_timeout: Duration,
    started: Instant,
    /// Milliseconds after `started` at which the peer was last heard from.
    last_seen_ms: AtomicU64,
}

impl<S> WsConnection<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    /// Wrap the write half of an upgraded socket.
    ///
    /// `cancel` is signalled when the connection closes; pass a child of the
    /// server-wide token so shutdown reaches every connection.
    #[must_use]
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        sink: S,
        cancel: CancellationToken,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id: ConnectionId::generate(),
            room_id: room_id.into(),
            user_id: user_id.into(),
            sink: Mutex::new(sink),
            open: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            cancel,
            write_timeout,
            started: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    /// Token cancelled when this connection closes or the server shuts down.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record inbound traffic from the peer.
    pub fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis();
        self.last_seen_ms
            .store(u64::try_from(elapsed).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Time since the peer was last heard from.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last_seen = self.started + Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        Instant::now().saturating_duration_since(last_seen)
    }

    /// Send a protocol-level ping.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed or the write does not complete
    /// within the write timeout.
    pub async fn ping(&self) -> Result<(), SendError> {
        match tokio::time::timeout(self.write_timeout, self.write(Message::Ping(Vec::new()))).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout),
        }
    }

    async fn write(&self, message: Message) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(message).await {
            self.open.store(false, Ordering::SeqCst);
            self.cancel.cancel();
            return Err(SendError::Failed(e.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<S> Connection for WsConnection<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn room_id(&self) -> &str {
        &self.room_id
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn send_text(&self, payload: &str) -> Result<(), SendError> {
        self.write(Message::Text(payload.to_string())).await
    }

    async fn close(&self) {
        // A failed write already marked the connection closed; the transport
        // still needs its close frame.
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        // Unblocks the read loop and the keepalive duty.
        self.cancel.cancel();

        let goodbye = async {
            let mut sink = self.sink.lock().await;
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_NORMAL,
                    reason: "".into(),
                })))
                .await;
            let _ = sink.close().await;
        };
        if tokio::time::timeout(self.write_timeout, goodbye).await.is_err() {
            debug!(connection = %self.id, "Close handshake timed out");
        }
        debug!(connection = %self.id, room = %self.room_id, "Connection closed");
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl<S> fmt::Debug for WsConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("user_id", &self.user_id)
            .field("open", &self.open.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
