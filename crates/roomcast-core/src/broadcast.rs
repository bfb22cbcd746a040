//! Fan-out of one payload to every local connection of a room.
//!
//! Delivery works on a registry snapshot: every member present when the call
//! starts gets exactly one write attempt, writes run concurrently, and each
//! is bounded by the write timeout. Failed members are closed and removed
//! after all attempts have finished.

use crate::connection::{Connection, ConnectionId, SendError};
use crate::registry::RoomRegistry;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Default bound on a single write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one broadcast call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Number of connections a write was attempted on.
    pub attempted: usize,
    /// Number of successful writes.
    pub delivered: usize,
    /// Connections that failed and were removed.
    pub failed: Vec<ConnectionId>,
}

/// Delivers payloads to the local members of a room.
pub struct Broadcaster {
    registry: Arc<RoomRegistry>,
    write_timeout: Duration,
}

impl Broadcaster {
    /// Create a broadcaster over `registry`.
    #[must_use]
    pub fn new(registry: Arc<RoomRegistry>, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
        }
    }

    /// The registry this broadcaster reads from.
    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Write `payload` to every member of `room_id` except `skip`.
    ///
    /// A failing member never interrupts delivery to the others. Members
    /// that joined after the snapshot was taken receive nothing from this
    /// call.
    pub async fn broadcast(
        &self,
        room_id: &str,
        payload: &str,
        skip: Option<&ConnectionId>,
    ) -> BroadcastReport {
        let targets: Vec<Arc<dyn Connection>> = self
            .registry
            .snapshot(room_id)
            .into_iter()
            .filter(|conn| Some(conn.id()) != skip)
            .collect();

        let attempts = targets.iter().map(|conn| async move {
            let result = match tokio::time::timeout(self.write_timeout, conn.send_text(payload)).await
            {
                Ok(result) => result,
                Err(_) => Err(SendError::Timeout),
            };
            (conn, result)
        });
        let results = join_all(attempts).await;

        let mut report = BroadcastReport {
            attempted: targets.len(),
            ..BroadcastReport::default()
        };
        let mut failed = Vec::new();

        for (conn, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(room = %room_id, connection = %conn.id(), error = %e, "Broadcast write failed");
                    failed.push(conn.clone());
                }
            }
        }

        for conn in failed {
            conn.close().await;
            self.registry.leave(room_id, conn.id());
            report.failed.push(conn.id().clone());
        }

        trace!(
            room = %room_id,
            attempted = report.attempted,
            delivered = report.delivered,
            "Broadcast complete"
        );
        report
    }
}
