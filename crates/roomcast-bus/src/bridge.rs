//! Couples the local room registry to the shared bus.
//!
//! The bridge keeps exactly one bus subscription per room that has local
//! members. Each room has its own slot lock: a subscription is established
//! before the joining connection is registered, and is torn down only after
//! membership has been re-checked under that room's lock, so a leave racing
//! with a join never strips the new joiner of its feed. The slot table itself
//! is only touched for lookups and inserts, so a slow subscribe or teardown
//! in one room never holds up another.
//!
//! Payloads carry the publishing node's id; the relay drops its own node's
//! payloads because those were already fanned out locally.

use crate::traits::{Bus, BusError, PayloadHandler, Subscription};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::FutureExt;
use roomcast_core::{Broadcaster, Connection, ConnectionId, RegistryError, RoomRegistry};
use roomcast_protocol::codec::{decode_envelope, encode_envelope, encode_event};
use roomcast_protocol::{channel_for_room, BusEnvelope, ProtocolError, ServerEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, trace, warn};

/// Default bound on establishing a subscription.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Registry rejected the join.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Bus operation failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Event could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Subscribing took longer than the configured bound.
    #[error("Timed out subscribing to {0}")]
    Timeout(String),
}

/// A room's subscription, guarded by the room's own lock.
type Slot = Arc<Mutex<Option<Subscription>>>;

/// Per-room subscription lifecycle and publish path.
pub struct BusBridge {
    node_id: String,
    bus: Arc<dyn Bus>,
    broadcaster: Arc<Broadcaster>,
    slots: DashMap<String, Slot>,
    active: AtomicUsize,
    subscribe_timeout: Duration,
    this: Weak<BusBridge>,
}

impl BusBridge {
    /// Create a bridge for the gateway process `node_id`.
    pub fn new(
        node_id: impl Into<String>,
        bus: Arc<dyn Bus>,
        broadcaster: Arc<Broadcaster>,
        subscribe_timeout: Duration,
    ) -> Arc<Self> {
        let node_id = node_id.into();
        Arc::new_cyclic(|this| Self {
            node_id,
            bus,
            broadcaster,
            slots: DashMap::new(),
            active: AtomicUsize::new(0),
            subscribe_timeout,
            this: this.clone(),
        })
    }

    /// Id stamped on every payload this bridge publishes.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The registry behind the broadcaster.
    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        self.broadcaster.registry()
    }

    /// The broadcaster used for relayed payloads.
    #[must_use]
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Backend name of the underlying bus.
    #[must_use]
    pub fn bus_name(&self) -> &'static str {
        self.bus.name()
    }

    /// Register `connection` in its room, subscribing the room first if needed.
    ///
    /// Returns the room's member count after the join. On error the
    /// connection is not registered and no subscription is left behind for
    /// an empty room.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established in time or
    /// the registry rejects the connection.
    pub async fn join(&self, connection: Arc<dyn Connection>) -> Result<usize, BridgeError> {
        let room_id = connection.room_id().to_string();
        let (slot, mut sub) = self.lock_slot(&room_id).await;

        if !sub.as_ref().is_some_and(Subscription::is_active) {
            if let Some(stale) = sub.take() {
                warn!(room = %room_id, "Replacing inactive subscription");
                self.active.fetch_sub(1, Ordering::SeqCst);
                stale.stop().await;
            }
            match self.subscribe_room(&room_id).await {
                Ok(fresh) => {
                    *sub = Some(fresh);
                    self.active.fetch_add(1, Ordering::SeqCst);
                    info!(room = %room_id, bus = self.bus.name(), "Room subscribed");
                }
                Err(e) => {
                    if self.registry().member_count(&room_id) == 0 {
                        self.discard_slot(&room_id, &slot);
                    }
                    return Err(e);
                }
            }
        }

        match self.registry().join(&room_id, connection) {
            Ok(count) => Ok(count),
            Err(e) => {
                if self.registry().member_count(&room_id) == 0 {
                    if let Some(unused) = sub.take() {
                        self.active.fetch_sub(1, Ordering::SeqCst);
                        unused.stop().await;
                    }
                    self.discard_slot(&room_id, &slot);
                }
                Err(e.into())
            }
        }
    }

    /// Remove a connection and release the room's subscription if it emptied.
    ///
    /// Returns `true` if this call removed the connection. Safe to call more
    /// than once for the same connection.
    pub async fn leave(&self, room_id: &str, connection_id: &ConnectionId) -> bool {
        let removed = self.registry().leave(room_id, connection_id);
        self.release_if_empty(room_id).await;
        removed
    }

    /// Tear down the subscription of `room_id` if it has no local members.
    ///
    /// Membership is checked while holding the room's lock.
    pub async fn release_if_empty(&self, room_id: &str) {
        let Some(slot) = self.slots.get(room_id).map(|s| s.value().clone()) else {
            return;
        };
        let mut sub = slot.clone().lock_owned().await;
        if !self.is_live(room_id, &slot) || self.registry().member_count(room_id) > 0 {
            return;
        }

        if let Some(sub) = sub.take() {
            self.active.fetch_sub(1, Ordering::SeqCst);
            sub.stop().await;
            info!(room = %room_id, "Room unsubscribed");
        }
        // Joiners queued on this slot see it is gone and start a fresh one.
        self.discard_slot(room_id, &slot);
    }

    /// Publish `event` on the bus channel of `room_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be encoded or the bus rejects it.
    /// The caller decides whether that is fatal; the gateway only logs it.
    pub async fn publish(&self, room_id: &str, event: &ServerEvent) -> Result<(), BridgeError> {
        let envelope = BusEnvelope::new(self.node_id.clone(), event.clone());
        let payload = encode_envelope(&envelope)?;
        self.bus.publish(&channel_for_room(room_id), payload).await?;
        trace!(room = %room_id, "Published to bus");
        Ok(())
    }

    /// Whether `room_id` currently has a subscription.
    ///
    /// A room whose slot is mid-transition counts as subscribed.
    pub async fn is_subscribed(&self, room_id: &str) -> bool {
        self.slots
            .get(room_id)
            .is_some_and(|slot| slot.try_lock().map_or(true, |sub| sub.is_some()))
    }

    /// Number of rooms with a subscription.
    pub async fn subscription_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop every subscription.
    pub async fn shutdown(&self) {
        let slots: Vec<(String, Slot)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut stopped = 0;
        for (room_id, slot) in slots {
            let mut sub = slot.lock().await;
            if let Some(sub) = sub.take() {
                self.active.fetch_sub(1, Ordering::SeqCst);
                sub.stop().await;
                stopped += 1;
            }
            self.discard_slot(&room_id, &slot);
        }
        debug!(subscriptions = stopped, "Bus bridge shut down");
    }

    /// Lock the live slot of `room_id`, creating it if absent.
    async fn lock_slot(&self, room_id: &str) -> (Slot, OwnedMutexGuard<Option<Subscription>>) {
        loop {
            let slot = self.slots.entry(room_id.to_string()).or_default().value().clone();
            let guard = slot.clone().lock_owned().await;
            if self.is_live(room_id, &slot) {
                return (slot, guard);
            }
        }
    }

    fn is_live(&self, room_id: &str, slot: &Slot) -> bool {
        self.slots
            .get(room_id)
            .is_some_and(|live| Arc::ptr_eq(live.value(), slot))
    }

    fn discard_slot(&self, room_id: &str, slot: &Slot) {
        self.slots
            .remove_if(room_id, |_, live| Arc::ptr_eq(live, slot));
    }

    async fn subscribe_room(&self, room_id: &str) -> Result<Subscription, BridgeError> {
        let channel = channel_for_room(room_id);
        let handler = self.relay(room_id);
        match tokio::time::timeout(self.subscribe_timeout, self.bus.subscribe(&channel, handler))
            .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(BridgeError::Timeout(channel)),
        }
    }

    /// Handler delivering bus payloads of `room_id` to local members.
    fn relay(&self, room_id: &str) -> PayloadHandler {
        let room_id: Arc<str> = Arc::from(room_id);
        let node_id: Arc<str> = Arc::from(self.node_id.as_str());
        let broadcaster = self.broadcaster.clone();
        let bridge = self.this.clone();

        Arc::new(move |payload: Bytes| {
            let room_id = room_id.clone();
            let node_id = node_id.clone();
            let broadcaster = broadcaster.clone();
            let bridge = bridge.clone();
            async move {
                let envelope = match decode_envelope(&payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(room = %room_id, error = %e, "Dropping undecodable bus payload");
                        return;
                    }
                };
                if envelope.origin == *node_id {
                    return;
                }
                if envelope.event.room_id().is_some_and(|r| r != &*room_id) {
                    warn!(room = %room_id, "Dropping bus payload for another room");
                    return;
                }
                let text = match encode_event(&envelope.event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(room = %room_id, error = %e, "Failed to encode relayed event");
                        return;
                    }
                };

                let report = broadcaster.broadcast(&room_id, &text, None).await;
                if !report.failed.is_empty() && broadcaster.registry().member_count(&room_id) == 0
                {
                    // The relay runs inside the subscription task, which
                    // release_if_empty awaits; hand the teardown off.
                    if let Some(bridge) = bridge.upgrade() {
                        let room_id = room_id.to_string();
                        tokio::spawn(async move {
                            bridge.release_if_empty(&room_id).await;
                        });
                    }
                }
            }
            .boxed()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBus;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use roomcast_core::ChannelConnection;
    use tokio::sync::mpsc;

    fn bridge_on(bus: &MemoryBus, node: &str) -> Arc<BusBridge> {
        bridge_with_timeout(bus, node, Duration::from_millis(200))
    }

    fn bridge_with_timeout(bus: &MemoryBus, node: &str, write_timeout: Duration) -> Arc<BusBridge> {
        let registry = Arc::new(RoomRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry, write_timeout));
        BusBridge::new(node, Arc::new(bus.clone()), broadcaster, DEFAULT_SUBSCRIBE_TIMEOUT)
    }

    fn event(room: &str, content: &str) -> ServerEvent {
        ServerEvent::new_message(
            "msg-1",
            room,
            "user-a",
            "alice",
            content,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        )
    }

    async fn recv(rx: &mut mpsc::Receiver<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_first_join_subscribes_once() {
        let bus = MemoryBus::new();
        let bridge = bridge_on(&bus, "node-a");
        let (a, _rx_a) = ChannelConnection::new("R1", "user-a", 8);
        let (b, _rx_b) = ChannelConnection::new("R1", "user-b", 8);

        assert_eq!(bridge.join(a).await.unwrap(), 1);
        assert_eq!(bridge.join(b).await.unwrap(), 2);

        assert!(bridge.is_subscribed("R1").await);
        assert_eq!(bridge.subscription_count().await, 1);
        assert_eq!(bus.subscriber_count(&channel_for_room("R1")), 1);
    }

    #[tokio::test]
    async fn test_last_leave_tears_down() {
        let bus = MemoryBus::new();
        let bridge = bridge_on(&bus, "node-a");
        let (a, _rx_a) = ChannelConnection::new("R1", "user-a", 8);
        let (b, _rx_b) = ChannelConnection::new("R1", "user-b", 8);
        let (a_id, b_id) = (a.id().clone(), b.id().clone());

        bridge.join(a).await.unwrap();
        bridge.join(b).await.unwrap();

        assert!(bridge.leave("R1", &a_id).await);
        assert!(bridge.is_subscribed("R1").await);

        assert!(bridge.leave("R1", &b_id).await);
        assert!(!bridge.is_subscribed("R1").await);
        assert_eq!(bus.subscriber_count(&channel_for_room("R1")), 0);

        // Second leave is a no-op.
        assert!(!bridge.leave("R1", &b_id).await);
        assert_eq!(bridge.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejoin_after_teardown_resubscribes() {
        let bus = MemoryBus::new();
        let bridge = bridge_on(&bus, "node-a");
        let (a, _rx_a) = ChannelConnection::new("R1", "user-a", 8);
        let a_id = a.id().clone();

        bridge.join(a).await.unwrap();
        bridge.leave("R1", &a_id).await;

        let (b, _rx_b) = ChannelConnection::new("R1", "user-b", 8);
        bridge.join(b).await.unwrap();
        assert!(bridge.is_subscribed("R1").await);
        assert_eq!(bus.subscriber_count(&channel_for_room("R1")), 1);
    }

    #[tokio::test]
    async fn test_double_join_is_rejected() {
        let bus = MemoryBus::new();
        let bridge = bridge_on(&bus, "node-a");
        let (a, _rx_a) = ChannelConnection::new("R1", "user-a", 8);

        bridge.join(a.clone()).await.unwrap();
        let err = bridge.join(a).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Registry(RegistryError::AlreadyJoined { .. })
        ));
        assert_eq!(bridge.registry().member_count("R1"), 1);
        assert!(bridge.is_subscribed("R1").await);
    }

    #[tokio::test]
    async fn test_cross_node_delivery_without_echo() {
        let bus = MemoryBus::new();
        let node_a = bridge_on(&bus, "node-a");
        let node_b = bridge_on(&bus, "node-b");

        let (a, mut rx_a) = ChannelConnection::new("R1", "user-a", 8);
        let (b, mut rx_b) = ChannelConnection::new("R1", "user-b", 8);
        node_a.join(a).await.unwrap();
        node_b.join(b).await.unwrap();

        node_a.publish("R1", &event("R1", "hi")).await.unwrap();

        let frame = recv(&mut rx_b).await.unwrap();
        assert!(frame.contains("\"content\":\"hi\""));
        assert!(recv(&mut rx_b).await.is_none());

        // node-a skips its own payload on the relay path.
        assert!(recv(&mut rx_a).await.is_none());
    }

    #[tokio::test]
    async fn test_relay_ignores_other_rooms() {
        let bus = MemoryBus::new();
        let node_a = bridge_on(&bus, "node-a");
        let node_b = bridge_on(&bus, "node-b");

        let (b, mut rx_b) = ChannelConnection::new("R1", "user-b", 8);
        node_b.join(b).await.unwrap();

        // Mislabelled event on R1's channel.
        node_a.publish("R1", &event("R9", "stray")).await.unwrap();
        assert!(recv(&mut rx_b).await.is_none());
    }

    #[tokio::test]
    async fn test_relay_failure_releases_empty_room() {
        let bus = MemoryBus::new();
        let node_a = bridge_on(&bus, "node-a");
        let node_b = bridge_on(&bus, "node-b");

        let (b, rx_b) = ChannelConnection::new("R1", "user-b", 8);
        node_b.join(b).await.unwrap();
        drop(rx_b);

        node_a.publish("R1", &event("R1", "hi")).await.unwrap();

        let released = async {
            while node_b.is_subscribed("R1").await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(1), released)
            .await
            .unwrap();
        assert_eq!(node_b.registry().member_count("R1"), 0);
    }

    #[tokio::test]
    async fn test_slow_teardown_does_not_block_other_rooms() {
        let bus = MemoryBus::new();
        let node_a = bridge_on(&bus, "node-a");
        let node_b = bridge_with_timeout(&bus, "node-b", Duration::from_secs(2));

        // A member whose queue is full stalls R1's relay until the write times out.
        let (stuck, _rx_stuck) = ChannelConnection::new("R1", "user-b", 1);
        stuck.send_text("backlog").await.unwrap();
        let stuck_id = stuck.id().clone();
        node_b.join(stuck).await.unwrap();

        node_a.publish("R1", &event("R1", "hi")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Tearing R1 down waits on the stalled relay.
        let leaving = {
            let node_b = node_b.clone();
            tokio::spawn(async move { node_b.leave("R1", &stuck_id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (other, _rx_other) = ChannelConnection::new("R2", "user-c", 8);
        let started = tokio::time::Instant::now();
        node_b.join(other).await.unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "join into R2 waited on R1 teardown"
        );
        assert!(node_b.is_subscribed("R2").await);

        assert!(leaving.await.unwrap());
        assert!(!node_b.is_subscribed("R1").await);
        assert_eq!(node_b.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_joins_share_one_subscription() {
        let bus = MemoryBus::new();
        let bridge = bridge_on(&bus, "node-a");

        let joins = (0..8).map(|i| {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                let (conn, rx) = ChannelConnection::new("R1", format!("user-{i}"), 8);
                bridge.join(conn).await.unwrap();
                rx
            })
        });
        let _receivers = futures_util::future::join_all(joins).await;

        assert_eq!(bridge.registry().member_count("R1"), 8);
        assert_eq!(bridge.subscription_count().await, 1);
        assert_eq!(bus.subscriber_count(&channel_for_room("R1")), 1);
    }

    struct FailingBus;

    #[async_trait]
    impl Bus for FailingBus {
        async fn publish(&self, _channel: &str, _payload: Bytes) -> Result<(), BusError> {
            Err(BusError::Backend("unreachable".into()))
        }

        async fn subscribe(
            &self,
            _channel: &str,
            _handler: PayloadHandler,
        ) -> Result<Subscription, BusError> {
            Err(BusError::Backend("unreachable".into()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_registry_untouched() {
        let registry = Arc::new(RoomRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry.clone(), Duration::from_millis(200)));
        let bridge = BusBridge::new(
            "node-a",
            Arc::new(FailingBus),
            broadcaster,
            DEFAULT_SUBSCRIBE_TIMEOUT,
        );
        let (a, _rx_a) = ChannelConnection::new("R1", "user-a", 8);

        assert!(matches!(bridge.join(a).await, Err(BridgeError::Bus(_))));
        assert!(!registry.room_exists("R1"));
        assert_eq!(bridge.subscription_count().await, 0);

        assert!(bridge.publish("R1", &event("R1", "hi")).await.is_err());
    }
}
