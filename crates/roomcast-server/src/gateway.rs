//! Connection gateway.
//!
//! This module handles the connection lifecycle and message processing:
//! handshake authorization, upgrade, room join, the per-connection read loop
//! and keepalive duty, and teardown.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::socket::WsConnection;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::stream::SplitStream;
use futures_util::{Sink, StreamExt};
use roomcast_bus::{BridgeError, Bus, BusBridge};
use roomcast_core::store::display_name_or_id;
use roomcast_core::{
    AuthError, BroadcastReport, Broadcaster, Connection, ConnectionId, MemoryStore, Message,
    MessageStore, RoomDirectory, RoomRegistry, StoreError, TokenValidator, UserDirectory,
};
use roomcast_protocol::codec::{decode_client, encode_event};
use roomcast_protocol::{validate_room_id, ProtocolError, ServerEvent};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors from the publish path.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The room identifier is not acceptable.
    #[error("Invalid room identifier: {0}")]
    InvalidRoom(&'static str),

    /// The message could not be built or encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Outcome of pushing one message into live delivery.
#[derive(Debug)]
pub struct Delivery {
    /// The message as persisted and delivered.
    pub message: Message,
    /// Local fan-out result.
    pub local: BroadcastReport,
    /// Why the bus publish failed, if it did.
    pub publish_error: Option<BridgeError>,
}

/// External collaborators the gateway consults.
#[derive(Clone)]
pub struct Collaborators {
    /// Durable message storage.
    pub messages: Arc<dyn MessageStore>,
    /// Room lookup.
    pub rooms: Arc<dyn RoomDirectory>,
    /// Display name lookup.
    pub users: Arc<dyn UserDirectory>,
}

impl Collaborators {
    /// Use one in-memory store for every collaborator.
    #[must_use]
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            messages: store.clone(),
            rooms: store.clone(),
            users: store,
        }
    }
}

/// Shared server state.
pub struct Gateway {
    config: Config,
    validator: TokenValidator,
    bridge: Arc<BusBridge>,
    collaborators: Collaborators,
    shutdown: CancellationToken,
    /// Upgraded connections still running.
    tasks: TaskTracker,
}

impl Gateway {
    /// Build a gateway on `bus`.
    ///
    /// Every gateway gets a fresh node id, so two gateways on one bus act as
    /// separate processes.
    #[must_use]
    pub fn new(config: Config, bus: Arc<dyn Bus>, collaborators: Collaborators) -> Arc<Self> {
        let registry = Arc::new(RoomRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry, config.limits.write_timeout()));
        let node_id = format!("node_{}", Uuid::new_v4().simple());
        let bridge = BusBridge::new(node_id, bus, broadcaster, config.bus.subscribe_timeout());

        Arc::new(Self {
            validator: TokenValidator::new(config.auth.jwt_secret.as_bytes()),
            config,
            bridge,
            collaborators,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// The local room registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        self.bridge.registry()
    }

    /// The bus bridge.
    #[must_use]
    pub fn bridge(&self) -> &Arc<BusBridge> {
        &self.bridge
    }

    /// Server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Root token; every connection token is a child of it.
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Close every connection and stop every subscription.
    ///
    /// Waits for each connection to finish its teardown before the bus
    /// subscriptions are stopped.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.bridge.shutdown().await;
        info!("Gateway shut down");
    }

    /// Push a message that originated outside a WebSocket into live delivery.
    ///
    /// Runs the same path as an inbound text frame: persist, fan out to
    /// local members, publish to the bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the room id is invalid or the content is empty.
    pub async fn submit(
        &self,
        room_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<Delivery, GatewayError> {
        validate_room_id(room_id).map_err(GatewayError::InvalidRoom)?;
        self.deliver(room_id, sender_id, content, None).await
    }

    async fn deliver(
        &self,
        room_id: &str,
        sender_id: &str,
        content: &str,
        skip: Option<&ConnectionId>,
    ) -> Result<Delivery, GatewayError> {
        let message = Message::new(room_id, sender_id, content)?;

        // Durability is independent of live delivery.
        if let Err(e) = self.collaborators.messages.create_message(&message).await {
            warn!(room = %room_id, message = %message.id, error = %e, "Failed to persist message");
            metrics::record_error("persist");
        }

        let username = display_name_or_id(self.collaborators.users.as_ref(), sender_id).await;
        let event = message.to_event(username);
        let text = encode_event(&event)?;

        let local = self.bridge.broadcaster().broadcast(room_id, &text, skip).await;
        metrics::record_message(text.len(), "outbound");
        if !local.failed.is_empty() {
            metrics::record_broadcast_failures(local.failed.len());
            self.bridge.release_if_empty(room_id).await;
        }

        let publish_error = match self.bridge.publish(room_id, &event).await {
            Ok(()) => None,
            Err(e) => {
                warn!(room = %room_id, error = %e, "Bus publish failed");
                metrics::record_publish_failure();
                Some(e)
            }
        };

        Ok(Delivery {
            message,
            local,
            publish_error,
        })
    }

    /// Check a handshake and return `(user_id, room_id)`.
    async fn authorize(
        &self,
        params: &ConnectParams,
        headers: &HeaderMap,
    ) -> Result<(String, String), Rejection> {
        // An empty `token=` falls through to the header.
        let token = params
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| bearer_token(headers));
        let user_id = self.validator.validate(token).map_err(Rejection::Unauthorized)?;

        let room_id = params
            .room_id
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or(Rejection::BadRequest("room_id is required"))?;
        validate_room_id(room_id).map_err(Rejection::BadRequest)?;

        if self.config.gateway.require_known_room {
            match self.collaborators.rooms.find_room_by_code(room_id).await {
                Ok(_) => {}
                Err(StoreError::NotFound(_)) => {
                    return Err(Rejection::NotFound(room_id.to_string()));
                }
                Err(e) => {
                    warn!(room = %room_id, error = %e, "Room lookup failed");
                    return Err(Rejection::Unavailable);
                }
            }
        }

        Ok((user_id, room_id.to_string()))
    }

    /// Drive one upgraded connection from join to teardown.
    async fn run_connection(self: Arc<Self>, socket: WebSocket, user_id: String, room_id: String) {
        let _metrics_guard = ConnectionMetricsGuard::new();

        let (sink, mut stream) = socket.split();
        let conn = Arc::new(WsConnection::new(
            room_id.clone(),
            user_id.clone(),
            sink,
            self.shutdown.child_token(),
            self.config.limits.write_timeout(),
        ));
        let connection_id = conn.id().clone();

        // History goes out before the connection can receive live traffic.
        if self.config.gateway.replay_history {
            self.replay_history(&conn).await;
        }

        if let Err(e) = self.bridge.join(conn.clone()).await {
            warn!(room = %room_id, connection = %connection_id, error = %e, "Join failed");
            metrics::record_error("join");
            conn.close().await;
            return;
        }
        self.update_gauges().await;
        info!(room = %room_id, connection = %connection_id, user = %user_id, "Connection joined");

        let keepalive = tokio::spawn(keepalive(
            conn.clone(),
            self.config.heartbeat.interval(),
            self.config.heartbeat.timeout(),
        ));

        self.read_loop(&conn, &mut stream).await;

        conn.close().await;
        self.bridge.leave(&room_id, &connection_id).await;
        let _ = keepalive.await;
        self.update_gauges().await;

        info!(room = %room_id, connection = %connection_id, "Connection left");
    }

    async fn read_loop(&self, conn: &Arc<WsConnection>, stream: &mut SplitStream<WebSocket>) {
        let cancel = conn.cancel_token().clone();
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(connection = %conn.id(), "Connection cancelled");
                    break;
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            conn.touch();
                            self.handle_text(conn, &text).await;
                        }
                        Some(Ok(WsMessage::Binary(data))) => {
                            conn.touch();
                            debug!(connection = %conn.id(), bytes = data.len(), "Ignoring binary frame");
                        }
                        Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                            // Pings are answered by the transport.
                            conn.touch();
                        }
                        Some(Ok(WsMessage::Close(_))) => {
                            debug!(connection = %conn.id(), "Received close frame");
                            break;
                        }
                        Some(Err(e)) => {
                            debug!(connection = %conn.id(), error = %e, "WebSocket error");
                            metrics::record_error("websocket");
                            break;
                        }
                        None => {
                            debug!(connection = %conn.id(), "WebSocket stream ended");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_text(&self, conn: &Arc<WsConnection>, text: &str) {
        let start = Instant::now();
        metrics::record_message(text.len(), "inbound");

        let frame = match decode_client(text, self.config.limits.max_message_size) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(connection = %conn.id(), error = %e, "Dropping client frame");
                metrics::record_error("protocol");
                return;
            }
        };

        match self
            .deliver(conn.room_id(), conn.user_id(), &frame.content, Some(conn.id()))
            .await
        {
            Ok(delivery) => debug!(
                connection = %conn.id(),
                room = %conn.room_id(),
                delivered = delivery.local.delivered,
                published = delivery.publish_error.is_none(),
                "Message delivered"
            ),
            Err(e) => debug!(connection = %conn.id(), error = %e, "Message rejected"),
        }

        metrics::record_latency(start.elapsed().as_secs_f64());
    }

    async fn replay_history(&self, conn: &WsConnection) {
        let history = match self.collaborators.messages.list_messages(conn.room_id()).await {
            Ok(history) => history,
            Err(e) => {
                warn!(room = %conn.room_id(), error = %e, "Failed to load history");
                return;
            }
        };

        for message in &history {
            let username =
                display_name_or_id(self.collaborators.users.as_ref(), &message.sender_id).await;
            let text = match encode_event(&message.to_event(username)) {
                Ok(text) => text,
                Err(e) => {
                    warn!(message = %message.id, error = %e, "Failed to encode history entry");
                    continue;
                }
            };
            if let Err(e) = conn.send_text(&text).await {
                debug!(connection = %conn.id(), error = %e, "History replay aborted");
                return;
            }
        }
        debug!(connection = %conn.id(), messages = history.len(), "History replayed");
    }

    async fn update_gauges(&self) {
        metrics::set_active_rooms(self.registry().stats().room_count);
        metrics::set_active_subscriptions(self.bridge.subscription_count().await);
    }
}

/// Periodic liveness probe; closes the connection once the peer goes quiet.
async fn keepalive<S>(conn: Arc<WsConnection<S>>, interval: Duration, timeout: Duration)
where
    S: Sink<WsMessage> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    let cancel = conn.cancel_token().clone();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !timeout.is_zero() && conn.idle_for() >= timeout {
                    info!(connection = %conn.id(), "Heartbeat timeout");
                    conn.close().await;
                    break;
                }
                if let Err(e) = conn.ping().await {
                    debug!(connection = %conn.id(), error = %e, "Ping failed");
                    conn.close().await;
                    break;
                }
            }
        }
    }
}

/// Query parameters of the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Bearer token.
    pub token: Option<String>,
    /// Room to join.
    pub room_id: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Why an upgrade request was refused.
#[derive(Debug)]
enum Rejection {
    Unauthorized(AuthError),
    BadRequest(&'static str),
    NotFound(String),
    Unavailable,
}

impl Rejection {
    fn reason(&self) -> &'static str {
        match self {
            Rejection::Unauthorized(e) => e.reason(),
            Rejection::BadRequest(_) => "bad_request",
            Rejection::NotFound(_) => "unknown_room",
            Rejection::Unavailable => "unavailable",
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Rejection::Unauthorized(e) => (StatusCode::UNAUTHORIZED, e.to_string()),
            Rejection::BadRequest(msg) => (StatusCode::BAD_REQUEST, (*msg).to_string()),
            Rejection::NotFound(room) => (StatusCode::NOT_FOUND, format!("Room {room} not found")),
            Rejection::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Room directory unavailable".to_string(),
            ),
        };
        (status, Json(ServerEvent::error(status.as_u16(), message))).into_response()
    }
}

/// Build the HTTP router.
pub fn router(gateway: Arc<Gateway>) -> Router {
    let path = gateway.config.gateway.path.clone();
    Router::new()
        .route(&path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(gateway)
}

/// Health check handler.
async fn health_handler(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let stats = gateway.registry().stats();
    let subscriptions = gateway.bridge.subscription_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "node_id": gateway.bridge.node_id(),
        "bus": gateway.bridge.bus_name(),
        "rooms": stats.room_count,
        "connections": stats.connection_count,
        "subscriptions": subscriptions,
    }))
}

/// WebSocket upgrade handler.
///
/// Every check runs before the upgrade, so a rejected peer never holds an
/// upgraded socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    let outcome = gateway.authorize(&params, &headers).await;
    match outcome {
        Ok((user_id, room_id)) => {
            debug!(room = %room_id, user = %user_id, "Upgrade accepted");
            ws.max_message_size(gateway.config.limits.max_message_size)
                .on_upgrade(move |socket| {
                    let tasks = gateway.tasks.clone();
                    tasks.track_future(gateway.run_connection(socket, user_id, room_id))
                })
        }
        Err(rejection) => {
            info!(reason = rejection.reason(), "Upgrade rejected");
            metrics::record_rejection(rejection.reason());
            rejection.into_response()
        }
    }
}
