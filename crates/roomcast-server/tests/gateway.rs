//! End-to-end tests driving a real listener with a WebSocket client.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use roomcast_bus::MemoryBus;
use roomcast_core::{Message, MemoryStore, MessageStore};
use roomcast_server::config::Config;
use roomcast_server::gateway::{router, Collaborators, Gateway};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "integration-secret";

fn config() -> Config {
    let mut config = Config::default();
    config.auth.jwt_secret = SECRET.to_string();
    config.limits.write_timeout_ms = 1_000;
    config
}

fn token(sub: &str, exp_offset: i64) -> String {
    let claims = serde_json::json!({
        "sub": sub,
        "exp": chrono::Utc::now().timestamp() + exp_offset,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn gateway_on(bus: &MemoryBus, store: &Arc<MemoryStore>) -> Arc<Gateway> {
    Gateway::new(
        config(),
        Arc::new(bus.clone()),
        Collaborators::in_memory(store.clone()),
    )
}

async fn serve(gateway: Arc<Gateway>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(gateway)).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, room: &str, user: &str) -> Client {
    let url = format!("ws://{addr}/api/v1/ws?room_id={room}&token={}", token(user, 60));
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn wait_for_members(gateway: &Gateway, room: &str, count: usize) {
    let poll = async {
        while gateway.registry().member_count(room) != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), poll)
        .await
        .expect("membership did not settle");
}

/// Next text frame, or `None` if nothing arrives shortly.
async fn next_text(ws: &mut Client) -> Option<String> {
    loop {
        match tokio::time::timeout(Duration::from_millis(300), ws.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => return Some(text),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn local_peer_receives_once_without_echo() {
    let store = Arc::new(MemoryStore::new());
    store.add_user("user-a", "alice");
    let gateway = gateway_on(&MemoryBus::new(), &store);
    let addr = serve(gateway.clone()).await;

    let mut a = connect(addr, "R1", "user-a").await;
    let mut b = connect(addr, "R1", "user-b").await;
    wait_for_members(&gateway, "R1", 2).await;

    a.send(WsMessage::Text(r#"{"content":"hi"}"#.into()))
        .await
        .unwrap();

    let frame = next_text(&mut b).await.expect("B should receive the message");
    let event: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(event["type"], "new_message");
    assert_eq!(event["room_id"], "R1");
    assert_eq!(event["sender_id"], "user-a");
    assert_eq!(event["username"], "alice");
    assert_eq!(event["content"], "hi");

    assert!(next_text(&mut b).await.is_none(), "B got a duplicate");
    assert!(next_text(&mut a).await.is_none(), "A got an echo");
    assert_eq!(store.message_count("R1"), 1);
}

#[tokio::test]
async fn remote_peer_receives_through_bus() {
    let bus = MemoryBus::new();
    let store = Arc::new(MemoryStore::new());
    let node_1 = gateway_on(&bus, &store);
    let node_2 = gateway_on(&bus, &store);
    let addr_1 = serve(node_1.clone()).await;
    let addr_2 = serve(node_2.clone()).await;

    let mut a = connect(addr_1, "R1", "user-a").await;
    let mut b = connect(addr_2, "R1", "user-b").await;
    wait_for_members(&node_1, "R1", 1).await;
    wait_for_members(&node_2, "R1", 1).await;

    a.send(WsMessage::Text(r#"{"content":"hi"}"#.into()))
        .await
        .unwrap();

    let frame = next_text(&mut b).await.expect("B should receive the message");
    assert!(frame.contains("\"content\":\"hi\""));
    assert!(next_text(&mut b).await.is_none(), "B got a duplicate");
    assert!(next_text(&mut a).await.is_none(), "A got an echo");
}

#[tokio::test]
async fn expired_token_is_rejected_before_upgrade() {
    let gateway = gateway_on(&MemoryBus::new(), &Arc::new(MemoryStore::new()));
    let addr = serve(gateway.clone()).await;

    let url = format!("ws://{addr}/api/v1/ws?room_id=R2&token={}", token("user-a", -1));
    match connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }

    assert!(!gateway.registry().room_exists("R2"));
    assert!(!gateway.bridge().is_subscribed("R2").await);
}

#[tokio::test]
async fn missing_room_is_bad_request() {
    let gateway = gateway_on(&MemoryBus::new(), &Arc::new(MemoryStore::new()));
    let addr = serve(gateway).await;

    let url = format!("ws://{addr}/api/v1/ws?token={}", token("user-a", 60));
    match connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 400),
        other => panic!("expected 400, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn bearer_header_is_accepted() {
    let gateway = gateway_on(&MemoryBus::new(), &Arc::new(MemoryStore::new()));
    let addr = serve(gateway.clone()).await;

    let mut request = format!("ws://{addr}/api/v1/ws?room_id=R3")
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", token("user-c", 60)).parse().unwrap(),
    );
    let (_ws, _) = connect_async(request).await.unwrap();

    wait_for_members(&gateway, "R3", 1).await;
}

#[tokio::test]
async fn disconnect_releases_membership_and_subscription() {
    let gateway = gateway_on(&MemoryBus::new(), &Arc::new(MemoryStore::new()));
    let addr = serve(gateway.clone()).await;

    let mut a = connect(addr, "R4", "user-a").await;
    wait_for_members(&gateway, "R4", 1).await;
    assert!(gateway.bridge().is_subscribed("R4").await);

    a.close(None).await.unwrap();
    wait_for_members(&gateway, "R4", 0).await;

    let released = async {
        while gateway.bridge().is_subscribed("R4").await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), released)
        .await
        .unwrap();
    assert!(!gateway.registry().room_exists("R4"));
}

#[tokio::test]
async fn history_is_replayed_on_join() {
    let store = Arc::new(MemoryStore::new());
    store.add_user("user-a", "alice");
    store
        .create_message(&Message::new("R5", "user-a", "earlier").unwrap())
        .await
        .unwrap();
    let gateway = gateway_on(&MemoryBus::new(), &store);
    let addr = serve(gateway).await;

    let mut b = connect(addr, "R5", "user-b").await;
    let frame = next_text(&mut b).await.expect("history should be replayed");
    let event: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(event["content"], "earlier");
    assert_eq!(event["username"], "alice");
}

#[tokio::test]
async fn empty_and_malformed_frames_are_ignored() {
    let gateway = gateway_on(&MemoryBus::new(), &Arc::new(MemoryStore::new()));
    let addr = serve(gateway.clone()).await;

    let mut a = connect(addr, "R6", "user-a").await;
    let mut b = connect(addr, "R6", "user-b").await;
    wait_for_members(&gateway, "R6", 2).await;

    a.send(WsMessage::Text(r#"{"content":"  "}"#.into()))
        .await
        .unwrap();
    a.send(WsMessage::Text("not json".into())).await.unwrap();
    a.send(WsMessage::Binary(vec![1, 2, 3])).await.unwrap();
    assert!(next_text(&mut b).await.is_none());

    // The sender's connection survives bad frames.
    a.send(WsMessage::Text(r#"{"content":"still here"}"#.into()))
        .await
        .unwrap();
    let frame = next_text(&mut b).await.unwrap();
    assert!(frame.contains("still here"));
    assert_eq!(gateway.registry().member_count("R6"), 2);
}

#[tokio::test]
async fn health_reports_counts() {
    let gateway = gateway_on(&MemoryBus::new(), &Arc::new(MemoryStore::new()));
    let addr = serve(gateway.clone()).await;

    let _a = connect(addr, "R7", "user-a").await;
    wait_for_members(&gateway, "R7", 1).await;

    let response = router(gateway.clone())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 1);
    assert_eq!(health["rooms"], 1);
    assert_eq!(health["subscriptions"], 1);
    assert_eq!(health["bus"], "memory");
}

#[tokio::test]
async fn shutdown_drains_connections_before_returning() {
    let gateway = gateway_on(&MemoryBus::new(), &Arc::new(MemoryStore::new()));
    let addr = serve(gateway.clone()).await;

    let _a = connect(addr, "R8", "user-a").await;
    let _b = connect(addr, "R9", "user-b").await;
    wait_for_members(&gateway, "R8", 1).await;
    wait_for_members(&gateway, "R9", 1).await;

    tokio::time::timeout(Duration::from_secs(5), gateway.shutdown())
        .await
        .expect("shutdown did not finish");

    // Every connection has left by the time shutdown returns.
    assert_eq!(gateway.registry().stats().connection_count, 0);
    assert!(!gateway.registry().room_exists("R8"));
    assert!(!gateway.registry().room_exists("R9"));
    assert_eq!(gateway.bridge().subscription_count().await, 0);
}
