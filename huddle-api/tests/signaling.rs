//! End-to-end signaling scenarios over real WebSocket connections
//!
//! Each test boots the full router on an ephemeral port and drives it with
//! plain JSON frames, the way a browser client would.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use huddle_sfu::{Config, RoomId, RoomManager};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(room_capacity: usize) -> (String, Arc<RoomManager>) {
    let mut config = Config::default();
    config.sfu.room_capacity = room_capacity;

    let manager = Arc::new(RoomManager::new());
    let router = huddle_api::http::create_router(Arc::clone(&manager), Arc::new(config));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("ws://{addr}/ws"), manager)
}

async fn connect(url: &str) -> WsClient {
    let (client, _) = connect_async(url).await.unwrap();
    client
}

async fn send(client: &mut WsClient, value: Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

async fn recv(client: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a server message")
            .expect("connection closed unexpectedly")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read envelopes until one with the given event arrives, skipping others
/// (trickled `candidate` frames can interleave with anything).
async fn recv_event(client: &mut WsClient, event: &str) -> Value {
    for _ in 0..20 {
        let reply = recv(client).await;
        if reply["event"] == event {
            return reply;
        }
    }
    panic!("no {event} envelope arrived");
}

async fn join(client: &mut WsClient, room: &str) -> String {
    send(
        client,
        json!({"event": "join", "data": {"roomId": room, "peerId": ""}}),
    )
    .await;
    let reply = recv(client).await;
    assert_eq!(reply["event"], "peer-id");
    reply["data"].as_str().unwrap().to_string()
}

/// The next thing the client observes must be the end of the stream, not
/// another envelope.
async fn expect_closed(client: &mut WsClient) {
    let next = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for the connection to close");
    match next {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("expected connection close, got {other:?}"),
    }
}

/// Server-side cleanup runs after the socket drops; poll for it.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..50 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

fn room_gone(manager: &Arc<RoomManager>, name: &str) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = bool> + Send>> {
    let manager = Arc::clone(manager);
    let name = RoomId::from(name);
    move || {
        let manager = Arc::clone(&manager);
        let name = name.clone();
        Box::pin(async move { manager.get(&name).await.is_none() })
    }
}

/// A valid SDP offer with one video and one audio section, produced by a
/// real client-side peer connection.
async fn client_offer() -> String {
    use webrtc::api::interceptor_registry::register_default_interceptors;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::APIBuilder;
    use webrtc::interceptor::registry::Registry;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let registry = register_default_interceptors(Registry::new(), &mut media_engine).unwrap();
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .unwrap();
    pc.add_transceiver_from_kind(RTPCodecType::Video, None)
        .await
        .unwrap();
    pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
        .await
        .unwrap();
    let offer = pc.create_offer(None).await.unwrap();
    pc.close().await.unwrap();
    offer.sdp
}

#[tokio::test]
async fn test_join_creates_room_and_assigns_identity() {
    let (url, manager) = start_server(10).await;
    let mut c1 = connect(&url).await;

    let id = join(&mut c1, "R1").await;
    assert!(uuid::Uuid::parse_str(&id).is_ok());

    let room = manager
        .get(&RoomId::from("R1"))
        .await
        .expect("room should exist after join");
    assert_eq!(room.peer_count().await, 1);
}

#[tokio::test]
async fn test_offer_is_answered() {
    let (url, manager) = start_server(10).await;
    let mut c1 = connect(&url).await;
    let mut c2 = connect(&url).await;

    join(&mut c1, "R1").await;
    join(&mut c2, "R1").await;

    let room = manager.get(&RoomId::from("R1")).await.unwrap();
    assert_eq!(room.peer_count().await, 2);

    send(&mut c2, json!({"event": "offer", "data": client_offer().await})).await;
    let reply = recv_event(&mut c2, "answer").await;
    let sdp = reply["data"].as_str().expect("answer carries an sdp string");
    assert!(sdp.starts_with("v=0"));
}

#[tokio::test]
async fn test_room_full_rejects_excess_join() {
    let (url, manager) = start_server(2).await;
    let mut c1 = connect(&url).await;
    let mut c2 = connect(&url).await;

    join(&mut c1, "R1").await;
    join(&mut c2, "R1").await;

    let mut c3 = connect(&url).await;
    send(
        &mut c3,
        json!({"event": "join", "data": {"roomId": "R1", "peerId": ""}}),
    )
    .await;
    let reply = recv(&mut c3).await;
    assert_eq!(reply["event"], "room-full");
    assert_eq!(reply["data"], "room is full");
    expect_closed(&mut c3).await;

    let room = manager.get(&RoomId::from("R1")).await.unwrap();
    assert_eq!(room.peer_count().await, 2);
}

#[tokio::test]
async fn test_leave_deletes_empty_room() {
    let (url, manager) = start_server(10).await;
    let mut c1 = connect(&url).await;

    join(&mut c1, "R1").await;
    send(&mut c1, json!({"event": "leave"})).await;

    assert!(eventually(room_gone(&manager, "R1")).await);
}

#[tokio::test]
async fn test_disconnect_without_leave_cleans_up() {
    let (url, manager) = start_server(10).await;
    let mut c1 = connect(&url).await;

    join(&mut c1, "R2").await;
    drop(c1);

    assert!(eventually(room_gone(&manager, "R2")).await);
}

#[tokio::test]
async fn test_offer_before_join_disconnects() {
    let (url, manager) = start_server(10).await;
    let mut c1 = connect(&url).await;

    send(&mut c1, json!({"event": "offer", "data": "v=0 whatever"})).await;
    expect_closed(&mut c1).await;

    assert_eq!(manager.room_count().await, 0);
}

#[tokio::test]
async fn test_malformed_message_disconnects() {
    let (url, _manager) = start_server(10).await;
    let mut c1 = connect(&url).await;

    c1.send(Message::Text("not json".to_string())).await.unwrap();
    expect_closed(&mut c1).await;
}

#[tokio::test]
async fn test_unknown_events_and_repeat_joins_are_tolerated() {
    let (url, manager) = start_server(10).await;
    let mut c1 = connect(&url).await;

    join(&mut c1, "R1").await;
    send(&mut c1, json!({"event": "mystery", "data": 42})).await;
    send(
        &mut c1,
        json!({"event": "join", "data": {"roomId": "R1", "peerId": ""}}),
    )
    .await;

    // Neither event disturbs the session or the membership.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let room = manager.get(&RoomId::from("R1")).await.unwrap();
    assert_eq!(room.peer_count().await, 1);

    send(&mut c1, json!({"event": "leave"})).await;
    assert!(eventually(room_gone(&manager, "R1")).await);
}
