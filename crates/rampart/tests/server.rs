//! Integration tests for the Rampart server, handler, and full connection flow.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rampart::document::DEFAULT_SCHEMA_VERSION;
use rampart::prelude::*;
use rampart::protocol::{Envelope, Message as Wire, PROTOCOL_VERSION};
use rampart::session::{BACKWARDS_COMPATIBILITY_MESSAGE, SessionState};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

// =========================================================================
// Helpers
// =========================================================================

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

type Handle = ServerHandle<rampart::protocol::JsonCodec>;

struct TestServer {
    addr: String,
    backend: Arc<MemoryBackend<PlayerData>>,
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), RampartError>>,
}

impl TestServer {
    /// Fires the shutdown signal and waits for `run` to return.
    async fn shut_down(mut self) -> Result<(), RampartError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server should stop")
            .expect("server task should not panic")
    }
}

/// Starts a server on a random port.
async fn start_server() -> TestServer {
    start_server_with(Arc::new(MemoryBackend::new())).await
}

async fn start_server_with(backend: Arc<MemoryBackend<PlayerData>>) -> TestServer {
    let (stop, stopped) = oneshot::channel::<()>();
    let server = RampartServerBuilder::new()
        .bind("127.0.0.1:0")
        .autosave_interval(None)
        .shutdown_signal(async move {
            let _ = stopped.await;
        })
        .build(Arc::clone(&backend), NumericTokenAuthenticator)
        .await
        .expect("server should build");

    let addr = server
        .local_addr()
        .expect("should have local addr")
        .to_string();
    let handle = server.handle();

    let task = tokio::spawn(server.run());

    // Give the accept loop a moment to start.
    tokio::time::sleep(Duration::from_millis(10)).await;
    TestServer {
        addr,
        backend,
        handle,
        stop: Some(stop),
        task,
    }
}

async fn connect(addr: &str) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("should connect");
    ws
}

async fn send(ws: &mut ClientWs, seq: u64, message: Wire) {
    let bytes = serde_json::to_vec(&Envelope::new(seq, 0, message)).expect("encode");
    ws.send(Message::Binary(bytes.into())).await.expect("send");
}

/// Receives the next envelope's message, skipping nothing.
async fn recv(ws: &mut ClientWs) -> Wire {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("should receive in time")
        .expect("stream should not end")
        .expect("recv");
    let envelope: Envelope = serde_json::from_slice(&msg.into_data()).expect("decode");
    envelope.message
}

/// Sends a handshake and returns the reply.
async fn handshake(ws: &mut ClientWs, token: &str) -> Wire {
    send(
        ws,
        0,
        Wire::Handshake {
            version: PROTOCOL_VERSION,
            token: Some(token.to_string()),
        },
    )
    .await;
    recv(ws).await
}

/// Asks for player data and decodes the reply.
async fn request_player_data(ws: &mut ClientWs, seq: u64) -> PlayerData {
    send(ws, seq, Wire::RequestPlayerData).await;
    match recv(ws).await {
        Wire::PlayerData { data } => serde_json::from_slice(&data).expect("player data"),
        other => panic!("expected PlayerData, got {other:?}"),
    }
}

/// Backend latency that keeps an open in flight long enough for the
/// client to act while it loads.
const SLOW_OPEN: Duration = Duration::from_millis(200);

async fn start_slow_server() -> TestServer {
    start_server_with(Arc::new(MemoryBackend::new().with_latency(SLOW_OPEN))).await
}

/// Polls until `check` holds or three seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_handshake_success() {
    let server = start_server().await;
    let mut ws = connect(&server.addr).await;

    match handshake(&mut ws, "42").await {
        Wire::HandshakeAck { player_id, .. } => assert_eq!(player_id, PlayerId(42)),
        other => panic!("expected HandshakeAck, got {other:?}"),
    }
}

#[tokio::test]
async fn test_request_player_data_returns_default_record() {
    let server = start_server().await;
    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "42").await;

    let data = request_player_data(&mut ws, 1).await;
    assert_eq!(data, PlayerData::default());
    assert!(server.backend.is_locked(&DocumentKey::from(42u64)));
}

#[tokio::test]
async fn test_returning_player_gets_saved_record() {
    let backend = Arc::new(MemoryBackend::new());
    let saved = PlayerData {
        coins: 300,
        ..PlayerData::default()
    };
    backend.insert_record(&DocumentKey::from(7u64), DEFAULT_SCHEMA_VERSION, saved.clone());
    let server = start_server_with(backend).await;

    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "7").await;
    assert_eq!(request_player_data(&mut ws, 1).await, saved);
}

#[tokio::test]
async fn test_handshake_version_mismatch() {
    let server = start_server().await;
    let mut ws = connect(&server.addr).await;

    send(
        &mut ws,
        0,
        Wire::Handshake {
            version: 999,
            token: Some("1".into()),
        },
    )
    .await;

    match recv(&mut ws).await {
        Wire::Error { code, .. } => assert_eq!(code, 400),
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_auth_failure() {
    let server = start_server().await;
    let mut ws = connect(&server.addr).await;

    match handshake(&mut ws, "not-a-number").await {
        Wire::Error { code, .. } => assert_eq!(code, 401),
        other => panic!("expected Error 401, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_non_handshake_first_message() {
    let server = start_server().await;
    let mut ws = connect(&server.addr).await;

    send(&mut ws, 0, Wire::RequestPlayerData).await;

    match recv(&mut ws).await {
        Wire::Error { code, message } => {
            assert_eq!(code, 400);
            assert!(message.contains("Handshake"));
        }
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_heartbeat_response() {
    let server = start_server().await;
    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "1").await;

    send(&mut ws, 1, Wire::Heartbeat { client_time: 12345 }).await;

    match recv(&mut ws).await {
        Wire::HeartbeatAck { client_time, .. } => assert_eq!(client_time, 12345),
        other => panic!("expected HeartbeatAck, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_envelope_ignored() {
    let server = start_server().await;
    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "1").await;

    ws.send(Message::Binary(b"not json".to_vec().into()))
        .await
        .expect("send garbage");

    // The connection survives.
    assert_eq!(request_player_data(&mut ws, 1).await, PlayerData::default());
}

#[tokio::test]
async fn test_unsupported_record_disconnects_with_message() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_record(
        &DocumentKey::from(9u64),
        DEFAULT_SCHEMA_VERSION + 1,
        PlayerData::default(),
    );
    let server = start_server_with(backend).await;

    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "9").await;

    match recv(&mut ws).await {
        Wire::Disconnect { reason } => assert_eq!(reason, BACKWARDS_COMPATIBILITY_MESSAGE),
        other => panic!("expected Disconnect, got {other:?}"),
    }

    let close = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("should receive in time");
    assert!(matches!(close, Some(Ok(Message::Close(Some(_))))));

    // Only one open attempt; this error is not retried.
    assert_eq!(server.backend.stats(&DocumentKey::from(9u64)).opens, 1);
    assert_eq!(server.handle.sessions().session_count(), 0);
}

#[tokio::test]
async fn test_client_close_releases_record() {
    let server = start_server().await;
    let key = DocumentKey::from(5u64);
    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "5").await;
    request_player_data(&mut ws, 1).await;

    server
        .handle
        .sessions()
        .mutate(PlayerId(5), |data| data.award_coins(40))
        .await
        .expect("mutate");
    // The update is pushed to the client.
    match recv(&mut ws).await {
        Wire::PlayerData { data } => {
            let data: PlayerData = serde_json::from_slice(&data).expect("player data");
            assert_eq!(data.coins, 40);
        }
        other => panic!("expected PlayerData, got {other:?}"),
    }

    ws.close(None).await.expect("close");

    eventually(|| !server.backend.is_locked(&key)).await;
    assert_eq!(server.backend.stats(&key).releases, 1);
    let stored = server.backend.record(&key).expect("record");
    assert_eq!(stored.value.coins, 40);
    eventually(|| server.handle.sessions().session_count() == 0).await;
}

#[tokio::test]
async fn test_disconnect_message_releases_record() {
    let server = start_server().await;
    let key = DocumentKey::from(6u64);
    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "6").await;
    request_player_data(&mut ws, 1).await;

    send(
        &mut ws,
        2,
        Wire::Disconnect {
            reason: "bye".into(),
        },
    )
    .await;

    eventually(|| !server.backend.is_locked(&key)).await;
    assert_eq!(server.backend.stats(&key).releases, 1);
}

#[tokio::test]
async fn test_duplicate_connection_rejected() {
    let server = start_server().await;

    let mut first = connect(&server.addr).await;
    handshake(&mut first, "3").await;
    request_player_data(&mut first, 1).await;

    let mut second = connect(&server.addr).await;
    handshake(&mut second, "3").await;
    match recv(&mut second).await {
        Wire::Error { code, .. } => assert_eq!(code, 409),
        other => panic!("expected Error 409, got {other:?}"),
    }

    // The first connection is unaffected.
    assert_eq!(request_player_data(&mut first, 2).await, PlayerData::default());
    assert_eq!(server.backend.stats(&DocumentKey::from(3u64)).opens, 1);
}

#[tokio::test]
async fn test_reconnect_after_leaving() {
    let server = start_server().await;
    let key = DocumentKey::from(8u64);

    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "8").await;
    request_player_data(&mut ws, 1).await;
    ws.close(None).await.expect("close");
    eventually(|| !server.backend.is_locked(&key)).await;

    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "8").await;
    request_player_data(&mut ws, 1).await;
    assert_eq!(server.backend.stats(&key).opens, 2);
}

// =========================================================================
// Leaving while data loads
// =========================================================================

/// Waits until the player's record was released exactly once and their
/// session is gone.
async fn assert_released_once(server: &TestServer, player: u64) {
    let key = DocumentKey::from(player);
    eventually(|| {
        server.backend.stats(&key).releases == 1
            && server.handle.sessions().session_count() == 0
    })
    .await;
    assert!(!server.backend.is_locked(&key));
    assert_eq!(server.backend.stats(&key).opens, 1);
}

#[tokio::test]
async fn test_client_close_mid_load_releases_record() {
    let server = start_slow_server().await;
    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "31").await;
    send(&mut ws, 1, Wire::RequestPlayerData).await;

    ws.close(None).await.expect("close");

    assert_released_once(&server, 31).await;

    // The next login gets a fresh session.
    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "31").await;
    assert_eq!(request_player_data(&mut ws, 1).await, PlayerData::default());
    assert_eq!(server.handle.sessions().session_count(), 1);
}

#[tokio::test]
async fn test_disconnect_message_mid_load_releases_record() {
    let server = start_slow_server().await;
    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "32").await;
    send(&mut ws, 1, Wire::RequestPlayerData).await;

    send(
        &mut ws,
        2,
        Wire::Disconnect {
            reason: "bye".into(),
        },
    )
    .await;

    assert_released_once(&server, 32).await;
    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "32").await;
    assert_eq!(request_player_data(&mut ws, 1).await, PlayerData::default());
}

#[tokio::test]
async fn test_heartbeat_then_dropped_socket_mid_load_releases_record() {
    let server = start_slow_server().await;
    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "33").await;

    // The heartbeat ack may fail to send; either way the session goes.
    send(&mut ws, 1, Wire::Heartbeat { client_time: 7 }).await;
    drop(ws);

    assert_released_once(&server, 33).await;
}

#[tokio::test]
async fn test_duplicate_connection_mid_load_keeps_first_session() {
    let server = start_slow_server().await;
    let key = DocumentKey::from(34u64);

    let mut first = connect(&server.addr).await;
    handshake(&mut first, "34").await;
    send(&mut first, 1, Wire::RequestPlayerData).await;

    // Rejected while the first open is still in flight.
    let mut second = connect(&server.addr).await;
    handshake(&mut second, "34").await;
    match recv(&mut second).await {
        Wire::Error { code, .. } => assert_eq!(code, 409),
        other => panic!("expected Error 409, got {other:?}"),
    }
    drop(second);

    // The first connection's buffered request is answered once loaded.
    match recv(&mut first).await {
        Wire::PlayerData { data } => {
            let data: PlayerData = serde_json::from_slice(&data).expect("player data");
            assert_eq!(data, PlayerData::default());
        }
        other => panic!("expected PlayerData, got {other:?}"),
    }
    assert_eq!(
        server.handle.sessions().state(PlayerId(34)),
        Some(SessionState::Open)
    );
    assert!(server.backend.is_locked(&key));
    assert_eq!(server.backend.stats(&key).opens, 1);
    assert_eq!(server.backend.stats(&key).releases, 0);
}

#[tokio::test]
async fn test_broadcast_game_info_reaches_client() {
    let server = start_server().await;
    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "11").await;
    request_player_data(&mut ws, 1).await;

    let info = GameInfo {
        wave: 3,
        health: 20,
        ..GameInfo::default()
    };
    let reached = server
        .handle
        .broadcast_game_info(&info)
        .expect("broadcast");
    assert_eq!(reached, 1);

    match recv(&mut ws).await {
        Wire::GameInfo { data } => {
            let received: GameInfo = serde_json::from_slice(&data).expect("game info");
            assert_eq!(received, info);
        }
        other => panic!("expected GameInfo, got {other:?}"),
    }
}

#[tokio::test]
async fn test_multiple_connections_independent() {
    let server = start_server().await;

    let mut ws1 = connect(&server.addr).await;
    let mut ws2 = connect(&server.addr).await;

    match handshake(&mut ws1, "1").await {
        Wire::HandshakeAck { player_id, .. } => assert_eq!(player_id, PlayerId(1)),
        other => panic!("expected HandshakeAck, got {other:?}"),
    }
    match handshake(&mut ws2, "2").await {
        Wire::HandshakeAck { player_id, .. } => assert_eq!(player_id, PlayerId(2)),
        other => panic!("expected HandshakeAck, got {other:?}"),
    }

    request_player_data(&mut ws1, 1).await;
    request_player_data(&mut ws2, 1).await;
    assert_eq!(server.handle.sessions().session_count(), 2);
}

#[tokio::test]
async fn test_shutdown_releases_open_records() {
    let server = start_server().await;
    let mut ws = connect(&server.addr).await;
    handshake(&mut ws, "21").await;
    request_player_data(&mut ws, 1).await;

    let backend = Arc::clone(&server.backend);
    let handle = server.handle.clone();
    server.shut_down().await.expect("run should return Ok");

    let key = DocumentKey::from(21u64);
    assert!(!backend.is_locked(&key));
    assert_eq!(backend.stats(&key).releases, 1);
    assert_eq!(handle.sessions().session_count(), 0);
}
