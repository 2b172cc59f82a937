//! End-to-end scenarios spanning the status/token RPC service and a chat
//! server's TCP acceptor, wired together exactly as the fabric wires them
//! in production — just with an in-memory KV store and no HTTP gateway in
//! front (the gateway's own contract is exercised in `gateway::handlers`'s
//! own unit tests).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use chatfabric::chat::protocol::{encode_json_frame, FrameParser, FrameType, HEADER_LEN, MAGIC, PROTOCOL_VERSION};
use chatfabric::chat::ChatServer;
use chatfabric::kv::MemoryKvStore;
use chatfabric::rpc::proto::authentication_service_server::AuthenticationServiceServer;
use chatfabric::rpc::TokenStubPool;
use chatfabric::token::{AuthenticationServiceImpl, ChatServerRegistry, TokenService};
use chatfabric::worker_pool::WorkerPool;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tonic::transport::Server;
use uuid::Uuid;

/// Picks a free port by binding then immediately releasing it. Tests run
/// fast enough after that for the race to be a non-issue in practice.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct Fabric {
    token_service: Arc<TokenService>,
    chat_server: Arc<ChatServer>,
    chat_addr: SocketAddr,
}

async fn spin_up(max_connections: usize) -> Fabric {
    let rpc_port = free_port().await;
    let rpc_addr: SocketAddr = format!("127.0.0.1:{rpc_port}").parse().unwrap();

    let registry = ChatServerRegistry::new();
    let kv = Arc::new(MemoryKvStore::new());
    let token_service = Arc::new(TokenService::new("test-secret", kv, registry.clone(), 3600));

    let rpc_service = AuthenticationServiceImpl::new(token_service.clone(), registry.clone());
    tokio::spawn(async move {
        Server::builder()
            .add_service(AuthenticationServiceServer::new(rpc_service))
            .serve(rpc_addr)
            .await
            .unwrap();
    });
    // Give the RPC listener a moment to come up before anyone dials it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let token_stubs = Arc::new(
        TokenStubPool::connect(&format!("http://{rpc_addr}"), 1)
            .await
            .expect("status service should be reachable"),
    );

    let chat_port = free_port().await;
    let chat_addr: SocketAddr = format!("127.0.0.1:{chat_port}").parse().unwrap();
    let worker_pool = WorkerPool::new(2, 64);
    let chat_server = ChatServer::new(
        "chat-1".to_string(),
        "zone-1".to_string(),
        chat_addr.to_string(),
        max_connections,
        worker_pool,
        token_stubs,
    );

    registry
        .upsert(
            "chat-1".to_string(),
            chat_addr.ip().to_string(),
            chat_addr.port(),
            "zone-1".to_string(),
            max_connections as u32,
            0,
        )
        .await;

    let srv = chat_server.clone();
    tokio::spawn(async move {
        srv.start().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    Fabric {
        token_service,
        chat_server,
        chat_addr,
    }
}

async fn read_frame(stream: &mut TcpStream) -> (FrameType, Value) {
    let mut parser = FrameParser::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await.expect("read frame");
        assert!(n > 0, "peer closed before sending a frame");
        let frames = parser.feed(&buf[..n]).expect("valid frame");
        if let Some((header, body)) = frames.into_iter().next() {
            let frame_type = header.frame_type().expect("known frame type");
            let value: Value = serde_json::from_slice(&body).expect("json body");
            return (frame_type, value);
        }
    }
}

async fn send_json(stream: &mut TcpStream, frame_type: FrameType, body: &Value) {
    let frame = encode_json_frame(frame_type, body).unwrap();
    stream.write_all(&frame).await.unwrap();
}

#[tokio::test]
async fn s2_login_then_chat_heartbeat() {
    let fabric = spin_up(10_000).await;
    let user = Uuid::new_v4();
    let issued = fabric
        .token_service
        .generate_token(user, "D1")
        .await
        .unwrap()
        .expect("chat server has capacity");

    let mut client = TcpStream::connect(fabric.chat_addr).await.unwrap();
    send_json(
        &mut client,
        FrameType::AuthRequest,
        &json!({"token": issued.token, "client_device_id": "D1"}),
    )
    .await;

    let (frame_type, body) = read_frame(&mut client).await;
    assert_eq!(frame_type, FrameType::AuthResponse);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["user_uuid"], json!(user.to_string()));

    send_json(&mut client, FrameType::Heartbeat, &json!({"timestamp": 0})).await;
    let (frame_type, _) = tokio::time::timeout(Duration::from_secs(1), read_frame(&mut client))
        .await
        .expect("heartbeat reply within 1s");
    assert_eq!(frame_type, FrameType::Heartbeat);
}

#[tokio::test]
async fn s5_duplicate_login_preempts_the_first_session() {
    let fabric = spin_up(10_000).await;
    let user = Uuid::new_v4();

    let token_d1 = fabric.token_service.generate_token(user, "D1").await.unwrap().unwrap();
    let mut client_d1 = TcpStream::connect(fabric.chat_addr).await.unwrap();
    send_json(
        &mut client_d1,
        FrameType::AuthRequest,
        &json!({"token": token_d1.token, "client_device_id": "D1"}),
    )
    .await;
    let (frame_type, body) = read_frame(&mut client_d1).await;
    assert_eq!(frame_type, FrameType::AuthResponse);
    assert_eq!(body["success"], json!(true));

    let token_d2 = fabric.token_service.generate_token(user, "D2").await.unwrap().unwrap();
    let mut client_d2 = TcpStream::connect(fabric.chat_addr).await.unwrap();
    send_json(
        &mut client_d2,
        FrameType::AuthRequest,
        &json!({"token": token_d2.token, "client_device_id": "D2"}),
    )
    .await;
    let (frame_type, body) = read_frame(&mut client_d2).await;
    assert_eq!(frame_type, FrameType::AuthResponse);
    assert_eq!(body["success"], json!(true));

    // The first session must observe a close within one second.
    let mut buf = [0u8; 16];
    let closed = tokio::time::timeout(Duration::from_secs(1), client_d1.read(&mut buf))
        .await
        .expect("first session closes promptly")
        .unwrap();
    assert_eq!(closed, 0, "first session should see EOF once preempted");

    // The second session is still registered and reachable.
    assert!(fabric.chat_server.get(user).await.is_some());
}

#[tokio::test]
async fn s6_oversize_frame_closes_the_session_with_an_error() {
    let fabric = spin_up(10_000).await;
    let user = Uuid::new_v4();
    let issued = fabric.token_service.generate_token(user, "D1").await.unwrap().unwrap();

    let mut client = TcpStream::connect(fabric.chat_addr).await.unwrap();
    send_json(
        &mut client,
        FrameType::AuthRequest,
        &json!({"token": issued.token, "client_device_id": "D1"}),
    )
    .await;
    let (frame_type, _) = read_frame(&mut client).await;
    assert_eq!(frame_type, FrameType::AuthResponse);

    let mut oversize_header = BytesMut::with_capacity(HEADER_LEN);
    oversize_header.put_u32_le(MAGIC);
    oversize_header.put_u16_le(PROTOCOL_VERSION);
    oversize_header.put_u16_le(FrameType::ChatMessage as u16);
    oversize_header.put_u32_le((1 << 20) + 1);
    oversize_header.put_u64_le(0);
    oversize_header.put_u32_le(0);
    client.write_all(&oversize_header).await.unwrap();

    let (frame_type, body) = read_frame(&mut client).await;
    assert_eq!(frame_type, FrameType::ErrorMessage);
    assert_eq!(body["error"], json!("Invalid message header"));

    let mut buf = [0u8; 16];
    let closed = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
        .await
        .expect("session closes after the error")
        .unwrap();
    assert_eq!(closed, 0);
}

#[tokio::test]
async fn rejects_connections_past_max_connections() {
    let fabric = spin_up(1).await;
    let user1 = Uuid::new_v4();
    let issued1 = fabric.token_service.generate_token(user1, "D1").await.unwrap().unwrap();

    let mut first = TcpStream::connect(fabric.chat_addr).await.unwrap();
    send_json(
        &mut first,
        FrameType::AuthRequest,
        &json!({"token": issued1.token, "client_device_id": "D1"}),
    )
    .await;
    let (frame_type, _) = read_frame(&mut first).await;
    assert_eq!(frame_type, FrameType::AuthResponse);

    // The acceptor rejects the second connection outright once at capacity;
    // the peer observes a close with no frame at all.
    let mut second = TcpStream::connect(fabric.chat_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let closed = tokio::time::timeout(Duration::from_secs(1), second.read(&mut buf))
        .await
        .expect("second connection is closed promptly")
        .unwrap();
    assert_eq!(closed, 0);
}
