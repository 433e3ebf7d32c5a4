use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use mentat_router::expert::{FrameInfoExpert, MotionExpert};
use mentat_router::protocol::{self, FrameHeader, ServerMessage};
use mentat_router::{
    CameraId, ConnectionStatus, ExpertRegistry, ExpertSchedule, Router, RouterServer,
    RouterSettings, ServerConfig, ServerHandle,
};

struct Client {
    ws: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = tungstenite::connect(format!("ws://{}", addr)).expect("connect");
        if let MaybeTlsStream::Plain(stream) = ws.get_ref() {
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
        }
        Self { ws }
    }

    fn send(&mut self, value: Value) {
        self.ws.send(Message::text(value.to_string())).unwrap();
    }

    fn recv(&mut self) -> ServerMessage {
        loop {
            match self.ws.read().expect("read") {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Close(_) => panic!("server closed the connection"),
                _ => {}
            }
        }
    }

    fn request(&mut self, value: Value) -> ServerMessage {
        self.send(value);
        self.recv()
    }

    /// Skip messages until one matches.
    fn recv_until(&mut self, mut pred: impl FnMut(&ServerMessage) -> bool) -> ServerMessage {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let message = self.recv();
            if pred(&message) {
                return message;
            }
        }
        panic!("no matching message before deadline");
    }
}

fn start() -> (Arc<Router>, ServerHandle) {
    start_with(ServerConfig::default())
}

fn start_with(cfg: ServerConfig) -> (Arc<Router>, ServerHandle) {
    let mut experts = ExpertRegistry::new();
    experts
        .register(
            FrameInfoExpert::new("info"),
            ExpertSchedule::every(Duration::from_millis(10)),
        )
        .unwrap();
    experts
        .register(
            MotionExpert::new("motion"),
            ExpertSchedule::every(Duration::from_millis(50)),
        )
        .unwrap();
    let router = Arc::new(Router::new(experts, RouterSettings::default()));
    let cfg = ServerConfig {
        addr: "127.0.0.1:0".to_string(),
        ..cfg
    };
    let handle = RouterServer::new(cfg, router.clone()).spawn().expect("spawn");
    (router, handle)
}

fn frame_json(camera: Value, expert: Value, bytes: &[u8]) -> Value {
    json!({
        "type": "frame",
        "camera_id": camera,
        "expert_target": expert,
        "frame": protocol::encode_payload(bytes),
    })
}

fn is_error(message: &ServerMessage, expected: &str) -> bool {
    matches!(message, ServerMessage::Error { kind, .. } if kind == expected)
}

#[test]
fn camera_frames_become_queryable_state() {
    let (router, server) = start();
    let mut client = Client::connect(server.addr);

    let reply = client.request(json!({"type": "register", "camera_id": 7, "name": "Garage"}));
    assert_eq!(reply, ServerMessage::ack("register"));

    client.send(frame_json(json!(7), json!(["info", "motion"]), &[1, 2, 3, 4]));

    let deadline = Instant::now() + Duration::from_secs(5);
    let state = loop {
        let reply = client.request(json!({"type": "get_camera_state", "camera_id": "7"}));
        let ServerMessage::CameraState { state } = reply else {
            panic!("unexpected reply {:?}", reply);
        };
        if (state.result("info").is_some() && state.result("motion").is_some())
            || Instant::now() > deadline
        {
            break state;
        }
        std::thread::sleep(Duration::from_millis(10));
    };
    assert_eq!(state.name.as_deref(), Some("Garage"));
    assert_eq!(state.result("info").unwrap().payload.value()["bytes"], 4);
    assert!(state.result("motion").is_some());

    let reply = client.request(json!({"type": "list_cameras"}));
    assert_eq!(
        reply,
        ServerMessage::Cameras {
            camera_ids: vec![CameraId::new("7").unwrap()]
        }
    );

    let ServerMessage::Stats { stats } = client.request(json!({"type": "get_stats"})) else {
        panic!("expected stats");
    };
    assert!(stats.total_frames_processed >= 2);
    assert_eq!(stats.frames_received, 1);

    server.stop().unwrap();
    router.shutdown();
}

#[test]
fn bad_input_gets_typed_errors_and_connection_survives() {
    let (router, server) = start();
    let mut client = Client::connect(server.addr);

    let reply = client.request(json!({"type": "teleport"}));
    assert!(is_error(&reply, "malformed_message"));

    client.ws.send(Message::text("{ not json")).unwrap();
    assert!(is_error(&client.recv(), "malformed_message"));

    let reply = client.request(frame_json(json!("cam0"), json!("captioner"), &[1]));
    assert!(is_error(&reply, "unknown_expert"));

    let reply = client.request(json!({"type": "get_camera_state", "camera_id": "ghost"}));
    assert!(is_error(&reply, "unknown_camera"));

    let reply = client.request(json!({"type": "set_expert_enabled", "expert": "nope", "enabled": false}));
    assert!(is_error(&reply, "unknown_expert"));

    let reply = client.request(json!({"type": "set_processing_scale", "value": 2.0}));
    assert!(is_error(&reply, "invalid_processing_scale"));
    let reply = client.request(json!({"type": "set_processing_scale", "value": 0.25}));
    assert_eq!(reply, ServerMessage::ProcessingScale { value: 0.25 });
    assert_eq!(router.processing_scale(), 0.25);

    client.ws.send(Message::binary(vec![0u8, 0, 0])).unwrap();
    assert!(is_error(&client.recv(), "malformed_message"));

    // Still usable.
    let reply = client.request(json!({"type": "list_cameras"}));
    assert!(matches!(reply, ServerMessage::Cameras { .. }));

    server.stop().unwrap();
    router.shutdown();
}

#[test]
fn viewer_receives_pushes_and_sees_camera_disconnect() {
    let (router, server) = start();
    let mut viewer = Client::connect(server.addr);
    let mut camera = Client::connect(server.addr);

    let reply = camera.request(json!({"type": "register", "camera_id": "lobby"}));
    assert_eq!(reply, ServerMessage::ack("register"));

    let reply = viewer.request(json!({"type": "subscribe", "camera_id": "lobby"}));
    assert_eq!(reply, ServerMessage::ack("subscribe"));
    // Current state right after subscribing.
    let initial = viewer.recv_until(|m| matches!(m, ServerMessage::CameraState { .. }));
    let ServerMessage::CameraState { state } = initial else {
        unreachable!()
    };
    assert_eq!(state.status, ConnectionStatus::Connected);

    let header = FrameHeader {
        camera_id: CameraId::new("lobby").unwrap(),
        expert: "info".into(),
        capture_time: None,
    };
    let bytes = protocol::encode_binary(&header, &[5u8; 256]).unwrap();
    camera.ws.send(Message::binary(bytes)).unwrap();

    let pushed = viewer.recv_until(|m| match m {
        ServerMessage::CameraState { state } => state.result("info").is_some(),
        _ => false,
    });
    let ServerMessage::CameraState { state } = pushed else {
        unreachable!()
    };
    assert_eq!(state.result("info").unwrap().payload.value()["bytes"], 256);

    camera.ws.close(None).unwrap();
    let _ = camera.ws.flush();
    let closed = viewer.recv_until(|m| match m {
        ServerMessage::CameraState { state } => state.status == ConnectionStatus::Disconnected,
        _ => false,
    });
    let ServerMessage::CameraState { state } = closed else {
        unreachable!()
    };
    // Results survive the disconnect.
    assert!(state.result("info").is_some());

    let reply = viewer.request(json!({"type": "unsubscribe", "camera_id": "lobby"}));
    assert_eq!(reply, ServerMessage::ack("unsubscribe"));
    assert_eq!(router.get_stats().connected_subscriber_count, 1);

    server.stop().unwrap();
    router.shutdown();
}

#[test]
fn stopping_the_server_closes_sessions() {
    let (router, server) = start();
    let mut client = Client::connect(server.addr);
    client.send(json!({"type": "heartbeat", "camera_id": "cam0"}));
    let reply = client.request(json!({"type": "list_cameras"}));
    assert!(matches!(reply, ServerMessage::Cameras { camera_ids } if camera_ids.len() == 1));

    server.stop().unwrap();
    let mut closed = false;
    for _ in 0..10 {
        match client.ws.read() {
            Ok(Message::Close(_)) | Err(_) => {
                closed = true;
                break;
            }
            Ok(_) => {}
        }
    }
    assert!(closed);
    // The session's cameras are marked disconnected on close.
    assert_eq!(
        router.get_camera_state(&CameraId::new("cam0").unwrap()).unwrap().status,
        ConnectionStatus::Disconnected
    );
    router.shutdown();
}

#[test]
fn get_latest_frame_returns_newest_frame_and_state() {
    let (router, server) = start();
    let mut client = Client::connect(server.addr);

    let reply = client.request(json!({"type": "get_latest_frame", "camera_id": "yard"}));
    assert!(is_error(&reply, "unknown_camera"));

    for byte in 1..=4u8 {
        client.send(frame_json(json!("yard"), json!("info"), &[byte; 64]));
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    let (frame, state) = loop {
        let reply = client.request(json!({"type": "get_latest_frame", "camera_id": "yard"}));
        let ServerMessage::LatestFrame { frame, state, .. } = reply else {
            panic!("unexpected reply {:?}", reply);
        };
        if state.frames_received == 4 || Instant::now() > deadline {
            break (frame, state);
        }
        std::thread::sleep(Duration::from_millis(10));
    };
    assert_eq!(protocol::decode_payload(&frame).unwrap(), vec![4u8; 64]);
    assert_eq!(state.camera_id, CameraId::new("yard").unwrap());
    assert_eq!(state.frames_received, 4);

    server.stop().unwrap();
    router.shutdown();
}

#[test]
fn viewer_that_stops_reading_cannot_block_shutdown() {
    let (router, server) = start_with(ServerConfig {
        write_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    });
    // Large snapshots so unread replies fill the socket buffers quickly.
    let label = "x".repeat(1024);
    for i in 0..200 {
        router
            .register_camera(&CameraId::new(format!("cam{:03}", i)).unwrap(), Some(label.clone()))
            .unwrap();
    }

    let addr = server.addr;
    let stalled = std::thread::spawn(move || {
        let mut client = Client::connect(addr);
        if let MaybeTlsStream::Plain(stream) = client.ws.get_ref() {
            stream
                .set_write_timeout(Some(Duration::from_secs(1)))
                .unwrap();
        }
        let request = json!({"type": "snapshot_all"}).to_string();
        let mut sent = 0;
        for _ in 0..2000 {
            if client.ws.send(Message::text(request.clone())).is_err() {
                break;
            }
            sent += 1;
        }
        sent
    });

    std::thread::sleep(Duration::from_millis(1000));
    let (done_tx, done_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = done_tx.send(server.stop());
    });
    let stopped = done_rx
        .recv_timeout(Duration::from_secs(8))
        .expect("server stop returned");
    assert!(stopped.is_ok());
    assert!(stalled.join().unwrap() > 0);
    router.shutdown();
}
