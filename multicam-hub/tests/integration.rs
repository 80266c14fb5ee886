//! Integration tests for the panel-facing WebSocket server.
//!
//! These tests start a real server, real VISCA-over-UDP camera doubles and
//! real WebSocket panels, and verify the full intent pipeline.

use futures_util::{SinkExt, StreamExt};
use multicam_hub::device::visca::{focus_nibbles, Packet, PAYLOAD_INQUIRY, PAYLOAD_REPLY};
use multicam_hub::{
    CameraSpec, DeviceLink, HubOptions, HubServer, MemoryPresetStore, RetryPolicy, ServerConfig,
    ServerMessage, SyncHub, TallyStatus, UdpVisca,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Panel = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Payloads a camera double has received, in order.
#[derive(Clone, Default)]
struct CameraLog(Arc<Mutex<Vec<Vec<u8>>>>);

impl CameraLog {
    fn payloads(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }

    /// Wait until at least `count` payloads arrived.
    async fn wait_for(&self, count: usize) -> Vec<Vec<u8>> {
        for _ in 0..200 {
            let payloads = self.payloads();
            if payloads.len() >= count {
                return payloads;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("camera saw {:?}, expected {count} payloads", self.payloads());
    }
}

/// A VISCA camera on localhost: ACK + completion for commands, focus for inquiries.
async fn start_camera(focus: u16) -> (SocketAddr, CameraLog) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let log = CameraLog::default();
    let seen = log.clone();

    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let Ok(request) = Packet::decode(&buf[..n]) else {
                continue;
            };
            seen.0.lock().unwrap().push(request.payload.clone());

            let replies: Vec<Vec<u8>> = if request.payload_type == PAYLOAD_INQUIRY {
                let [p, q, r, s] = focus_nibbles(focus);
                vec![vec![0x90, 0x50, p, q, r, s, 0xFF]]
            } else {
                vec![vec![0x90, 0x41, 0xFF], vec![0x90, 0x51, 0xFF]]
            };
            for payload in replies {
                let reply = Packet {
                    payload_type: PAYLOAD_REPLY,
                    sequence: request.sequence,
                    payload,
                };
                let _ = socket.send_to(&reply.encode(), from).await;
            }
        }
    });

    (addr, log)
}

/// Build a hub over the given camera endpoints and serve it on a free port.
async fn start_hub(cameras: &[SocketAddr]) -> (SyncHub, String) {
    let policy = RetryPolicy {
        timeout: Duration::from_millis(300),
        max_attempts: 2,
    };
    let mut specs = Vec::new();
    for (camera, addr) in cameras.iter().enumerate() {
        let visca = UdpVisca::connect(*addr).await.unwrap();
        specs.push(CameraSpec {
            address: addr.ip().to_string(),
            link: DeviceLink::spawn(camera, visca, policy),
        });
    }
    let hub = SyncHub::new(specs, Arc::new(MemoryPresetStore::new()), HubOptions::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = HubServer::new(ServerConfig::default(), hub.clone());
    tokio::spawn(async move {
        server.serve_until(listener, std::future::pending()).await;
    });

    (hub, url)
}

async fn connect(url: &str) -> Panel {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("panel should connect");
    ws
}

/// Next text frame, as raw text.
async fn recv_text(panel: &mut Panel) -> String {
    loop {
        let frame = timeout(Duration::from_secs(3), panel.next())
            .await
            .expect("no frame within 3s")
            .expect("connection closed")
            .expect("read error");
        if let Message::Text(text) = frame {
            return text.as_str().to_string();
        }
    }
}

async fn recv(panel: &mut Panel) -> ServerMessage {
    ServerMessage::decode(&recv_text(panel).await).unwrap()
}

/// Assert nothing arrives for a short while.
async fn assert_silent(panel: &mut Panel) {
    let quiet = timeout(Duration::from_millis(200), panel.next()).await;
    assert!(quiet.is_err(), "unexpected frame: {quiet:?}");
}

async fn send(panel: &mut Panel, value: Value) {
    panel.send(Message::text(value.to_string())).await.unwrap();
}

async fn connect_and_init(url: &str) -> Panel {
    let mut panel = connect(url).await;
    assert!(matches!(recv(&mut panel).await, ServerMessage::Init(_)));
    panel
}

#[tokio::test]
async fn test_panel_receives_init_snapshot() {
    let (cam0, _) = start_camera(0x0100).await;
    let (cam1, _) = start_camera(0x0200).await;
    let (_hub, url) = start_hub(&[cam0, cam1]).await;

    let mut panel = connect(&url).await;
    let ServerMessage::Init(snapshot) = recv(&mut panel).await else {
        panic!("first frame must be init");
    };
    assert_eq!(snapshot.camera_addresses, vec!["127.0.0.1", "127.0.0.1"]);
    assert!(snapshot.all_presets.is_empty());
    assert_eq!(snapshot.tally_states, vec![TallyStatus::Unknown; 2]);
}

#[tokio::test]
async fn test_update_button_relayed_verbatim_to_others() {
    let (cam0, _) = start_camera(0).await;
    let (_hub, url) = start_hub(&[cam0]).await;

    let mut alice = connect_and_init(&url).await;
    let mut bob = connect_and_init(&url).await;

    let raw = r#"{"event":"update_button","data":{"cam":0,"pos":3,"name":"Pulpit","btn_class":"btn-primary"}}"#;
    alice.send(Message::text(raw.to_string())).await.unwrap();

    assert_eq!(recv_text(&mut bob).await, raw);
    assert_silent(&mut bob).await;
    assert_silent(&mut alice).await;

    // Late joiners see the merged state in their snapshot
    let mut carol = connect(&url).await;
    let ServerMessage::Init(snapshot) = recv(&mut carol).await else {
        panic!("first frame must be init");
    };
    let row = &snapshot.all_presets[0];
    assert_eq!((row.camera, row.slot, row.focus), (0, 3, None));
    assert_eq!(row.button["name"], "Pulpit");
}

#[tokio::test]
async fn test_save_then_recall_drives_camera() {
    let (cam0, log) = start_camera(0x0C3F).await;
    let (hub, url) = start_hub(&[cam0]).await;
    let mut panel = connect_and_init(&url).await;

    send(&mut panel, json!({"event": "save_pos", "data": {"cam": 0, "pos": 5}})).await;
    let payloads = log.wait_for(2).await;
    assert_eq!(payloads[0], vec![0x81, 0x09, 0x04, 0x48, 0xFF]);
    assert_eq!(payloads[1], vec![0x81, 0x01, 0x04, 0x3F, 0x01, 0x05, 0xFF]);

    send(&mut panel, json!({"event": "recall_pos", "data": {"cam": 0, "pos": 5}})).await;
    let payloads = log.wait_for(5).await;
    assert_eq!(payloads[2], vec![0x81, 0x01, 0x04, 0x3F, 0x02, 0x05, 0xFF]);
    assert_eq!(payloads[3], vec![0x81, 0x01, 0x04, 0x38, 0x03, 0xFF]);
    assert_eq!(payloads[4], vec![0x81, 0x01, 0x04, 0x48, 0x00, 0x0C, 0x03, 0x0F, 0xFF]);

    let snapshot = hub.snapshot().await.unwrap();
    assert_eq!(snapshot.all_presets[0].focus, Some(0x0C3F));
    assert_silent(&mut panel).await;
}

#[tokio::test]
async fn test_recall_without_preset_reports_not_found() {
    let (cam0, log) = start_camera(0).await;
    let (_hub, url) = start_hub(&[cam0]).await;
    let mut alice = connect_and_init(&url).await;
    let mut bob = connect_and_init(&url).await;

    send(&mut alice, json!({"event": "recall_pos", "data": {"cam": 0, "pos": 5}})).await;

    let ServerMessage::Error(failure) = recv(&mut alice).await else {
        panic!("expected an error reply");
    };
    assert_eq!(failure.event, "recall_pos");
    assert_eq!(failure.kind, "not_found");
    assert_eq!((failure.camera, failure.slot), (Some(0), Some(5)));
    assert!(log.payloads().is_empty());
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_bad_frames_are_dropped_and_connection_stays_open() {
    let (cam0, _) = start_camera(0).await;
    let (_hub, url) = start_hub(&[cam0]).await;
    let mut panel = connect_and_init(&url).await;

    panel.send(Message::text("{not json".to_string())).await.unwrap();
    send(&mut panel, json!({"event": "clear_all", "data": null})).await;
    send(&mut panel, json!({"event": "save_pos", "data": {"cam": "zero"}})).await;
    assert_silent(&mut panel).await;

    // Still served
    send(&mut panel, json!({"event": "save_pos", "data": {"cam": 7, "pos": 1}})).await;
    let ServerMessage::Error(failure) = recv(&mut panel).await else {
        panic!("expected an error reply");
    };
    assert_eq!(failure.kind, "unknown_camera");
}

#[tokio::test]
async fn test_power_reports_partial_failure() {
    let (cam0, log0) = start_camera(0).await;
    // Nothing answers on this port
    let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let (hub, url) = start_hub(&[cam0, dead_addr]).await;
    let mut panel = connect_and_init(&url).await;

    send(&mut panel, json!({"event": "power_on", "data": {}})).await;

    let ServerMessage::Error(failure) = recv(&mut panel).await else {
        panic!("expected an error reply");
    };
    assert_eq!(failure.event, "power_on");
    assert_eq!(failure.kind, "partial");
    assert!(failure.message.starts_with("1 of 2"), "{}", failure.message);

    assert_eq!(log0.payloads(), vec![vec![0x81, 0x01, 0x04, 0x00, 0x02, 0xFF]]);
    assert_eq!(hub.camera_status(0).await.unwrap().power, multicam_hub::Switch::On);
    assert_eq!(hub.camera_status(1).await.unwrap().power, multicam_hub::Switch::Unknown);
}

#[tokio::test]
async fn test_tally_change_reaches_every_panel() {
    let (cam0, _) = start_camera(0).await;
    let (cam1, _) = start_camera(0).await;
    let (cam2, _) = start_camera(0).await;
    let (hub, url) = start_hub(&[cam0, cam1, cam2]).await;
    let mut alice = connect_and_init(&url).await;
    let mut bob = connect_and_init(&url).await;

    hub.on_tally_change(1, TallyStatus::Program).await;

    for panel in [&mut alice, &mut bob] {
        assert_eq!(
            recv_text(panel).await,
            r#"{"event":"update_tally","data":[-1,2,-1]}"#
        );
    }
}

#[tokio::test]
async fn test_disconnect_leaves_registry() {
    let (cam0, _) = start_camera(0).await;
    let (hub, url) = start_hub(&[cam0]).await;

    let mut panel = connect_and_init(&url).await;
    assert_eq!(hub.registry().session_count().await, 1);

    panel.close(None).await.unwrap();
    for _ in 0..100 {
        if hub.registry().session_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session still registered after close");
}
