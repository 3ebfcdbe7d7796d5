//! Signaling over a real WebSocket against the HTTP router.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MemoryStore, eventually, h264_clip, local_config};
use futures_util::{SinkExt, StreamExt};
use relay::{AllowAll, AppState, ConnectionGate, CookieTokenGate, SignalingMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

async fn start(gate: Arc<dyn ConnectionGate>) -> (AppState, u16) {
    let shutdown = CancellationToken::new();
    let state = AppState::new(
        local_config(),
        Arc::new(MemoryStore::with("clip.mp4", h264_clip(900))),
        gate,
        shutdown,
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(relay::signaling::serve(state.clone(), listener));
    (state, port)
}

#[tokio::test]
async fn publish_produces_an_offer_with_video() {
    let (state, port) = start(Arc::new(AllowAll)).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/websocket"))
        .await
        .unwrap();
    assert!(eventually(|| state.registry.snapshot().session_ids.len() == 1).await);

    let publish = SignalingMessage::Publish("\"clip.mp4\"".to_string());
    socket
        .send(Message::text(publish.encode().unwrap()))
        .await
        .unwrap();

    let offer = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(message) = socket.next().await {
            let message = message.unwrap();
            let Ok(text) = message.to_text() else { continue };
            if let Ok(SignalingMessage::Offer(offer)) = SignalingMessage::decode(text) {
                return offer;
            }
        }
        panic!("socket closed before an offer arrived");
    })
    .await
    .unwrap();

    let offer: RTCSessionDescription = serde_json::from_str(&offer).unwrap();
    assert!(offer.sdp.contains("m=video"));
    assert!(offer.sdp.contains("H264"));
    assert_eq!(state.registry.snapshot().track_ids.len(), 1);

    socket.close(None).await.unwrap();
    assert!(eventually(|| state.registry.snapshot().session_ids.is_empty()).await);
    // The connection's publish ends with it.
    assert!(eventually(|| state.registry.snapshot().track_ids.is_empty()).await);
    state.shutdown.cancel();
}

#[tokio::test]
async fn malformed_message_closes_the_connection() {
    let (state, port) = start(Arc::new(AllowAll)).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/websocket"))
        .await
        .unwrap();

    socket
        .send(Message::text(r#"{"event":"bogus","data":"x"}"#))
        .await
        .unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert!(eventually(|| state.registry.snapshot().session_ids.is_empty()).await);
    state.shutdown.cancel();
}

#[tokio::test]
async fn gate_rejects_missing_cookie() {
    let gate = CookieTokenGate::new("relay_token", ["letmein".to_string()]);
    let (state, port) = start(Arc::new(gate)).await;

    let err = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/websocket"))
        .await
        .err()
        .unwrap();
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("unexpected error: {other}"),
    }
    assert!(state.registry.snapshot().session_ids.is_empty());
    state.shutdown.cancel();
}

async fn post(port: u16, path: &str, body: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn stream_endpoint_provisions_restreams() {
    let (state, port) = start(Arc::new(AllowAll)).await;

    let response = post(port, "/stream", r#"{"source_video":"clip.mp4"}"#).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("\"rtsp_url\":\"rtsp://127.0.0.1:"));
    assert!(response.contains("/clip\""));

    let response = post(port, "/stream", r#"{"source_video":"nope.mp4"}"#).await;
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");

    let response = post(port, "/stream", r#"{"source_video":""}"#).await;
    assert!(response.starts_with("HTTP/1.1 404") || response.starts_with("HTTP/1.1 400"), "{response}");

    state.shutdown.cancel();
}

#[tokio::test]
async fn publish_endpoint_outlives_any_viewer() {
    let (state, port) = start(Arc::new(AllowAll)).await;
    let source = state
        .orchestrator
        .provision(h264_clip(900), "clip.mp4", &state.shutdown.child_token())
        .await
        .unwrap();

    let body = format!(r#"{{"rtsp_url":"{}"}}"#, source.url);
    let response = post(port, "/publish", &body).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("\"track_id\":\""));
    assert_eq!(state.registry.snapshot().track_ids.len(), 1);
    assert!(state.registry.snapshot().session_ids.is_empty());

    // A viewer that comes and goes leaves the track in place.
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/websocket"))
        .await
        .unwrap();
    assert!(eventually(|| state.registry.snapshot().session_ids.len() == 1).await);
    socket.close(None).await.unwrap();
    assert!(eventually(|| state.registry.snapshot().session_ids.is_empty()).await);
    assert_eq!(state.registry.snapshot().track_ids.len(), 1);

    state.shutdown.cancel();
    assert!(eventually(|| state.registry.snapshot().track_ids.is_empty()).await);
}

#[tokio::test]
async fn publish_endpoint_reports_unreachable_sources() {
    let (state, port) = start(Arc::new(AllowAll)).await;
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_port = unused.local_addr().unwrap().port();
    drop(unused);

    let body = format!(r#"{{"rtsp_url":"rtsp://127.0.0.1:{closed_port}/cam"}}"#);
    let response = post(port, "/publish", &body).await;
    assert!(response.starts_with("HTTP/1.1 502"), "{response}");
    assert!(response.contains("\"error\":"));

    let response = post(port, "/publish", r#"{"rtsp_url":"http://127.0.0.1/cam"}"#).await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");

    assert!(state.registry.snapshot().track_ids.is_empty());
    state.shutdown.cancel();
}
