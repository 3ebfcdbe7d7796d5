//! One signaling connection: WebSocket in, peer session out.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::server::AppState;
use super::{SignalingMessage, SignalingState};
use crate::bridge::{BridgeConfig, MediaBridge};
use crate::error::{RelayError, Result};
use crate::registry::{
    KeyframeRequests, LocalTrack, PeerEvent, PeerSession, TrackCodec, WebRtcTransport,
};

/// Stream ID shared by every relayed track.
const STREAM_ID: &str = "relay";

/// Drive a freshly upgraded signaling socket until either side goes away.
pub async fn serve_socket(socket: WebSocket, state: AppState) {
    let cancel = state.shutdown.child_token();
    let (mut sink, stream) = socket.split();

    let (outbound_tx, mut outbound) = mpsc::unbounded_channel::<SignalingMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(event = message.event(), error = %e, "failed to encode signaling message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let (events_tx, events) = mpsc::unbounded_channel();
    let transport = match WebRtcTransport::connect(&state.config.ice_servers, events_tx).await {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            tracing::warn!(error = %e, "failed to create peer connection");
            writer.abort();
            return;
        }
    };

    let session = PeerSession::new(transport, outbound_tx);
    let connection = Connection {
        state,
        session,
        cancel,
    };
    connection.run(stream, events).await;

    // The session and its outbound sender are gone; the writer drains out.
    if let Err(e) = writer.await {
        tracing::debug!(error = %e, "signaling writer ended abnormally");
    }
}

struct Connection {
    state: AppState,
    session: Arc<PeerSession>,
    cancel: CancellationToken,
}

impl Connection {
    async fn run(
        self,
        mut stream: SplitStream<WebSocket>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let session_id = self.session.id().to_string();
        tracing::info!(%session_id, "signaling connection opened");

        self.session.set_state(SignalingState::Negotiating);
        self.state.registry.add_session(self.session.clone()).await;

        let mut events_open = true;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = self.handle_text(&text).await {
                            tracing::warn!(%session_id, error = %e, "closing signaling connection");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(%session_id, error = %e, "signaling socket error");
                        break;
                    }
                },
                event = events.recv(), if events_open => match event {
                    Some(PeerEvent::Candidate(candidate)) => {
                        if self.session.send(SignalingMessage::Candidate(candidate)).is_err() {
                            break;
                        }
                    }
                    Some(PeerEvent::Failed) => {
                        tracing::warn!(%session_id, "peer connection failed");
                        if let Err(e) = self.session.transport().close().await {
                            tracing::debug!(%session_id, error = %e, "closing failed peer connection");
                        }
                    }
                    Some(PeerEvent::Closed) => {
                        let registry = self.state.registry.clone();
                        tokio::spawn(async move { registry.sync().await });
                    }
                    None => events_open = false,
                },
            }
        }

        // Publishes started here end with the connection.
        self.cancel.cancel();
        self.session.set_state(SignalingState::Closed);
        self.state.registry.remove_session(&session_id).await;
        if let Err(e) = self.session.transport().close().await {
            tracing::debug!(%session_id, error = %e, "closing peer connection");
        }
        tracing::info!(%session_id, "signaling connection closed");
    }

    async fn handle_text(&self, text: &str) -> Result<()> {
        let message = SignalingMessage::decode(text)?;
        tracing::debug!(session_id = %self.session.id(), event = message.event(), "signaling message");
        self.process(message).await
    }

    async fn process(&self, message: SignalingMessage) -> Result<()> {
        match message {
            SignalingMessage::Candidate(candidate) => {
                let candidate: RTCIceCandidateInit = serde_json::from_str(&candidate)?;
                self.session.transport().add_ice_candidate(candidate).await
            }
            SignalingMessage::Answer(answer) => {
                let answer: RTCSessionDescription = serde_json::from_str(&answer)?;
                self.session.transport().apply_answer(answer).await?;
                self.session.set_state(SignalingState::Stable);
                Ok(())
            }
            SignalingMessage::Publish(source) => {
                self.spawn_publish(source.trim().trim_matches('"').to_string());
                Ok(())
            }
            SignalingMessage::Offer(_) => {
                tracing::warn!(session_id = %self.session.id(), "ignoring offer from client");
                Ok(())
            }
        }
    }

    fn spawn_publish(&self, source: String) {
        let state = self.state.clone();
        let connection = self.cancel.clone();
        let publish = self.cancel.child_token();
        let session_id = self.session.id().to_string();
        tokio::spawn(async move {
            match publish_source(&state, &source, publish).await {
                Ok(()) => tracing::info!(%session_id, %source, "publish ended"),
                Err(_) if connection.is_cancelled() => {}
                Err(e) => {
                    tracing::warn!(%session_id, %source, error = %e, "publish failed, closing connection");
                    connection.cancel();
                }
            }
        });
    }
}

/// Publish `source` as a track until it ends or `cancel` fires.
///
/// `rtsp://` and `rtsps://` sources are bridged directly. Anything else
/// names a stored asset, which is restreamed first. The track is removed
/// from the registry whatever the outcome.
pub async fn publish_source(state: &AppState, source: &str, cancel: CancellationToken) -> Result<()> {
    let mut restream = None;
    let url = if source.starts_with("rtsp://") || source.starts_with("rtsps://") {
        source.to_string()
    } else {
        let asset = state.assets.fetch(source).await?;
        let provisioned = state.orchestrator.provision(asset, source, &cancel).await?;
        let url = provisioned.url.clone();
        restream = Some(provisioned);
        url
    };

    let outcome = bridge_into_registry(state, &url, cancel).await;
    if let Some(restream) = restream {
        restream.token.cancel();
    }
    outcome
}

/// Publish an RTSP source as a track that belongs to no signaling
/// connection. Returns the track id once the source is playing; the track
/// then lives until the source ends or the relay shuts down.
pub async fn publish_detached(state: &AppState, url: &str) -> Result<String> {
    let cancel = state.shutdown.child_token();
    let attached = attach(state, url, &cancel).await?;
    let track_id = attached.track.id().to_string();

    let state = state.clone();
    let url = url.to_string();
    tokio::spawn(async move {
        match attached.stream(&state, cancel).await {
            Ok(()) => tracing::info!(%url, "detached publish ended"),
            Err(RelayError::Cancelled) => tracing::debug!(%url, "detached publish cancelled"),
            Err(e) => tracing::warn!(%url, error = %e, "detached publish failed"),
        }
    });
    Ok(track_id)
}

async fn bridge_into_registry(state: &AppState, url: &str, cancel: CancellationToken) -> Result<()> {
    attach(state, url, &cancel).await?.stream(state, cancel).await
}

/// A playing source whose track is in the registry.
struct Attached {
    bridge: MediaBridge,
    track: Arc<LocalTrack>,
    keyframes: KeyframeRequests,
}

async fn attach(state: &AppState, url: &str, cancel: &CancellationToken) -> Result<Attached> {
    let bridge = tokio::select! {
        _ = cancel.cancelled() => return Err(RelayError::Cancelled),
        bridge = MediaBridge::connect(url, BridgeConfig::from_relay(&state.config)) => bridge?,
    };
    let codec = TrackCodec::from_media(bridge.describe())?;
    let (track, keyframes) = LocalTrack::new(codec, STREAM_ID);
    tracing::info!(%url, track_id = %track.id(), "publishing source");

    state.registry.add_track(track.clone()).await;
    Ok(Attached {
        bridge,
        track,
        keyframes,
    })
}

impl Attached {
    /// Forward media until the source ends or `cancel` fires, then drop the
    /// track from the registry.
    async fn stream(self, state: &AppState, cancel: CancellationToken) -> Result<()> {
        let track_id = self.track.id().to_string();
        let outcome = self.bridge.run(self.track, self.keyframes, cancel).await;
        state.registry.remove_track(&track_id).await;
        outcome
    }
}
