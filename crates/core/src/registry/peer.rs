use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry as InterceptorRegistry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;

use super::track::LocalTrack;
use crate::error::{RelayError, Result};
use crate::signaling::{SignalingMessage, SignalingState};

/// The negotiation object behind a [`PeerSession`].
///
/// Implemented by [`WebRtcTransport`]; tests substitute in-memory fakes.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn is_closed(&self) -> bool;

    /// IDs of the tracks currently attached, one entry per sender.
    async fn sent_track_ids(&self) -> Vec<String>;

    /// Detach every sender carrying `track_id`.
    async fn remove_track(&self, track_id: &str) -> Result<()>;

    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<()>;

    /// Create an offer, apply it as local description and return it as JSON.
    async fn create_offer(&self) -> Result<String>;

    async fn apply_answer(&self, answer: RTCSessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Transport-level happenings a signaling connection reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Local ICE candidate as JSON `RTCIceCandidateInit`.
    Candidate(String),
    Failed,
    Closed,
}

/// [`PeerTransport`] backed by a webrtc-rs peer connection.
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcTransport {
    /// Build a send-only peer connection and route its callbacks into
    /// `events`.
    pub async fn connect(
        ice_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut interceptors = InterceptorRegistry::new();
        interceptors = register_default_interceptors(interceptors, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptors)
            .build();

        let config = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers.to_vec(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let candidates = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let candidates = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json().map(|init| serde_json::to_string(&init)) {
                    Ok(Ok(json)) => {
                        let _ = candidates.send(PeerEvent::Candidate(json));
                    }
                    Ok(Err(e)) => tracing::warn!(error = %e, "failed to encode ICE candidate"),
                    Err(e) => tracing::warn!(error = %e, "failed to serialize ICE candidate"),
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = events.clone();
            Box::pin(async move {
                tracing::debug!(?state, "peer connection state changed");
                let event = match state {
                    RTCPeerConnectionState::Failed => PeerEvent::Failed,
                    RTCPeerConnectionState::Closed => PeerEvent::Closed,
                    _ => return,
                };
                let _ = events.send(event);
            })
        }));

        Ok(Self { pc })
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    fn is_closed(&self) -> bool {
        self.pc.connection_state() == RTCPeerConnectionState::Closed
    }

    async fn sent_track_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for sender in self.pc.get_senders().await {
            if let Some(track) = sender.track().await {
                ids.push(track.id().to_string());
            }
        }
        ids
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        for sender in self.pc.get_senders().await {
            let carries = sender
                .track()
                .await
                .is_some_and(|track| track.id() == track_id);
            if carries {
                self.pc.remove_track(&sender).await?;
            }
        }
        Ok(())
    }

    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<()> {
        let sender = self.pc.add_track(track.rtp_track()).await?;

        // Interceptors only see RTCP that is read; viewer PLIs go upstream.
        let track = Arc::downgrade(track);
        tokio::spawn(async move {
            while let Ok((packets, _)) = sender.read_rtcp().await {
                let wants_keyframe = packets
                    .iter()
                    .any(|p| p.as_any().is::<PictureLossIndication>());
                if wants_keyframe && let Some(track) = track.upgrade() {
                    track.request_keyframe();
                }
            }
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_string(&offer)?)
    }

    async fn apply_answer(&self, answer: RTCSessionDescription) -> Result<()> {
        Ok(self.pc.set_remote_description(answer).await?)
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        Ok(self.pc.add_ice_candidate(candidate).await?)
    }

    async fn close(&self) -> Result<()> {
        Ok(self.pc.close().await?)
    }
}

/// One viewer: its signaling channel, negotiation object and state.
///
/// Only the registry's synchronization pass changes the attached tracks.
pub struct PeerSession {
    id: String,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    transport: Arc<dyn PeerTransport>,
    state: Mutex<SignalingState>,
    offer_pending: AtomicBool,
}

impl PeerSession {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        outbound: mpsc::UnboundedSender<SignalingMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            outbound,
            transport,
            state: Mutex::new(SignalingState::Connecting),
            offer_pending: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn state(&self) -> SignalingState {
        *self.state.lock()
    }

    pub fn set_state(&self, next: SignalingState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!(session_id = %self.id, from = ?*state, to = ?next, "signaling state");
            *state = next;
        }
    }

    /// Closed sessions are pruned by the next synchronization pass.
    pub fn is_closed(&self) -> bool {
        self.state() == SignalingState::Closed || self.transport.is_closed()
    }

    /// Queue a message for the connection's writer.
    pub fn send(&self, message: SignalingMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| RelayError::SignalingClosed(self.id.clone()))
    }

    /// Track changes were applied but their offer has not gone out yet.
    pub(crate) fn mark_offer_pending(&self) {
        self.offer_pending.store(true, Ordering::SeqCst);
    }

    pub(crate) fn offer_pending(&self) -> bool {
        self.offer_pending.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_offer_pending(&self) {
        self.offer_pending.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeTransport;
    use super::*;

    #[test]
    fn send_fails_once_connection_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(Arc::new(FakeTransport::default()), tx);
        assert!(session.send(SignalingMessage::Offer("x".into())).is_ok());
        drop(rx);
        assert!(matches!(
            session.send(SignalingMessage::Offer("y".into())),
            Err(RelayError::SignalingClosed(id)) if id == session.id()
        ));
    }

    #[test]
    fn closed_when_state_or_transport_closed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = Arc::new(FakeTransport::default());
        let session = PeerSession::new(transport.clone(), tx);
        assert_eq!(session.state(), SignalingState::Connecting);
        assert!(!session.is_closed());

        transport.closed.store(true, Ordering::SeqCst);
        assert!(session.is_closed());

        transport.closed.store(false, Ordering::SeqCst);
        session.set_state(SignalingState::Closed);
        assert!(session.is_closed());
    }
}
