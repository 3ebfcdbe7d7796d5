//! Track and peer-session registry with its renegotiation engine.
//!
//! Every mutation is followed by a synchronization pass that makes each
//! live session send exactly the registered tracks, renegotiating where
//! something changed.

pub mod peer;
pub mod track;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::error::Result;
use crate::signaling::{SignalingMessage, SignalingState};

pub use peer::{PeerEvent, PeerSession, PeerTransport, WebRtcTransport};
pub use track::{KeyframeRequests, LocalTrack, TrackCodec};

/// Retry policy of a synchronization pass.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl SyncConfig {
    pub fn from_relay(config: &RelayConfig) -> Self {
        Self {
            max_attempts: config.sync_max_attempts.max(1),
            backoff: config.sync_backoff,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_relay(&RelayConfig::default())
    }
}

/// Result of one synchronization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Converged,
    /// Attempts ran out; a deferred retry is pending.
    Deferred,
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub track_ids: Vec<String>,
    pub session_ids: Vec<String>,
}

#[derive(Default)]
struct RegistryState {
    tracks: HashMap<String, Arc<LocalTrack>>,
    sessions: Vec<Arc<PeerSession>>,
}

pub struct Registry {
    state: Mutex<RegistryState>,
    // Serializes passes so each session has one writer.
    pass_gate: tokio::sync::Mutex<()>,
    retry_pending: AtomicBool,
    config: SyncConfig,
    cancel: CancellationToken,
}

impl Registry {
    /// `cancel` stops deferred retries.
    pub fn new(config: SyncConfig, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            pass_gate: tokio::sync::Mutex::new(()),
            retry_pending: AtomicBool::new(false),
            config,
            cancel,
        })
    }

    pub async fn add_track(self: &Arc<Self>, track: Arc<LocalTrack>) -> SyncOutcome {
        tracing::info!(track_id = %track.id(), codec = %track.codec().mime_type, "track added");
        self.state
            .lock()
            .tracks
            .insert(track.id().to_string(), track);
        self.sync().await
    }

    /// Removing an unknown track is a no-op.
    pub async fn remove_track(self: &Arc<Self>, track_id: &str) -> Option<SyncOutcome> {
        self.state.lock().tracks.remove(track_id)?;
        tracing::info!(track_id, "track removed");
        Some(self.sync().await)
    }

    pub async fn add_session(self: &Arc<Self>, session: Arc<PeerSession>) -> SyncOutcome {
        tracing::info!(session_id = %session.id(), "peer session added");
        self.state.lock().sessions.push(session);
        self.sync().await
    }

    /// Removing an unknown session is a no-op.
    pub async fn remove_session(self: &Arc<Self>, session_id: &str) -> Option<SyncOutcome> {
        let removed = {
            let mut state = self.state.lock();
            let before = state.sessions.len();
            state.sessions.retain(|s| s.id() != session_id);
            before != state.sessions.len()
        };
        if !removed {
            return None;
        }
        tracing::info!(session_id, "peer session removed");
        Some(self.sync().await)
    }

    /// Run a synchronization pass, retrying failed attempts.
    ///
    /// When every attempt fails the gate is released and a single deferred
    /// retry is scheduled after the backoff.
    pub async fn sync(self: &Arc<Self>) -> SyncOutcome {
        let outcome = {
            let _gate = self.pass_gate.lock().await;
            let mut outcome = SyncOutcome::Deferred;
            for attempt in 1..=self.config.max_attempts {
                match self.attempt().await {
                    Ok(()) => {
                        outcome = SyncOutcome::Converged;
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(attempt, error = %e, "synchronization attempt failed");
                    }
                }
            }
            outcome
        };

        match outcome {
            SyncOutcome::Converged => {
                self.dispatch_keyframes();
            }
            SyncOutcome::Deferred => {
                tracing::warn!(
                    attempts = self.config.max_attempts,
                    backoff = ?self.config.backoff,
                    "synchronization did not converge, deferring"
                );
                self.schedule_retry();
            }
        }
        outcome
    }

    fn schedule_retry(self: &Arc<Self>) {
        if self.retry_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = registry.cancel.cancelled() => {
                    registry.retry_pending.store(false, Ordering::SeqCst);
                }
                _ = tokio::time::sleep(registry.config.backoff) => {
                    registry.retry_pending.store(false, Ordering::SeqCst);
                    registry.sync().await;
                }
            }
        });
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending.load(Ordering::SeqCst)
    }

    async fn attempt(&self) -> Result<()> {
        let (tracks, sessions) = {
            let mut state = self.state.lock();
            state.sessions.retain(|session| {
                let closed = session.is_closed();
                if closed {
                    tracing::debug!(session_id = %session.id(), "pruning closed session");
                }
                !closed
            });
            (state.tracks.clone(), state.sessions.clone())
        };

        for session in &sessions {
            converge(session, &tracks).await?;
        }
        Ok(())
    }

    /// Ask every track's source for a key frame. Returns how many sources
    /// are still listening.
    pub fn dispatch_keyframes(&self) -> usize {
        self.tracks()
            .iter()
            .filter(|track| track.request_keyframe())
            .count()
    }

    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.state.lock().tracks.values().cloned().collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.lock();
        let mut track_ids: Vec<String> = state.tracks.keys().cloned().collect();
        track_ids.sort();
        RegistrySnapshot {
            track_ids,
            session_ids: state.sessions.iter().map(|s| s.id().to_string()).collect(),
        }
    }
}

/// Bring one session's senders in line with `tracks` and offer if needed.
async fn converge(session: &PeerSession, tracks: &HashMap<String, Arc<LocalTrack>>) -> Result<()> {
    let transport = session.transport();
    let sent = transport.sent_track_ids().await;

    let mut seen = HashSet::new();
    let mut to_remove = HashSet::new();
    for id in &sent {
        if !tracks.contains_key(id) || !seen.insert(id.as_str()) {
            to_remove.insert(id.as_str());
        }
    }

    let mut changed = false;
    for id in &to_remove {
        transport.remove_track(id).await?;
        changed = true;
    }

    // Duplicates were removed wholesale and are re-added once.
    for (id, track) in tracks {
        if !seen.contains(id.as_str()) || to_remove.contains(id.as_str()) {
            transport.add_track(track).await?;
            changed = true;
        }
    }

    if changed {
        session.mark_offer_pending();
    }
    if session.offer_pending() {
        let offer = transport.create_offer().await?;
        if let Err(e) = session.send(SignalingMessage::Offer(offer)) {
            session.set_state(SignalingState::Closed);
            return Err(e);
        }
        session.clear_offer_pending();
        session.set_state(SignalingState::Negotiating);
        tracing::debug!(session_id = %session.id(), tracks = tracks.len(), "offer sent");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::peer::testing::FakeTransport;
    use super::*;
    use tokio::sync::mpsc;

    fn h264() -> TrackCodec {
        TrackCodec {
            mime_type: "video/H264".into(),
            clock_rate: 90_000,
            fmtp: String::new(),
        }
    }

    fn registry() -> Arc<Registry> {
        Registry::new(SyncConfig::default(), CancellationToken::new())
    }

    fn session() -> (
        Arc<PeerSession>,
        Arc<FakeTransport>,
        mpsc::UnboundedReceiver<SignalingMessage>,
    ) {
        let transport = Arc::new(FakeTransport::default());
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerSession::new(transport.clone(), tx), transport, rx)
    }

    #[tokio::test]
    async fn new_session_gets_existing_tracks() {
        let registry = registry();
        let (track, _requests) = LocalTrack::new(h264(), "relay");
        registry.add_track(track.clone()).await;

        let (session, transport, mut rx) = session();
        assert_eq!(registry.add_session(session.clone()).await, SyncOutcome::Converged);

        assert_eq!(*transport.tracks.lock(), vec![track.id().to_string()]);
        assert!(matches!(rx.try_recv(), Ok(SignalingMessage::Offer(sdp)) if sdp.contains(track.id())));
        assert_eq!(session.state(), SignalingState::Negotiating);
    }

    #[tokio::test]
    async fn unchanged_sessions_are_not_renegotiated() {
        let registry = registry();
        let (session, transport, _rx) = session();
        registry.add_session(session).await;
        registry.sync().await;
        assert_eq!(transport.offers(), 0);
    }

    #[tokio::test]
    async fn stale_and_duplicate_senders_are_dropped() {
        let registry = registry();
        let (track, _requests) = LocalTrack::new(h264(), "relay");
        registry.add_track(track.clone()).await;

        let (session, transport, _rx) = session();
        transport.tracks.lock().extend([
            "gone".to_string(),
            track.id().to_string(),
            track.id().to_string(),
        ]);
        registry.add_session(session).await;

        assert_eq!(*transport.tracks.lock(), vec![track.id().to_string()]);
        assert_eq!(transport.offers(), 1);
    }

    #[tokio::test]
    async fn removing_a_track_renegotiates() {
        let registry = registry();
        let (session, transport, _rx) = session();
        registry.add_session(session).await;

        let (track, _requests) = LocalTrack::new(h264(), "relay");
        registry.add_track(track.clone()).await;
        assert_eq!(registry.remove_track(track.id()).await, Some(SyncOutcome::Converged));

        assert!(transport.tracks.lock().is_empty());
        assert_eq!(transport.offers(), 2);
        assert_eq!(registry.remove_track(track.id()).await, None);
        assert_eq!(transport.offers(), 2);
    }

    #[tokio::test]
    async fn closed_sessions_are_pruned() {
        let registry = registry();
        let (first, transport, _rx) = session();
        let (second, _, _rx2) = session();
        registry.add_session(first.clone()).await;
        registry.add_session(second.clone()).await;

        transport.closed.store(true, Ordering::SeqCst);
        registry.sync().await;
        assert_eq!(registry.snapshot().session_ids, vec![second.id().to_string()]);

        assert_eq!(registry.remove_session(first.id()).await, None);
        assert!(registry.remove_session(second.id()).await.is_some());
        assert!(registry.snapshot().session_ids.is_empty());
    }

    #[tokio::test]
    async fn dropped_signaling_channel_closes_session() {
        let registry = registry();
        let (session, _transport, rx) = session();
        registry.add_session(session.clone()).await;
        drop(rx);

        let (track, _requests) = LocalTrack::new(h264(), "relay");
        assert_eq!(registry.add_track(track).await, SyncOutcome::Converged);
        assert_eq!(session.state(), SignalingState::Closed);
        assert!(registry.snapshot().session_ids.is_empty());
    }

    #[tokio::test]
    async fn passes_dispatch_keyframe_requests() {
        let registry = registry();
        let (track, mut requests) = LocalTrack::new(h264(), "relay");
        registry.add_track(track).await;
        assert_eq!(requests.recv().await, Some(()));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_defer_a_single_retry() {
        let registry = registry();
        let (session, transport, _rx) = session();
        transport.fail_offers.store(true, Ordering::SeqCst);
        registry.add_session(session.clone()).await;

        let (track, _requests) = LocalTrack::new(h264(), "relay");
        assert_eq!(registry.add_track(track).await, SyncOutcome::Deferred);
        assert_eq!(transport.offers(), 25);
        assert!(registry.retry_pending());

        // The gate is free again and no second retry is queued.
        assert_eq!(registry.sync().await, SyncOutcome::Deferred);
        assert_eq!(transport.offers(), 50);

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(transport.offers(), 75);

        transport.fail_offers.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(transport.offers(), 76);
        assert!(!registry.retry_pending());
        assert_eq!(session.state(), SignalingState::Negotiating);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.offers(), 76);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drops_pending_retry() {
        let cancel = CancellationToken::new();
        let registry = Registry::new(SyncConfig::default(), cancel.clone());
        let (session, transport, _rx) = session();
        transport.fail_offers.store(true, Ordering::SeqCst);
        registry.add_session(session).await;
        let (track, _requests) = LocalTrack::new(h264(), "relay");
        registry.add_track(track).await;

        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.offers(), 25);
        assert!(!registry.retry_pending());
    }
}
