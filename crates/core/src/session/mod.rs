//! RTSP session management for the restream endpoint (RFC 2326 §3, §12.37).
//!
//! An RTSP session is a server-side state object created during SETUP and
//! destroyed by TEARDOWN or when its connection drops. It tracks:
//!
//! - A random session ID (hex string, returned in the `Session` header).
//! - The playback state: Ready -> Playing <-> Paused.
//! - The [`Transport`] negotiated during SETUP (UDP or interleaved TCP).
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! SETUP          -> Ready
//! PLAY           -> Playing
//! PAUSE          -> Paused   (from Playing)
//! PLAY           -> Playing  (from Paused)
//! TEARDOWN       -> (removed)
//! TCP disconnect -> (removed, via cleanup)
//! ```

pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;

pub use transport::{Transport, TransportHeader};

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// RTSP session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created via SETUP, not yet playing.
    Ready,
    /// Media is being delivered.
    Playing,
    /// Delivery suspended; can resume via PLAY.
    Paused,
}

/// A single RTSP session.
#[derive(Debug)]
pub struct Session {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    /// The RTSP URI this session was created for (from the SETUP request).
    pub uri: String,
    pub transport: RwLock<Option<Transport>>,
    pub state: RwLock<SessionState>,
    pub timeout_secs: u64,
}

impl Session {
    pub fn new(uri: &str) -> Self {
        Session {
            id: format!("{:016X}", rand::random::<u64>()),
            uri: uri.to_string(),
            transport: RwLock::new(None),
            state: RwLock::new(SessionState::Ready),
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
        }
    }

    pub fn set_transport(&self, transport: Transport) {
        tracing::debug!(session_id = %self.id, transport = %transport.response_header(), "transport configured");
        *self.transport.write() = Some(transport);
    }

    pub fn get_transport(&self) -> Option<Transport> {
        self.transport.read().clone()
    }

    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        tracing::debug!(session_id = %self.id, old_state = ?*current, new_state = ?state, "state transition");
        *current = state;
    }

    pub fn get_state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_playing(&self) -> bool {
        self.get_state() == SessionState::Playing
    }

    /// `Session` response header value, e.g. `"3F2A9C0D11E4B7A8;timeout=60"`.
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }
}

/// Registry of the sessions on one restream endpoint.
///
/// Cloning shares the same registry. Besides lookups it lets the pump
/// wait until the first viewer starts playing.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    playing: Arc<Notify>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new session for the given URI and register it.
    pub fn create_session(&self, uri: &str) -> Arc<Session> {
        let session = Arc::new(Session::new(uri));
        let mut sessions = self.sessions.write();
        sessions.insert(session.id.clone(), session.clone());
        tracing::debug!(session_id = %session.id, uri, total_sessions = sessions.len(), "session created");
        session
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove and return a session by ID (used by TEARDOWN).
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }

    /// Remove multiple sessions at once (used during TCP disconnect cleanup).
    pub fn remove_sessions(&self, ids: &[String]) -> usize {
        let mut sessions = self.sessions.write();
        let removed = ids.iter().filter(|id| sessions.remove(*id).is_some()).count();
        if removed > 0 {
            tracing::debug!(removed, remaining = sessions.len(), "batch session cleanup");
        }
        removed
    }

    /// Move a session to [`SessionState::Playing`] and wake anyone waiting
    /// in [`wait_for_playing`](Self::wait_for_playing).
    pub fn start_playing(&self, session: &Session) {
        session.set_state(SessionState::Playing);
        self.playing.notify_waiters();
    }

    pub fn get_playing_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_playing())
            .cloned()
            .collect()
    }

    /// Resolve once at least one session is playing.
    pub async fn wait_for_playing(&self) {
        loop {
            let notified = self.playing.notified();
            if self.sessions.read().values().any(|s| s.is_playing()) {
                return;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn session_ids_are_unique_hex() {
        let a = Session::new("rtsp://h/clip");
        let b = Session::new("rtsp://h/clip");
        assert_eq!(a.id.len(), 16);
        assert!(a.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn header_value_carries_timeout() {
        let s = Session::new("rtsp://h/clip");
        assert_eq!(s.session_header_value(), format!("{};timeout=60", s.id));
    }

    #[test]
    fn create_get_remove() {
        let manager = SessionManager::new();
        let s = manager.create_session("rtsp://h/clip");
        assert!(manager.get_session(&s.id).is_some());
        assert_eq!(manager.remove_sessions(&[s.id.clone(), "missing".into()]), 1);
        assert!(manager.remove_session(&s.id).is_none());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn wait_for_playing_wakes_on_play() {
        let manager = SessionManager::new();
        let session = manager.create_session("rtsp://h/clip");

        let waiter = tokio::spawn({
            let manager = manager.clone();
            async move { manager.wait_for_playing().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        manager.start_playing(&session);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert_eq!(manager.get_playing_sessions().len(), 1);
    }
}
