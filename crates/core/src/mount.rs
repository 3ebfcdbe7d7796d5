use parking_lot::{Mutex, RwLock};

use crate::media::Packetizer;

/// The stream path an RTSP client asks for (e.g. `/clip`).
///
/// A restream endpoint serves exactly one mount. It owns the packetizer,
/// so DESCRIBE, RTP-Info and the pump all see the same sequence and
/// timestamp state, and it remembers which sessions subscribed via SETUP.
pub struct Mount {
    path: String,
    packetizer: Mutex<Box<dyn Packetizer>>,
    session_ids: RwLock<Vec<String>>,
}

impl Mount {
    pub fn new(path: &str, packetizer: Box<dyn Packetizer>) -> Self {
        Self {
            path: path.to_string(),
            packetizer: Mutex::new(packetizer),
            session_ids: RwLock::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether an RTSP request URI addresses this mount (track suffixes
    /// such as `/track1` included).
    pub fn matches(&self, uri: &str) -> bool {
        extract_mount_path(uri) == self.path
    }

    /// Packetize raw encoded data into RTP packets using this mount's codec.
    pub fn packetize(&self, data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        self.packetizer.lock().packetize(data, timestamp_increment)
    }

    /// Let the packetizer learn codec parameters ahead of the first frame.
    pub fn observe(&self, data: &[u8]) {
        self.packetizer.lock().observe(data)
    }

    pub fn payload_type(&self) -> u8 {
        self.packetizer.lock().payload_type()
    }

    pub fn sdp_attributes(&self) -> Vec<String> {
        self.packetizer.lock().sdp_attributes()
    }

    pub fn clock_rate(&self) -> u32 {
        self.packetizer.lock().clock_rate()
    }

    /// Next RTP sequence number (for RTP-Info header).
    pub fn next_sequence(&self) -> u16 {
        self.packetizer.lock().next_sequence()
    }

    /// Next RTP timestamp (for RTP-Info header).
    pub fn next_rtp_timestamp(&self) -> u32 {
        self.packetizer.lock().next_rtp_timestamp()
    }

    /// Subscribe a session to this mount (called during SETUP).
    pub fn subscribe(&self, session_id: &str) {
        let mut ids = self.session_ids.write();
        if !ids.iter().any(|id| id == session_id) {
            ids.push(session_id.to_string());
            tracing::debug!(mount = %self.path, session_id, "session subscribed");
        }
    }

    /// Unsubscribe a session (called during TEARDOWN or disconnect).
    pub fn unsubscribe(&self, session_id: &str) {
        let mut ids = self.session_ids.write();
        if let Some(pos) = ids.iter().position(|id| id == session_id) {
            ids.swap_remove(pos);
            tracing::debug!(mount = %self.path, session_id, "session unsubscribed");
        }
    }

    pub fn subscribed_session_ids(&self) -> Vec<String> {
        self.session_ids.read().clone()
    }
}

/// Extract the mount path from an RTSP URI.
///
/// `rtsp://host:8600/clip/track1` → `/clip`
/// `rtsp://host:8600/clip/`       → `/clip`
/// `rtsp://host:8600`             → `/`
/// `*`                            → `/`
pub fn extract_mount_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        after.find('/').map_or("/", |slash| &after[slash..])
    } else if uri.starts_with('/') {
        uri
    } else {
        "/"
    };

    // Strip track suffix: /clip/track1 → /clip
    let path = match path.rfind("/track") {
        Some(pos) => &path[..pos],
        None => path,
    };
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::h264::H264Packetizer;

    fn mount(path: &str) -> Mount {
        Mount::new(path, Box::new(H264Packetizer::new(96, 0x1234)))
    }

    #[test]
    fn extract_path_full_uri() {
        assert_eq!(extract_mount_path("rtsp://localhost:8600/clip"), "/clip");
    }

    #[test]
    fn extract_path_with_track() {
        assert_eq!(
            extract_mount_path("rtsp://10.0.0.1:8600/clip/track1"),
            "/clip"
        );
    }

    #[test]
    fn extract_path_trailing_slash() {
        assert_eq!(extract_mount_path("rtsp://localhost:8600/clip/"), "/clip");
    }

    #[test]
    fn extract_path_without_path() {
        assert_eq!(extract_mount_path("rtsp://localhost:8600"), "/");
        assert_eq!(extract_mount_path("*"), "/");
        assert_eq!(extract_mount_path("/camera1"), "/camera1");
    }

    #[test]
    fn matches_own_uris_only() {
        let m = mount("/clip");
        assert!(m.matches("rtsp://127.0.0.1:8600/clip"));
        assert!(m.matches("rtsp://127.0.0.1:8600/clip/track1"));
        assert!(!m.matches("rtsp://127.0.0.1:8600/other"));
    }

    #[test]
    fn subscribe_unsubscribe() {
        let m = mount("/clip");
        m.subscribe("session1");
        m.subscribe("session2");
        m.subscribe("session2");
        assert_eq!(m.subscribed_session_ids().len(), 2);

        m.unsubscribe("session1");
        assert_eq!(m.subscribed_session_ids(), vec!["session2"]);
    }
}
