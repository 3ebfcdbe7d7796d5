use std::time::Duration;

/// Inclusive range of local ports the orchestrator may bind restream
/// endpoints on. A range of `0..=0` lets the OS pick an ephemeral port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Let the OS allocate the port.
    pub fn ephemeral() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }

    /// Parse `"8600-8700"`, a single port, or `"0"` for ephemeral.
    pub fn parse(value: &str) -> Option<Self> {
        match value.split_once('-') {
            Some((start, end)) => {
                let start = start.trim().parse().ok()?;
                let end = end.trim().parse().ok()?;
                (start <= end).then_some(Self { start, end })
            }
            None => {
                let port = value.trim().parse().ok()?;
                Some(Self {
                    start: port,
                    end: port,
                })
            }
        }
    }
}

/// Relay-wide configuration.
///
/// Built by the CLI from flags and environment variables; every field has a
/// usable default so tests can start from [`RelayConfig::default`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the signaling HTTP server listens on.
    pub listen_addr: String,
    /// Prefix for restream URLs; the bound port and mount are appended
    /// (`rtsp://127.0.0.1` → `rtsp://127.0.0.1:8600/clip`).
    pub rtsp_host_pattern: String,
    /// Interface restream endpoints bind on.
    pub restream_bind_host: String,
    /// Ports available to restream endpoints.
    pub restream_ports: PortRange,
    /// Frame rate used to pace stored assets into their endpoint.
    pub restream_fps: u32,
    /// How long an endpoint waits for its first viewer before giving up.
    pub restream_start_timeout: Duration,
    /// Bound on RTSP TCP connect.
    pub dial_timeout: Duration,
    /// Bound on each RTSP request/response exchange.
    pub read_timeout: Duration,
    /// Maximum silence on an RTSP media connection before it is considered dead.
    pub media_timeout: Duration,
    /// Interval between RTSP GET_PARAMETER keepalives sent by the bridge.
    pub keepalive_interval: Duration,
    /// Interval between keyframe requests to every inbound source.
    pub keyframe_interval: Duration,
    /// Attempts a synchronization pass makes before deferring.
    pub sync_max_attempts: u32,
    /// Delay before a deferred synchronization retry.
    pub sync_backoff: Duration,
    /// STUN/TURN URLs handed to every peer connection.
    pub ice_servers: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            rtsp_host_pattern: "rtsp://127.0.0.1".to_string(),
            restream_bind_host: "127.0.0.1".to_string(),
            restream_ports: PortRange::new(8600, 8700),
            restream_fps: 30,
            restream_start_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(3),
            media_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(20),
            keyframe_interval: Duration::from_secs(2),
            sync_max_attempts: 25,
            sync_backoff: Duration::from_secs(3),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}
