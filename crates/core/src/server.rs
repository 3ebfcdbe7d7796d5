use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PortRange;
use crate::error::{RelayError, Result};
use crate::mount::Mount;
use crate::protocol::framing::encode_interleaved;
use crate::session::{SessionManager, Transport};
use crate::transport::UdpTransport;
use crate::transport::tcp;

/// Protocol-level configuration of a restream endpoint.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from request URI/client address.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Restream".to_string(),
        }
    }
}

/// How long one frame may wait on slow interleaved viewers.
const FRAME_SEND_DEADLINE: Duration = Duration::from_millis(500);

/// Shared state of one endpoint: its mount, sessions and RTP socket.
///
/// Connection handlers use it to serve requests and to pass on key frame
/// requests, the pump to deliver packets. Cloning is cheap.
#[derive(Clone)]
pub struct EndpointHandle {
    pub sessions: SessionManager,
    pub mount: Arc<Mount>,
    pub udp: Arc<UdpTransport>,
    pub config: Arc<ServerConfig>,
    keyframe_requested: Arc<AtomicBool>,
}

impl EndpointHandle {
    pub async fn new(mount: Arc<Mount>, host: &str, config: ServerConfig) -> Result<Self> {
        Ok(Self {
            sessions: SessionManager::new(),
            mount,
            udp: Arc::new(UdpTransport::bind(host).await?),
            config: Arc::new(config),
            keyframe_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A viewer lost picture; the pump sends a key frame on its next tick.
    pub fn request_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::Release);
    }

    /// Consume a pending key frame request.
    pub fn take_keyframe_request(&self) -> bool {
        self.keyframe_requested.swap(false, Ordering::AcqRel)
    }

    /// Deliver RTP packets to every playing session. Returns the number of
    /// sessions reached.
    ///
    /// Interleaved packets wait for queue space until a shared deadline;
    /// a viewer still full by then loses the rest of the frame.
    pub async fn broadcast(&self, packets: &[Vec<u8>]) -> usize {
        let deadline = Instant::now() + FRAME_SEND_DEADLINE;
        let mut reached = 0;
        for session in self.sessions.get_playing_sessions() {
            let Some(transport) = session.get_transport() else {
                continue;
            };
            let mut delivered = 0;
            for packet in packets {
                let sent = match &transport {
                    Transport::Udp { client_rtp, .. } => {
                        self.udp.send_to(packet, *client_rtp).await.is_ok()
                    }
                    Transport::Interleaved {
                        rtp_channel, sink, ..
                    } => {
                        let frame = encode_interleaved(*rtp_channel, packet);
                        matches!(
                            tokio::time::timeout_at(deadline, sink.send(frame)).await,
                            Ok(Ok(()))
                        )
                    }
                };
                if !sent {
                    break;
                }
                delivered += 1;
            }
            if delivered == packets.len() {
                reached += 1;
            } else {
                tracing::debug!(
                    session_id = %session.id,
                    delivered,
                    total = packets.len(),
                    "viewer missed part of a frame"
                );
            }
        }
        reached
    }
}

/// Transient RTSP server publishing one mount.
///
/// Created by [`bind`](Self::bind), which claims the first free port of a
/// range; [`serve`](Self::serve) then accepts connections until cancelled.
pub struct RestreamEndpoint {
    listener: TcpListener,
    local_addr: SocketAddr,
    handle: EndpointHandle,
}

impl RestreamEndpoint {
    pub async fn bind(
        host: &str,
        ports: PortRange,
        mount: Arc<Mount>,
        config: ServerConfig,
    ) -> Result<Self> {
        let listener = bind_in_range(host, ports).await?;
        let local_addr = listener.local_addr()?;
        let handle = EndpointHandle::new(mount, host, config).await?;

        tracing::info!(addr = %local_addr, mount = %handle.mount.path(), "restream endpoint listening");

        Ok(Self {
            listener,
            local_addr,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> EndpointHandle {
        self.handle.clone()
    }

    pub async fn serve(self, cancel: CancellationToken) {
        tcp::accept_loop(self.listener, self.handle, cancel).await;
        tracing::info!(addr = %self.local_addr, "restream endpoint stopped");
    }
}

async fn bind_in_range(host: &str, ports: PortRange) -> Result<TcpListener> {
    if ports.is_ephemeral() {
        return Ok(TcpListener::bind((host, 0)).await?);
    }
    for port in ports.ports() {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => tracing::trace!(port, error = %e, "port unavailable"),
        }
    }
    Err(RelayError::PortRangeExhausted {
        start: ports.start,
        end: ports.end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::h264::H264Packetizer;

    fn mount() -> Arc<Mount> {
        Arc::new(Mount::new("/clip", Box::new(H264Packetizer::new(96, 7))))
    }

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let endpoint = RestreamEndpoint::bind(
            "127.0.0.1",
            PortRange::ephemeral(),
            mount(),
            ServerConfig::default(),
        )
        .await
        .unwrap();
        assert_ne!(endpoint.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn occupied_range_is_exhausted() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let err = bind_in_range("127.0.0.1", PortRange::new(port, port))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::PortRangeExhausted { start, end } if start == port && end == port
        ));
    }

    #[tokio::test]
    async fn broadcast_skips_idle_sessions() {
        let handle = EndpointHandle::new(mount(), "127.0.0.1", ServerConfig::default())
            .await
            .unwrap();
        let (sink, mut rx) = tokio::sync::mpsc::channel(4);

        let idle = handle.sessions.create_session("rtsp://h/clip");
        idle.set_transport(Transport::Interleaved {
            rtp_channel: 0,
            rtcp_channel: 1,
            sink: sink.clone(),
        });
        assert_eq!(handle.broadcast(&[vec![0x80, 96]]).await, 0);

        handle.sessions.start_playing(&idle);
        assert_eq!(handle.broadcast(&[vec![0x80, 96]]).await, 1);
        let frame = rx.recv().await.unwrap();
        assert_eq!(&frame[..], &[b'$', 0, 0, 2, 0x80, 96]);
    }

    #[tokio::test]
    async fn broadcast_waits_for_a_draining_viewer() {
        let handle = EndpointHandle::new(mount(), "127.0.0.1", ServerConfig::default())
            .await
            .unwrap();
        let (sink, mut rx) = tokio::sync::mpsc::channel(1);
        let session = handle.sessions.create_session("rtsp://h/clip");
        session.set_transport(Transport::Interleaved {
            rtp_channel: 0,
            rtcp_channel: 1,
            sink,
        });
        handle.sessions.start_playing(&session);

        let reader = tokio::spawn(async move {
            let mut frames = 0;
            while rx.recv().await.is_some() {
                frames += 1;
            }
            frames
        });
        let packets: Vec<Vec<u8>> = (0..8u8).map(|i| vec![0x80, 96, 0, i]).collect();
        assert_eq!(handle.broadcast(&packets).await, 1);

        handle.sessions.remove_sessions(&[session.id.clone()]);
        drop(session);
        assert_eq!(reader.await.unwrap(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_viewer_loses_the_frame_tail() {
        let handle = EndpointHandle::new(mount(), "127.0.0.1", ServerConfig::default())
            .await
            .unwrap();
        let (sink, _rx) = tokio::sync::mpsc::channel(2);
        let session = handle.sessions.create_session("rtsp://h/clip");
        session.set_transport(Transport::Interleaved {
            rtp_channel: 0,
            rtcp_channel: 1,
            sink,
        });
        handle.sessions.start_playing(&session);

        let packets: Vec<Vec<u8>> = (0..4u8).map(|i| vec![0x80, 96, 0, i]).collect();
        assert_eq!(handle.broadcast(&packets).await, 0);
    }

    #[tokio::test]
    async fn keyframe_request_is_consumed_once() {
        let handle = EndpointHandle::new(mount(), "127.0.0.1", ServerConfig::default())
            .await
            .unwrap();
        assert!(!handle.take_keyframe_request());
        handle.request_keyframe();
        handle.request_keyframe();
        assert!(handle.take_keyframe_request());
        assert!(!handle.take_keyframe_request());
    }
}
