use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::server::EndpointHandle;
use crate::session::{SessionState, Transport, TransportHeader};

const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER";

/// Handles RTSP method requests for a single TCP connection of a restream
/// endpoint.
///
/// Tracks which sessions were created on this connection so they can be
/// cleaned up when the connection drops. Interleaved sessions deliver
/// through `sink`, the connection's writer queue.
pub struct MethodHandler {
    endpoint: EndpointHandle,
    client_addr: SocketAddr,
    sink: mpsc::Sender<Bytes>,
    /// Session IDs created during this connection, for cleanup on disconnect.
    session_ids: Vec<String>,
}

impl MethodHandler {
    pub fn new(endpoint: EndpointHandle, client_addr: SocketAddr, sink: mpsc::Sender<Bytes>) -> Self {
        MethodHandler {
            endpoint,
            client_addr,
            sink,
            session_ids: Vec::new(),
        }
    }

    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(cseq),
            "DESCRIBE" => self.handle_describe(cseq, &request.uri),
            "SETUP" => self.handle_setup(cseq, request),
            "PLAY" => self.handle_play(cseq, request),
            "PAUSE" => self.handle_pause(cseq, request),
            "TEARDOWN" => self.handle_teardown(cseq, request),
            "GET_PARAMETER" => self.handle_get_parameter(cseq, request),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::new(501, "Not Implemented").add_header("CSeq", cseq)
            }
        }
    }

    /// Clean up sessions owned by this connection. Returns how many were
    /// still registered.
    pub fn release_sessions(&mut self) -> usize {
        let owned = std::mem::take(&mut self.session_ids);
        for id in &owned {
            self.endpoint.mount.unsubscribe(id);
        }
        self.endpoint.sessions.remove_sessions(&owned)
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Public", PUBLIC_METHODS)
    }

    /// Host advertised in the SDP: configured public host, else the host of
    /// the request URI, else the client's own address.
    fn advertised_host(&self, uri: &str) -> String {
        if let Some(host) = &self.endpoint.config.public_host {
            return host.clone();
        }

        let from_uri = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
            .and_then(|rest| rest.split('/').next())
            .and_then(|host_port| host_port.split(':').next())
            .map(str::trim)
            .filter(|host| !host.is_empty());

        match from_uri {
            Some(host) => host.to_string(),
            None => self.client_addr.ip().to_string(),
        }
    }

    fn handle_describe(&self, cseq: &str, uri: &str) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");

        let mount = &self.endpoint.mount;
        if !mount.matches(uri) {
            tracing::warn!(uri, mount = %mount.path(), "DESCRIBE for unknown mount");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        }

        let config = &self.endpoint.config;
        let body = sdp::generate_sdp(
            mount,
            &self.advertised_host(uri),
            &config.sdp_session_id,
            &config.sdp_session_version,
            &config.sdp_username,
            &config.sdp_session_name,
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &format!("{}/", uri.trim_end_matches('/')))
            .with_body(body)
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let mount = self.endpoint.mount.clone();
        if !mount.matches(&request.uri) {
            tracing::warn!(uri = %request.uri, "SETUP for unknown mount");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        }

        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!(%cseq, "SETUP missing Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        let Some(requested) = TransportHeader::parse(transport_header) else {
            tracing::warn!(%cseq, transport_header, "SETUP with unsupported Transport");
            return RtspResponse::new(461, "Unsupported Transport").add_header("CSeq", cseq);
        };

        let transport = match requested {
            TransportHeader::Udp {
                client_rtp_port,
                client_rtcp_port,
            } => {
                let server_rtp_port = self.endpoint.udp.local_port();
                Transport::Udp {
                    client_rtp: SocketAddr::new(self.client_addr.ip(), client_rtp_port),
                    client_rtcp_port,
                    server_rtp_port,
                    server_rtcp_port: server_rtp_port.wrapping_add(1),
                }
            }
            TransportHeader::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => Transport::Interleaved {
                rtp_channel,
                rtcp_channel,
                sink: self.sink.clone(),
            },
        };

        // A repeated SETUP within an existing session updates its transport.
        let session = match request.session_id() {
            Some(id) => match self.endpoint.sessions.get_session(id) {
                Some(session) => session,
                None => {
                    tracing::warn!(session_id = id, "SETUP for unknown session");
                    return RtspResponse::session_not_found().add_header("CSeq", cseq);
                }
            },
            None => {
                let session = self.endpoint.sessions.create_session(&request.uri);
                self.session_ids.push(session.id.clone());
                session
            }
        };

        let transport_response = transport.response_header();
        session.set_transport(transport);
        mount.subscribe(&session.id);

        tracing::info!(
            session_id = %session.id,
            mount = %mount.path(),
            client = %self.client_addr,
            transport = %transport_response,
            "session set up"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &transport_response)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session_id) = request.session_id() else {
            tracing::warn!(%cseq, "PLAY missing Session header");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        let Some(session) = self.endpoint.sessions.get_session(session_id) else {
            tracing::warn!(session_id, "PLAY for unknown session");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        self.endpoint.sessions.start_playing(&session);
        tracing::info!(session_id, "session started playing");

        let mount = &self.endpoint.mount;
        let rtp_info = format!(
            "url={};seq={};rtptime={}",
            session.uri,
            mount.next_sequence(),
            mount.next_rtp_timestamp()
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-")
            .add_header("RTP-Info", &rtp_info)
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session = request
            .session_id()
            .and_then(|id| self.endpoint.sessions.get_session(id));
        match session {
            Some(session) => {
                session.set_state(SessionState::Paused);
                tracing::info!(session_id = %session.id, "session paused");
                RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Session", &session.session_header_value())
            }
            None => {
                tracing::warn!(%cseq, "PAUSE for unknown session");
                RtspResponse::session_not_found().add_header("CSeq", cseq)
            }
        }
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session_id) = request.session_id() else {
            tracing::warn!(%cseq, "TEARDOWN missing Session header");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        match self.endpoint.sessions.remove_session(session_id) {
            Some(_) => {
                self.endpoint.mount.unsubscribe(session_id);
                self.session_ids.retain(|id| id != session_id);
                tracing::info!(session_id, "session terminated via TEARDOWN");
                RtspResponse::ok().add_header("CSeq", cseq)
            }
            None => {
                tracing::warn!(session_id, "TEARDOWN for unknown session");
                RtspResponse::session_not_found().add_header("CSeq", cseq)
            }
        }
    }

    /// GET_PARAMETER is used by clients (and our own bridge) as a keepalive
    /// (RFC 2326 §10.8).
    fn handle_get_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, "GET_PARAMETER keepalive");

        let resp = RtspResponse::ok().add_header("CSeq", cseq);
        match request.session_id() {
            Some(id) if self.endpoint.sessions.get_session(id).is_some() => {
                resp.add_header("Session", id)
            }
            _ => resp,
        }
    }
}
