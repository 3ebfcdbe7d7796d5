//! Network transport layer of the restream endpoint.
//!
//! RTSP uses a split transport model:
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling, one task
//!   per client. Sessions that negotiated interleaved transport also get
//!   their RTP on this connection using `$` framing (RFC 2326 §10.12).
//!
//! - **UDP** ([`udp`]): carries RTP for sessions that negotiated
//!   `client_port=`. A single socket is shared for all outbound delivery.

pub mod tcp;
pub mod udp;

pub use udp::UdpTransport;
