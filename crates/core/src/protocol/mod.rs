//! RTSP protocol implementation (RFC 2326), both directions.
//!
//! The restream endpoint plays the server role ([`handler`]), the media
//! bridge plays the client role. Both share the message types, the SDP
//! helpers and the stream [`framing`] reader.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! ```text
//! DESCRIBE rtsp://server/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! Once PLAY succeeds on an interleaved session the same TCP stream also
//! carries binary RTP/RTCP frames (RFC 2326 §10.12):
//!
//! ```text
//! '$' <channel: u8> <length: u16 BE> <payload>
//! ```
//!
//! ## Supported methods
//!
//! | Method | RFC section | Server | Client |
//! |--------|-------------|--------|--------|
//! | OPTIONS | §10.1 | yes | yes |
//! | DESCRIBE | §10.2 | yes | yes |
//! | SETUP | §10.4 | UDP + interleaved | interleaved |
//! | PLAY | §10.5 | yes | yes |
//! | PAUSE | §10.6 | yes | no |
//! | TEARDOWN | §10.7 | yes | yes |
//! | GET_PARAMETER | §10.8 | yes | keepalive |

pub mod framing;
pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;

pub use framing::Frame;
pub use handler::MethodHandler;
pub use request::RtspRequest;
pub use response::RtspResponse;
