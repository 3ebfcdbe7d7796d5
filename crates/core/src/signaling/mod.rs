//! WebSocket signaling.
//!
//! Every viewer holds one WebSocket. Messages in both directions share a
//! JSON envelope whose payload is always a string:
//!
//! ```text
//! {"event": "candidate", "data": "{\"candidate\":\"...\",\"sdpMid\":\"0\",...}"}
//! {"event": "answer",    "data": "{\"type\":\"answer\",\"sdp\":\"v=0...\"}"}
//! {"event": "publish",   "data": "rtsp://camera.local/live"}
//! {"event": "offer",     "data": "{\"type\":\"offer\",\"sdp\":\"v=0...\"}"}
//! ```
//!
//! Clients send `candidate`, `answer` and `publish`; the server sends
//! `candidate` and `offer`.

pub mod handler;
pub mod server;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use server::{AppState, router, serve};

/// One signaling message. Messages on a connection are handled in arrival
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// JSON-encoded `RTCIceCandidateInit`.
    Candidate(String),
    /// JSON-encoded `RTCSessionDescription` of type answer.
    Answer(String),
    /// RTSP URL or stored asset name to publish.
    Publish(String),
    /// JSON-encoded `RTCSessionDescription` of type offer.
    Offer(String),
}

impl SignalingMessage {
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn event(&self) -> &'static str {
        match self {
            Self::Candidate(_) => "candidate",
            Self::Answer(_) => "answer",
            Self::Publish(_) => "publish",
            Self::Offer(_) => "offer",
        }
    }
}

/// Negotiation state of one signaling connection.
///
/// ```text
/// Connecting ──► Negotiating ◄──► Stable
///      │              │              │
///      └──────────────┴──────────────┴──► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// Socket accepted, peer connection not registered yet.
    Connecting,
    /// An offer is outstanding.
    Negotiating,
    /// The last offer was answered.
    Stable,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format() {
        let msg = SignalingMessage::Offer("{\"type\":\"offer\"}".into());
        assert_eq!(
            msg.encode().unwrap(),
            r#"{"event":"offer","data":"{\"type\":\"offer\"}"}"#
        );
    }

    #[test]
    fn decodes_client_events() {
        let msg = SignalingMessage::decode(r#"{"event":"publish","data":"\"clip.mp4\""}"#).unwrap();
        assert_eq!(msg, SignalingMessage::Publish("\"clip.mp4\"".into()));
        assert_eq!(msg.event(), "publish");
    }

    #[test]
    fn unknown_event_is_an_error() {
        assert!(SignalingMessage::decode(r#"{"event":"bye","data":""}"#).is_err());
        assert!(SignalingMessage::decode(r#"{"data":"x"}"#).is_err());
        assert!(SignalingMessage::decode("not json").is_err());
    }
}
