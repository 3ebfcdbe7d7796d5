//! Error types for the relay library.

use std::fmt;

/// Errors that can occur anywhere in the relay.
///
/// Variants map to the failure domains of the stack:
///
/// - **Transport**: [`Io`](Self::Io), [`Timeout`](Self::Timeout),
///   [`Status`](Self::Status): signaling or RTSP socket failures. Fatal to
///   the owning connection or bridge only.
/// - **Protocol**: [`Parse`](Self::Parse), [`Sdp`](Self::Sdp),
///   [`InvalidUrl`](Self::InvalidUrl),
///   [`UnsupportedCodec`](Self::UnsupportedCodec).
/// - **Negotiation**: [`WebRtc`](Self::WebRtc), [`Json`](Self::Json): bad
///   SDP/candidate payloads, fatal to a single signaling connection.
/// - **Registry**: [`SignalingClosed`](Self::SignalingClosed): a sync pass
///   could not reach a session; recovered by retry.
/// - **Provisioning**: [`PortRangeExhausted`](Self::PortRangeExhausted),
///   [`AssetNotFound`](Self::AssetNotFound),
///   [`InvalidAssetName`](Self::InvalidAssetName),
///   [`StartupFailed`](Self::StartupFailed): surfaced synchronously to the
///   requester.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded network operation did not complete in time.
    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// Failed to parse an RTSP message (RFC 2326 §6, §7).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The RTSP peer answered a request with a non-2xx status.
    #[error("RTSP {method} failed: {code} {reason}")]
    Status {
        method: String,
        code: u16,
        reason: String,
    },

    /// A source URL the bridge cannot dial.
    #[error("invalid source URL: {0}")]
    InvalidUrl(String),

    /// The DESCRIBE body did not contain a usable media description.
    #[error("SDP error: {0}")]
    Sdp(String),

    /// The source advertises a codec the relay cannot forward.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// No RTSP session with the given ID exists on the endpoint.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Every port in the configured restream range is taken.
    #[error("no free port in range {start}-{end}")]
    PortRangeExhausted { start: u16, end: u16 },

    /// The asset store has no asset with this name.
    #[error("asset not found: {0}")]
    AssetNotFound(String),

    /// The asset name is empty or escapes the store root.
    #[error("invalid asset name: {0:?}")]
    InvalidAssetName(String),

    /// The restream endpoint reported a failure before binding.
    #[error("restream endpoint failed to start: {0}")]
    StartupFailed(String),

    /// The outbound signaling channel of a session is gone.
    #[error("signaling channel closed for session {0}")]
    SignalingClosed(String),

    /// Error raised by the WebRTC stack.
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    /// Malformed JSON in a signaling message or payload.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The owning context was canceled.
    #[error("operation cancelled")]
    Cancelled,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no start line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// Status line did not have the expected `Version Code Reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// A message exceeded the size the reader accepts.
    MessageTooLarge,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::MessageTooLarge => write!(f, "message too large"),
        }
    }
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;
