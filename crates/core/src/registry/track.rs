use std::sync::Arc;

use tokio::sync::mpsc;
use webrtc::api::media_engine::{MIME_TYPE_AV1, MIME_TYPE_H264, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::error::{RelayError, Result};
use crate::protocol::sdp::VideoMedia;

/// Constrained Baseline with asymmetric levels, the profile every browser
/// can decode. Peers negotiate against this line, not the camera's.
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Codec descriptor of a [`LocalTrack`] as WebRTC sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackCodec {
    pub mime_type: String,
    pub clock_rate: u32,
    pub fmtp: String,
}

impl TrackCodec {
    /// Map the video section of an RTSP source onto a WebRTC codec.
    pub fn from_media(media: &VideoMedia) -> Result<Self> {
        let (mime_type, fmtp) = match media.codec.to_ascii_uppercase().as_str() {
            "H264" => (MIME_TYPE_H264, H264_FMTP),
            "VP8" => (MIME_TYPE_VP8, ""),
            "VP9" => (MIME_TYPE_VP9, ""),
            "AV1" => (MIME_TYPE_AV1, ""),
            _ => return Err(RelayError::UnsupportedCodec(media.codec.clone())),
        };
        Ok(Self {
            mime_type: mime_type.to_string(),
            clock_rate: media.clock_rate,
            fmtp: fmtp.to_string(),
        })
    }

    pub fn is_h264(&self) -> bool {
        self.mime_type.eq_ignore_ascii_case(MIME_TYPE_H264)
    }

    fn capability(&self) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: self.mime_type.clone(),
            clock_rate: self.clock_rate,
            sdp_fmtp_line: self.fmtp.clone(),
            ..Default::default()
        }
    }
}

/// Receiving end of a track's keyframe requests, held by whatever feeds
/// the track.
#[derive(Debug)]
pub struct KeyframeRequests(mpsc::Receiver<()>);

impl KeyframeRequests {
    pub async fn recv(&mut self) -> Option<()> {
        self.0.recv().await
    }
}

/// Outbound media of one published source.
///
/// Wraps a `TrackLocalStaticRTP` that every peer session sends. The source
/// writes RTP into it; the registry and viewers ask it for key frames.
pub struct LocalTrack {
    id: String,
    codec: TrackCodec,
    rtp: Arc<TrackLocalStaticRTP>,
    keyframes: mpsc::Sender<()>,
}

impl LocalTrack {
    pub fn new(codec: TrackCodec, stream_id: &str) -> (Arc<Self>, KeyframeRequests) {
        let id = uuid::Uuid::new_v4().to_string();
        let rtp = Arc::new(TrackLocalStaticRTP::new(
            codec.capability(),
            id.clone(),
            stream_id.to_string(),
        ));
        // Requests coalesce: one pending request is as good as many.
        let (keyframes, requests) = mpsc::channel(1);
        let track = Arc::new(Self {
            id,
            codec,
            rtp,
            keyframes,
        });
        (track, KeyframeRequests(requests))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn codec(&self) -> &TrackCodec {
        &self.codec
    }

    /// The WebRTC track to attach to peer connections.
    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtp.clone()
    }

    /// Forward one serialized RTP packet to every bound peer.
    pub async fn write_rtp(&self, packet: &[u8]) -> Result<usize> {
        Ok(self.rtp.write(packet).await?)
    }

    /// Ask the source for a key frame. Returns `false` once the source has
    /// stopped listening.
    pub fn request_keyframe(&self) -> bool {
        match self.keyframes.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("codec", &self.codec)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(codec: &str) -> VideoMedia {
        VideoMedia {
            payload_type: 96,
            codec: codec.to_string(),
            clock_rate: 90000,
            fmtp: None,
            control: None,
        }
    }

    #[test]
    fn maps_supported_codecs() {
        let codec = TrackCodec::from_media(&media("h264")).unwrap();
        assert_eq!(codec.mime_type, MIME_TYPE_H264);
        assert!(codec.is_h264());
        assert!(codec.fmtp.contains("packetization-mode=1"));

        let codec = TrackCodec::from_media(&media("VP8")).unwrap();
        assert_eq!(codec.mime_type, MIME_TYPE_VP8);
        assert!(!codec.is_h264());
    }

    #[test]
    fn rejects_unsupported_codec() {
        assert!(matches!(
            TrackCodec::from_media(&media("MP4V-ES")),
            Err(RelayError::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn track_ids_are_unique() {
        let codec = TrackCodec::from_media(&media("H264")).unwrap();
        let (a, _ra) = LocalTrack::new(codec.clone(), "relay");
        let (b, _rb) = LocalTrack::new(codec, "relay");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.rtp_track().id(), a.id());
    }

    #[tokio::test]
    async fn keyframe_requests_coalesce() {
        let codec = TrackCodec::from_media(&media("H264")).unwrap();
        let (track, mut requests) = LocalTrack::new(codec, "relay");
        assert!(track.request_keyframe());
        assert!(track.request_keyframe());
        assert_eq!(requests.recv().await, Some(()));
        assert!(requests.0.try_recv().is_err());

        drop(requests);
        assert!(!track.request_keyframe());
    }
}
