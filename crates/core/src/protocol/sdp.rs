//! SDP (Session Description Protocol, RFC 8866) in both directions.
//!
//! The restream endpoint produces the body of its DESCRIBE responses:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing (live stream)
//! a=tool:rtsp-relay                             ← server software
//! a=sendonly                                    ← direction
//! m=video 0 RTP/AVP 96                          ← media description
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;...            ← codec parameters
//! a=control:track1                              ← track control URL
//! ```
//!
//! The media bridge reads the DESCRIBE body of an upstream camera with
//! [`VideoMedia::parse`], keeping only the first video section.

use crate::error::{RelayError, Result};
use crate::mount::Mount;

/// Generate an SDP session description for the given mount.
pub fn generate_sdp(
    mount: &Mount,
    ip: &str,
    session_id: &str,
    session_version: &str,
    username: &str,
    session_name: &str,
) -> String {
    let mut sdp: Vec<String> = vec![
        "v=0".to_string(),
        format!("o={username} {session_id} {session_version} IN IP4 {ip}"),
        format!("s={session_name}"),
        format!("c=IN IP4 {ip}"),
        "t=0 0".to_string(),
        "a=tool:rtsp-relay".to_string(),
        "a=sendonly".to_string(),
        format!("m=video 0 RTP/AVP {}", mount.payload_type()),
    ];
    sdp.extend(mount.sdp_attributes());

    tracing::debug!(mount = %mount.path(), "SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}

/// First video media section of a remote session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMedia {
    pub payload_type: u8,
    /// Encoding name from `a=rtpmap`, e.g. `H264`.
    pub codec: String,
    pub clock_rate: u32,
    /// Parameters of the `a=fmtp` line for this payload type, without the
    /// `a=fmtp:<pt> ` prefix.
    pub fmtp: Option<String>,
    pub control: Option<String>,
}

impl VideoMedia {
    pub fn parse(sdp: &str) -> Result<Self> {
        let mut payload_type = None;
        let mut rtpmap = None;
        let mut fmtp = None;
        let mut control = None;

        for line in sdp.lines().map(str::trim) {
            if let Some(media) = line.strip_prefix("m=") {
                if payload_type.is_some() {
                    break;
                }
                let fields: Vec<&str> = media.split_whitespace().collect();
                if fields.first() == Some(&"video") {
                    let pt = fields
                        .get(3)
                        .and_then(|pt| pt.parse::<u8>().ok())
                        .ok_or_else(|| RelayError::Sdp(format!("bad media line: {line}")))?;
                    payload_type = Some(pt);
                }
                continue;
            }
            let Some(pt) = payload_type else { continue };

            if let Some(value) = line.strip_prefix("a=rtpmap:") {
                if let Some((map_pt, encoding)) = value.split_once(' ')
                    && map_pt.parse::<u8>().ok() == Some(pt)
                {
                    let mut parts = encoding.split('/');
                    let codec = parts.next().unwrap_or_default().to_string();
                    let clock_rate = parts.next().and_then(|c| c.parse().ok());
                    rtpmap = Some((codec, clock_rate));
                }
            } else if let Some(value) = line.strip_prefix("a=fmtp:") {
                if let Some((fmtp_pt, params)) = value.split_once(' ')
                    && fmtp_pt.parse::<u8>().ok() == Some(pt)
                {
                    fmtp = Some(params.trim().to_string());
                }
            } else if let Some(value) = line.strip_prefix("a=control:") {
                control = Some(value.trim().to_string());
            }
        }

        let payload_type =
            payload_type.ok_or_else(|| RelayError::Sdp("no video media section".into()))?;
        let (codec, clock_rate) = rtpmap
            .ok_or_else(|| RelayError::Sdp(format!("no rtpmap for payload type {payload_type}")))?;
        let clock_rate = clock_rate
            .ok_or_else(|| RelayError::Sdp(format!("no clock rate for {codec}")))?;

        Ok(Self {
            payload_type,
            codec,
            clock_rate,
            fmtp,
            control,
        })
    }

    /// Value of a single `key=value` fmtp parameter.
    pub fn fmtp_param(&self, name: &str) -> Option<&str> {
        self.fmtp.as_deref()?.split(';').find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            key.eq_ignore_ascii_case(name).then_some(value)
        })
    }

    pub fn sprop_parameter_sets(&self) -> Option<&str> {
        self.fmtp_param("sprop-parameter-sets")
    }

    /// Resolve the media control attribute against the presentation base
    /// URL (RFC 2326 §C.1.1).
    pub fn control_url(&self, base: &str) -> String {
        match self.control.as_deref() {
            None | Some("*") => base.to_string(),
            Some(c) if c.starts_with("rtsp://") || c.starts_with("rtsps://") => c.to_string(),
            Some(c) => format!("{}/{}", base.trim_end_matches('/'), c.trim_start_matches('/')),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::h264::H264Packetizer;

    const CAMERA_SDP: &str = "v=0\r\n\
        o=- 1 1 IN IP4 10.0.0.5\r\n\
        s=Camera\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        m=audio 0 RTP/AVP 0\r\n\
        a=control:trackID=0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1;profile-level-id=42001e;sprop-parameter-sets=Z0IAHg==,aM44gA==\r\n\
        a=control:trackID=1\r\n\
        m=video 0 RTP/AVP 97\r\n\
        a=rtpmap:97 VP8/90000\r\n";

    #[test]
    fn generates_h264_sdp() {
        let mount = Mount::new("/clip", Box::new(H264Packetizer::new(96, 0x12345678)));
        let sdp = generate_sdp(&mount, "192.168.1.100", "1234567890", "1", "-", "Restream");
        assert!(sdp.contains("o=- 1234567890 1 IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("c=IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("a=tool:rtsp-relay\r\n"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("a=control:track1\r\n"));

        let rtpmap_idx = sdp.find("a=rtpmap").unwrap();
        let fmtp_idx = sdp.find("a=fmtp").unwrap();
        let sendonly_idx = sdp.find("a=sendonly").unwrap();
        let m_idx = sdp.find("m=video").unwrap();
        assert!(rtpmap_idx < fmtp_idx, "a=rtpmap must precede a=fmtp");
        assert!(sendonly_idx < m_idx, "session-level attrs must precede m=");
        assert!(sdp.ends_with("\r\n"));
    }

    #[test]
    fn parses_first_video_section() {
        let media = VideoMedia::parse(CAMERA_SDP).unwrap();
        assert_eq!(media.payload_type, 96);
        assert_eq!(media.codec, "H264");
        assert_eq!(media.clock_rate, 90000);
        assert_eq!(media.control.as_deref(), Some("trackID=1"));
        assert_eq!(media.sprop_parameter_sets(), Some("Z0IAHg==,aM44gA=="));
        assert_eq!(media.fmtp_param("profile-level-id"), Some("42001e"));
    }

    #[test]
    fn parses_generated_sdp() {
        let mount = Mount::new("/clip", Box::new(H264Packetizer::new(96, 1)));
        let sdp = generate_sdp(&mount, "127.0.0.1", "0", "0", "-", "Restream");
        let media = VideoMedia::parse(&sdp).unwrap();
        assert_eq!(media.codec, "H264");
        assert_eq!(media.fmtp_param("packetization-mode"), Some("1"));
        assert_eq!(
            media.control_url("rtsp://127.0.0.1:8600/clip/"),
            "rtsp://127.0.0.1:8600/clip/track1"
        );
    }

    #[test]
    fn rejects_audio_only() {
        let sdp = "v=0\r\nm=audio 0 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
        assert!(matches!(VideoMedia::parse(sdp), Err(RelayError::Sdp(_))));
    }

    #[test]
    fn control_resolution() {
        let mut media = VideoMedia::parse(CAMERA_SDP).unwrap();
        assert_eq!(
            media.control_url("rtsp://cam/live"),
            "rtsp://cam/live/trackID=1"
        );
        media.control = Some("rtsp://other/track".into());
        assert_eq!(media.control_url("rtsp://cam/live"), "rtsp://other/track");
        media.control = None;
        assert_eq!(media.control_url("rtsp://cam/live"), "rtsp://cam/live");
    }
}
