use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Negotiated RTP/RTCP delivery path for a session (RFC 2326 §12.39).
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// ```
#[derive(Debug, Clone)]
pub enum Transport {
    /// RTP datagrams to `client_rtp` from the endpoint's shared UDP socket.
    Udp {
        client_rtp: SocketAddr,
        client_rtcp_port: u16,
        server_rtp_port: u16,
        server_rtcp_port: u16,
    },
    /// `$`-framed packets on the session's own RTSP connection (§10.12).
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
        /// Writer queue of the owning connection.
        sink: mpsc::Sender<Bytes>,
    },
}

impl Transport {
    /// Value of the `Transport` header in the SETUP response.
    pub fn response_header(&self) -> String {
        match self {
            Transport::Udp {
                client_rtp,
                client_rtcp_port,
                server_rtp_port,
                server_rtcp_port,
            } => format!(
                "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                client_rtp.port(),
                client_rtcp_port,
                server_rtp_port,
                server_rtcp_port
            ),
            Transport::Interleaved {
                rtp_channel,
                rtcp_channel,
                ..
            } => format!("RTP/AVP/TCP;unicast;interleaved={rtp_channel}-{rtcp_channel}"),
        }
    }
}

/// Client-side transport request parsed from the `Transport` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportHeader {
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

impl TransportHeader {
    /// Parse the `Transport` header value (RFC 2326 §12.39).
    ///
    /// Only the first transport spec of a comma-separated list is
    /// considered. TCP requests without an `interleaved=` parameter get
    /// channels 0-1.
    ///
    /// ```
    /// use relay::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(
    ///     th,
    ///     TransportHeader::Udp { client_rtp_port: 8000, client_rtcp_port: 8001 }
    /// );
    ///
    /// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=2-3").unwrap();
    /// assert_eq!(th, TransportHeader::Interleaved { rtp_channel: 2, rtcp_channel: 3 });
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.split(',').next()?;
        let mut params = spec.split(';').map(str::trim);
        let protocol = params.next()?;
        let tcp = protocol.eq_ignore_ascii_case("RTP/AVP/TCP");

        let mut client_port = None;
        let mut interleaved = None;
        for param in params {
            if let Some(ports) = param.strip_prefix("client_port=") {
                client_port = Some(parse_pair(ports)?);
            } else if let Some(channels) = param.strip_prefix("interleaved=") {
                let (rtp, rtcp) = parse_pair(channels)?;
                interleaved = Some((u8::try_from(rtp).ok()?, u8::try_from(rtcp).ok()?));
            }
        }

        if tcp || interleaved.is_some() {
            let (rtp_channel, rtcp_channel) = interleaved.unwrap_or((0, 1));
            return Some(TransportHeader::Interleaved {
                rtp_channel,
                rtcp_channel,
            });
        }
        let (client_rtp_port, client_rtcp_port) = client_port?;
        Some(TransportHeader::Udp {
            client_rtp_port,
            client_rtcp_port,
        })
    }
}

/// `a-b` or a single `a` (meaning `a-(a+1)`).
fn parse_pair(value: &str) -> Option<(u16, u16)> {
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: u16 = value.trim().parse().ok()?;
            Some((a, a.checked_add(1)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_udp_transport() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(
            th,
            TransportHeader::Udp {
                client_rtp_port: 5000,
                client_rtcp_port: 5001
            }
        );
    }

    #[test]
    fn parse_tcp_without_channels() {
        let th = TransportHeader::parse("RTP/AVP/TCP;unicast").unwrap();
        assert_eq!(
            th,
            TransportHeader::Interleaved {
                rtp_channel: 0,
                rtcp_channel: 1
            }
        );
    }

    #[test]
    fn parse_single_channel() {
        let th = TransportHeader::parse("RTP/AVP/TCP;interleaved=4").unwrap();
        assert_eq!(
            th,
            TransportHeader::Interleaved {
                rtp_channel: 4,
                rtcp_channel: 5
            }
        );
    }

    #[test]
    fn parse_first_of_list() {
        let th = TransportHeader::parse(
            "RTP/AVP/TCP;unicast;interleaved=0-1, RTP/AVP;unicast;client_port=6000-6001",
        )
        .unwrap();
        assert!(matches!(th, TransportHeader::Interleaved { .. }));
    }

    #[test]
    fn parse_rejects_garbage_ports() {
        assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
        assert!(TransportHeader::parse("RTP/AVP;client_port=x-y").is_none());
    }

    #[test]
    fn response_header_formats() {
        let (sink, _rx) = mpsc::channel(1);
        let t = Transport::Interleaved {
            rtp_channel: 0,
            rtcp_channel: 1,
            sink,
        };
        assert_eq!(t.response_header(), "RTP/AVP/TCP;unicast;interleaved=0-1");

        let t = Transport::Udp {
            client_rtp: "127.0.0.1:6000".parse().unwrap(),
            client_rtcp_port: 6001,
            server_rtp_port: 5000,
            server_rtcp_port: 5001,
        };
        assert_eq!(
            t.response_header(),
            "RTP/AVP;unicast;client_port=6000-6001;server_port=5000-5001"
        );
    }
}
