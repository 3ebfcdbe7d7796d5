//! RTSP client that pulls one video stream into a [`LocalTrack`].
//!
//! The bridge speaks RTSP over a single TCP connection: OPTIONS, DESCRIBE,
//! SETUP with interleaved transport, PLAY. Media then arrives as `$` frames
//! on the same socket (RFC 2326 §10.12).

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::media::h264::ParameterSetInjector;
use crate::media::rtp::{self, RtpPacketView};
use crate::protocol::framing::{self, Frame};
use crate::protocol::response::SERVER_AGENT;
use crate::protocol::sdp::VideoMedia;
use crate::protocol::{RtspRequest, RtspResponse};
use crate::registry::{KeyframeRequests, LocalTrack};
use crate::session::TransportHeader;

const DEFAULT_RTSP_PORT: u16 = 554;
const INTERLEAVED_TRANSPORT: &str = "RTP/AVP/TCP;unicast;interleaved=0-1";

/// Timeouts applied to a bridge connection.
#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub media_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl BridgeConfig {
    pub fn from_relay(config: &RelayConfig) -> Self {
        Self {
            dial_timeout: config.dial_timeout,
            read_timeout: config.read_timeout,
            media_timeout: config.media_timeout,
            keepalive_interval: config.keepalive_interval,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_relay(&RelayConfig::default())
    }
}

/// Dial target split out of an `rtsp://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceUrl {
    host: String,
    port: u16,
    /// The URL used in request lines, with any credentials removed.
    request_url: String,
}

impl SourceUrl {
    fn parse(url: &str) -> Result<Self> {
        let rest = match url.strip_prefix("rtsp://") {
            Some(rest) => rest,
            None if url.starts_with("rtsps://") => {
                return Err(RelayError::InvalidUrl(format!("{url}: rtsps is not supported")));
            }
            None => return Err(RelayError::InvalidUrl(url.to_string())),
        };

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, Some(path)),
            None => (rest, None),
        };
        let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| RelayError::InvalidUrl(url.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, url)?,
                None => DEFAULT_RTSP_PORT,
            };
            (host, port)
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (host, parse_port(port, url)?),
                None => (authority, DEFAULT_RTSP_PORT),
            }
        };
        if host.is_empty() {
            return Err(RelayError::InvalidUrl(url.to_string()));
        }

        let request_url = match path {
            Some(path) => format!("rtsp://{authority}/{path}"),
            None => format!("rtsp://{authority}"),
        };
        Ok(Self {
            host: host.to_string(),
            port,
            request_url,
        })
    }
}

fn parse_port(port: &str, url: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| RelayError::InvalidUrl(url.to_string()))
}

/// Request side of the RTSP connection.
struct Control {
    writer: OwnedWriteHalf,
    cseq: u32,
    session: Option<String>,
}

impl Control {
    /// Write a request and return its CSeq.
    async fn send(&mut self, method: &str, uri: &str, headers: &[(&str, &str)]) -> Result<String> {
        self.cseq += 1;
        let cseq = self.cseq.to_string();
        let mut request = RtspRequest::new(method, uri)
            .add_header("CSeq", &cseq)
            .add_header("User-Agent", SERVER_AGENT);
        if let Some(session) = &self.session {
            request = request.add_header("Session", session);
        }
        for (name, value) in headers {
            request = request.add_header(name, value);
        }
        tracing::trace!(method, uri, %cseq, "sending RTSP request");
        self.writer.write_all(request.serialize().as_bytes()).await?;
        Ok(cseq)
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        Ok(self.writer.write_all(frame).await?)
    }
}

/// Handshake state before the source starts playing.
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    control: Control,
    read_timeout: Duration,
}

impl Connection {
    /// Send a request and wait for the response with the same CSeq.
    async fn request(
        &mut self,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
    ) -> Result<RtspResponse> {
        let cseq = self.control.send(method, uri, headers).await?;
        let response = tokio::time::timeout(
            self.read_timeout,
            read_response(&mut self.reader, &cseq),
        )
        .await
        .map_err(|_| RelayError::Timeout("RTSP response"))??;

        if !response.is_success() {
            return Err(RelayError::Status {
                method: method.to_string(),
                code: response.status_code,
                reason: response.status_text,
            });
        }
        Ok(response)
    }
}

/// A connected, playing RTSP source.
///
/// Created by [`connect`](Self::connect), consumed by [`run`](Self::run).
pub struct MediaBridge {
    url: String,
    reader: BufReader<OwnedReadHalf>,
    control: Control,
    media: VideoMedia,
    rtp_channel: u8,
    rtcp_channel: u8,
    config: BridgeConfig,
}

impl MediaBridge {
    /// Dial `url` and walk the RTSP handshake up to PLAY.
    ///
    /// Every network step is bounded by the configured timeouts. Any
    /// non-2xx answer, including 401, fails the connect.
    pub async fn connect(url: &str, config: BridgeConfig) -> Result<Self> {
        let source = SourceUrl::parse(url)?;
        let stream = tokio::time::timeout(
            config.dial_timeout,
            TcpStream::connect((source.host.as_str(), source.port)),
        )
        .await
        .map_err(|_| RelayError::Timeout("RTSP connect"))??;
        stream.set_nodelay(true)?;
        tracing::debug!(host = %source.host, port = source.port, "connected to RTSP source");

        let (reader, writer) = stream.into_split();
        let mut connection = Connection {
            reader: BufReader::new(reader),
            control: Control {
                writer,
                cseq: 0,
                session: None,
            },
            read_timeout: config.read_timeout,
        };
        let url = source.request_url;

        connection.request("OPTIONS", &url, &[]).await?;

        let describe = connection
            .request("DESCRIBE", &url, &[("Accept", "application/sdp")])
            .await?;
        let body = describe
            .body
            .as_deref()
            .ok_or_else(|| RelayError::Sdp("DESCRIBE returned no body".into()))?;
        let media = VideoMedia::parse(body)?;
        let base = describe
            .get_header("Content-Base")
            .or_else(|| describe.get_header("Content-Location"))
            .unwrap_or(&url);
        let control_url = media.control_url(base);

        let setup = connection
            .request("SETUP", &control_url, &[("Transport", INTERLEAVED_TRANSPORT)])
            .await?;
        connection.control.session = setup
            .get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_string());
        let (rtp_channel, rtcp_channel) =
            match setup.get_header("Transport").and_then(TransportHeader::parse) {
                Some(TransportHeader::Interleaved {
                    rtp_channel,
                    rtcp_channel,
                }) => (rtp_channel, rtcp_channel),
                _ => (0, 1),
            };

        connection
            .request("PLAY", &url, &[("Range", "npt=0.000-")])
            .await?;

        tracing::info!(
            %url,
            codec = %media.codec,
            payload_type = media.payload_type,
            session = ?connection.control.session,
            "RTSP source playing"
        );
        Ok(Self {
            url,
            reader: connection.reader,
            control: connection.control,
            media,
            rtp_channel,
            rtcp_channel,
            config,
        })
    }

    /// Video description of the source, for building its track.
    pub fn describe(&self) -> &VideoMedia {
        &self.media
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Forward media into `track` until the source ends, fails or `cancel`
    /// fires.
    ///
    /// Returns `Ok(())` when the source closes the connection. Key frame
    /// requests arriving on `keyframes` become RTCP PLI packets upstream.
    pub async fn run(
        self,
        track: Arc<LocalTrack>,
        mut keyframes: KeyframeRequests,
        cancel: CancellationToken,
    ) -> Result<()> {
        let Self {
            url,
            mut reader,
            mut control,
            media,
            rtp_channel,
            rtcp_channel,
            config,
        } = self;

        // Frame reads are not cancel-safe, so they live on their own task.
        let (frames_tx, mut frames) = mpsc::channel::<Result<Option<Frame>>>(64);
        let reader_task = tokio::spawn(async move {
            loop {
                let frame = framing::read_frame(&mut reader).await;
                let done = !matches!(frame, Ok(Some(_)));
                if frames_tx.send(frame).await.is_err() || done {
                    break;
                }
            }
        });

        let mut injector = track
            .codec()
            .is_h264()
            .then(|| ParameterSetInjector::from_sprop(media.sprop_parameter_sets()));
        let mut keepalive = tokio::time::interval_at(
            Instant::now() + config.keepalive_interval,
            config.keepalive_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let silence = tokio::time::sleep(config.media_timeout);
        tokio::pin!(silence);

        let sender_ssrc: u32 = rand::random();
        let mut media_ssrc = None;
        let mut keyframes_open = true;
        let mut forwarded: u64 = 0;

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(RelayError::Cancelled),
                _ = &mut silence => break Err(RelayError::Timeout("RTSP media")),
                frame = frames.recv() => match frame {
                    None | Some(Ok(None)) => break Ok(()),
                    Some(Err(e)) => break Err(e),
                    Some(Ok(Some(Frame::Interleaved { channel, payload }))) if channel == rtp_channel => {
                        silence.as_mut().reset(Instant::now() + config.media_timeout);
                        if let Some(view) = RtpPacketView::parse(&payload) {
                            media_ssrc = Some(view.ssrc);
                        }
                        let packets = match injector.as_mut() {
                            Some(injector) => injector.process(payload),
                            None => vec![payload],
                        };
                        for packet in packets {
                            if let Err(e) = track.write_rtp(&packet).await {
                                tracing::trace!(error = %e, "track write failed");
                            }
                            forwarded += 1;
                        }
                    }
                    // RTCP from the source and responses to keepalives.
                    Some(Ok(Some(_))) => {}
                },
                _ = keepalive.tick() => {
                    if let Err(e) = control.send("GET_PARAMETER", &url, &[]).await {
                        break Err(e);
                    }
                }
                request = keyframes.recv(), if keyframes_open => match request {
                    Some(()) => {
                        let Some(media_ssrc) = media_ssrc else { continue };
                        let pli = rtp::picture_loss_indication(sender_ssrc, media_ssrc);
                        if let Err(e) = control.send_frame(&framing::encode_interleaved(rtcp_channel, &pli)).await {
                            break Err(e);
                        }
                        tracing::trace!(%url, media_ssrc, "sent PLI upstream");
                    }
                    None => keyframes_open = false,
                },
            }
        };

        if matches!(outcome, Err(RelayError::Cancelled)) {
            let teardown = control.send("TEARDOWN", &url, &[]);
            if tokio::time::timeout(config.read_timeout, teardown).await.is_err() {
                tracing::debug!(%url, "TEARDOWN timed out");
            }
        }
        reader_task.abort();

        match &outcome {
            Ok(()) => tracing::info!(%url, forwarded, "RTSP source ended"),
            Err(RelayError::Cancelled) => tracing::info!(%url, forwarded, "RTSP bridge stopped"),
            Err(e) => tracing::warn!(%url, forwarded, error = %e, "RTSP bridge failed"),
        }
        outcome
    }
}

/// Read until the response carrying `cseq`, skipping media and stray
/// server requests.
async fn read_response(reader: &mut BufReader<OwnedReadHalf>, cseq: &str) -> Result<RtspResponse> {
    loop {
        let frame = framing::read_frame(reader).await?.ok_or_else(|| {
            RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "RTSP source closed the connection",
            ))
        })?;
        let Frame::Message { head, body } = frame else {
            continue;
        };
        if !head.starts_with("RTSP/") {
            tracing::debug!(line = head.lines().next().unwrap_or_default(), "ignoring server request");
            continue;
        }
        let mut response = RtspResponse::parse(&head)?;
        if response.cseq().map(str::trim) != Some(cseq) {
            continue;
        }
        if !body.is_empty() {
            response = response.with_body(String::from_utf8_lossy(&body).into_owned());
        }
        return Ok(response);
    }
}
