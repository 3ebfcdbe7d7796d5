use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::media::rtp;
use crate::protocol::framing::{self, Frame};
use crate::protocol::{MethodHandler, RtspRequest};
use crate::server::EndpointHandle;

/// Queue depth of a connection's writer. Interleaved RTP shares it with
/// responses.
const WRITER_QUEUE: usize = 512;

/// Accept RTSP clients until `cancel` fires, one task per connection.
pub async fn accept_loop(listener: TcpListener, endpoint: EndpointHandle, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                let endpoint = endpoint.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    Connection::handle(stream, peer_addr, endpoint, cancel).await;
                });
            }
            Err(e) => tracing::warn!(error = %e, "TCP accept error"),
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP client connection with its own lifecycle.
///
/// Reads run on the connection task; all writes (responses and interleaved
/// RTP) go through one queue drained by a writer task, so frames never
/// interleave mid-packet.
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    outbound: mpsc::Sender<Bytes>,
    handler: MethodHandler,
    endpoint: EndpointHandle,
    peer_addr: SocketAddr,
}

impl Connection {
    async fn handle(
        stream: TcpStream,
        peer_addr: SocketAddr,
        endpoint: EndpointHandle,
        cancel: CancellationToken,
    ) {
        tracing::info!(%peer_addr, "client connected");

        let (read_half, write_half) = stream.into_split();
        let (outbound, queue) = mpsc::channel(WRITER_QUEUE);
        let writer = tokio::spawn(write_loop(write_half, queue));

        let mut conn = Connection {
            reader: BufReader::new(read_half),
            handler: MethodHandler::new(endpoint.clone(), peer_addr, outbound.clone()),
            endpoint,
            outbound,
            peer_addr,
        };

        let reason = tokio::select! {
            _ = cancel.cancelled() => "server shutting down",
            reason = conn.run() => reason,
        };

        let removed = conn.handler.release_sessions();
        if removed > 0 {
            tracing::info!(peer = %peer_addr, removed, "cleaned up sessions on disconnect");
        }
        drop(conn);
        writer.abort();

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    async fn run(&mut self) -> &'static str {
        loop {
            let frame = match framing::read_frame(&mut self.reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return "connection closed by client",
                Err(e) => {
                    tracing::debug!(peer = %self.peer_addr, error = %e, "read error");
                    return "read error";
                }
            };

            let head = match frame {
                Frame::Message { head, .. } => head,
                Frame::Interleaved { channel, payload } => {
                    if rtp::has_picture_loss_indication(&payload) {
                        tracing::debug!(peer = %self.peer_addr, channel, "key frame requested");
                        self.endpoint.request_keyframe();
                    }
                    continue;
                }
            };

            let request = match RtspRequest::parse(&head) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                    continue;
                }
            };

            tracing::debug!(
                peer = %self.peer_addr,
                method = %request.method,
                uri = %request.uri,
                "request"
            );

            let response = self.handler.handle(&request);

            tracing::debug!(peer = %self.peer_addr, status = response.status_code, "response");

            if self
                .outbound
                .send(Bytes::from(response.serialize()))
                .await
                .is_err()
            {
                return "write error";
            }
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Bytes>) {
    while let Some(chunk) = queue.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            tracing::debug!(error = %e, "write error");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
