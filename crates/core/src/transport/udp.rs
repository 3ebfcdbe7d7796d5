use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::error::Result;

/// UDP transport for outbound RTP packet delivery.
///
/// Binds a single ephemeral socket on the endpoint's host. Its port is the
/// `server_port` advertised in SETUP responses.
///
/// This layer is address-only: it does not know about sessions or mounts.
/// The caller resolves session state to socket addresses before calling
/// [`send_to`](Self::send_to).
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local_port: u16,
}

impl UdpTransport {
    pub async fn bind(host: &str) -> Result<Self> {
        let socket = UdpSocket::bind((host, 0)).await?;
        let local_port = socket.local_addr()?.port();
        tracing::debug!(host, local_port, "RTP socket bound");
        Ok(Self { socket, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub async fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, addr).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_datagram() {
        let udp = UdpTransport::bind("127.0.0.1").await.unwrap();
        assert_ne!(udp.local_port(), 0);

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();
        assert_eq!(udp.send_to(&[1, 2, 3], addr).await.unwrap(), 3);

        let mut buf = [0u8; 8];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }
}
