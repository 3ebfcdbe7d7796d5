//! Stream framing shared by the endpoint and the bridge.
//!
//! An RTSP TCP connection carries text messages and, once an interleaved
//! session is playing, binary frames (RFC 2326 §10.12). The first byte
//! tells them apart: `$` starts a binary frame, anything else a message.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{ParseErrorKind, RelayError, Result};

const INTERLEAVED_MAGIC: u8 = b'$';
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// One unit read off an RTSP connection.
#[derive(Debug)]
pub enum Frame {
    /// A request or response: start line + headers, and the body announced
    /// by `Content-Length` (empty when absent).
    Message { head: String, body: Bytes },
    /// A `$`-framed RTP or RTCP packet.
    Interleaved { channel: u8, payload: Bytes },
}

/// Read the next frame. Returns `Ok(None)` on a clean EOF.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let first = reader.fill_buf().await?.first().copied();
        match first {
            None => return Ok(None),
            Some(INTERLEAVED_MAGIC) => {
                let mut header = [0u8; 4];
                reader.read_exact(&mut header).await?;
                let len = u16::from_be_bytes([header[2], header[3]]) as usize;
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                return Ok(Some(Frame::Interleaved {
                    channel: header[1],
                    payload: Bytes::from(payload),
                }));
            }
            // Stray line breaks between messages.
            Some(b'\r') | Some(b'\n') => reader.consume(1),
            Some(_) => break,
        }
    }

    let mut head = String::new();
    loop {
        // One byte past the limit, so an unterminated line still trips it.
        let budget = (MAX_HEAD_BYTES - head.len()) as u64 + 1;
        let mut line = String::new();
        if (&mut *reader).take(budget).read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        head.push_str(&line);
        if head.len() > MAX_HEAD_BYTES {
            return Err(RelayError::Parse {
                kind: ParseErrorKind::MessageTooLarge,
            });
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    let length = content_length(&head);
    if length > MAX_BODY_BYTES {
        return Err(RelayError::Parse {
            kind: ParseErrorKind::MessageTooLarge,
        });
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    Ok(Some(Frame::Message {
        head,
        body: Bytes::from(body),
    }))
}

/// Wrap a packet in a `$` interleaved frame.
pub fn encode_interleaved(channel: u8, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u8(INTERLEAVED_MAGIC);
    frame.put_u8(channel);
    frame.put_u16(payload.len() as u16);
    frame.put_slice(payload);
    frame.freeze()
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}
