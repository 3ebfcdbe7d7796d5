/// Build a 12-byte RTP fixed header (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
pub fn build_header(pt: u8, marker: bool, sequence: u16, timestamp: u32, ssrc: u32) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0] = 2 << 6;
    header[1] = ((marker as u8) << 7) | (pt & 0x7f);
    header[2..4].copy_from_slice(&sequence.to_be_bytes());
    header[4..8].copy_from_slice(&timestamp.to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

/// Generic RTP header state for outbound packetizers.
///
/// Manages:
/// - **Sequence number**: 16-bit, wrapping, incremented on every packet.
/// - **Timestamp**: stored as u64 internally to avoid wrapping arithmetic
///   during duration calculations; the lower 32 bits are written to the wire.
/// - **SSRC**: randomly generated per RFC 3550 §8.1 to avoid collisions.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
    timestamp: u64,
}

impl RtpHeader {
    /// Create a new RTP header state with explicit SSRC.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Create with a random SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc(pt: u8) -> Self {
        Self::new(pt, rand::random::<u32>())
    }

    /// Current sequence number (before the next [`write`](Self::write) call).
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Current timestamp (internal u64 representation).
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    ///
    /// The `marker` bit signals the last packet of a frame (RFC 6184 §5.1
    /// for H.264).
    pub fn write(&mut self, marker: bool) -> [u8; 12] {
        let header = build_header(
            self.pt,
            marker,
            self.sequence,
            self.timestamp as u32,
            self.ssrc,
        );
        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    /// Advance the RTP timestamp by the given increment.
    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment as u64);
    }
}

/// Borrowed view over a received RTP packet.
///
/// Skips CSRCs and the header extension, and strips padding, so
/// [`payload`](Self::payload) is exactly the codec payload.
#[derive(Debug, Clone, Copy)]
pub struct RtpPacketView<'a> {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: &'a [u8],
}

impl<'a> RtpPacketView<'a> {
    /// Parse the fixed header. Returns `None` for anything that is not a
    /// well-formed RTP version 2 packet.
    pub fn parse(packet: &'a [u8]) -> Option<Self> {
        if packet.len() < 12 || packet[0] >> 6 != 2 {
            return None;
        }
        let padding = packet[0] & 0x20 != 0;
        let extension = packet[0] & 0x10 != 0;
        let csrc_count = (packet[0] & 0x0f) as usize;

        let mut offset = 12 + csrc_count * 4;
        if extension {
            let ext = packet.get(offset..offset + 4)?;
            let words = u16::from_be_bytes([ext[2], ext[3]]) as usize;
            offset += 4 + words * 4;
        }

        let mut end = packet.len();
        if padding {
            let pad = *packet.last()? as usize;
            end = end.checked_sub(pad)?;
        }
        if offset > end {
            return None;
        }

        Some(Self {
            marker: packet[1] & 0x80 != 0,
            payload_type: packet[1] & 0x7f,
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
            payload: &packet[offset..end],
        })
    }
}

/// Overwrite the sequence number of a serialized RTP packet in place.
pub fn set_sequence(packet: &mut [u8], sequence: u16) {
    if packet.len() >= 4 {
        packet[2..4].copy_from_slice(&sequence.to_be_bytes());
    }
}

/// RTCP Picture Loss Indication (RFC 4585 §6.3.1).
///
/// ```text
/// V=2 P=0 FMT=1 | PT=206 (PSFB) | length=2
/// SSRC of packet sender
/// SSRC of media source
/// ```
pub fn picture_loss_indication(sender_ssrc: u32, media_ssrc: u32) -> [u8; 12] {
    let mut packet = [0u8; 12];
    packet[0] = (2 << 6) | 1;
    packet[1] = 206;
    packet[2..4].copy_from_slice(&2u16.to_be_bytes());
    packet[4..8].copy_from_slice(&sender_ssrc.to_be_bytes());
    packet[8..12].copy_from_slice(&media_ssrc.to_be_bytes());
    packet
}

/// Whether a (possibly compound) RTCP packet carries a PLI.
pub fn has_picture_loss_indication(mut packet: &[u8]) -> bool {
    while packet.len() >= 4 && packet[0] >> 6 == 2 {
        if packet[1] == 206 && packet[0] & 0x1f == 1 {
            return true;
        }
        let words = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        let Some(rest) = packet.get((words + 1) * 4..) else {
            break;
        };
        packet = rest;
    }
    false
}
