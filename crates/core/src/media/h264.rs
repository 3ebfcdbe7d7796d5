//! H.264 over RTP (RFC 6184).
//!
//! Outbound, [`H264Packetizer`] turns Annex B access units into Single NAL
//! Unit and FU-A packets. Inbound, [`ParameterSetInjector`] watches packets
//! from an upstream camera and prepends SPS/PPS to key frames that arrive
//! without them, so a viewer joining mid-stream can decode the first IDR.

use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::Bytes;

use super::Packetizer;
use super::rtp::{self, RtpHeader, RtpPacketView};

const DEFAULT_MTU: usize = 1400;

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;
pub const NAL_STAP_A: u8 = 24;
pub const NAL_FU_A: u8 = 28;

/// NAL unit type from the first header byte.
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

fn is_vcl(kind: u8) -> bool {
    (NAL_SLICE..=NAL_IDR).contains(&kind)
}

/// Extract NAL units from an H.264 Annex B bitstream.
///
/// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
/// `00 00 01`) and returns the NAL data between them, excluding
/// the start codes themselves.
///
/// The start code length is tracked per-NAL so boundaries between
/// adjacent NALs stay correct when 3-byte and 4-byte start codes mix.
pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut i = 0usize;
    // (nal_data_start_index, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nal_units = Vec::with_capacity(start_entries.len());
    for (idx, &(start, _)) in start_entries.iter().enumerate() {
        let end = match start_entries.get(idx + 1) {
            Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
            None => data.len(),
        };
        if start < end {
            nal_units.push(&data[start..end]);
        }
    }
    nal_units
}

/// Split a raw Annex B elementary stream into access units (one per frame).
///
/// A new access unit begins at an AUD/SEI/SPS/PPS that follows picture
/// data, or at a slice whose `first_mb_in_slice` is zero (the leading bit
/// of the Exp-Golomb field after the NAL header is `1`). Each returned unit
/// is re-encoded with 4-byte start codes.
pub fn split_access_units(stream: &[u8]) -> Vec<Vec<u8>> {
    let mut units = Vec::new();
    let mut current: Vec<&[u8]> = Vec::new();
    let mut has_picture = false;

    for nal in extract_nal_units(stream) {
        let Some(kind) = nal_type(nal) else { continue };
        let starts_new = if is_vcl(kind) {
            has_picture && nal.get(1).is_some_and(|b| b & 0x80 != 0)
        } else {
            has_picture && matches!(kind, NAL_SEI | NAL_SPS | NAL_PPS | NAL_AUD | 14..=18)
        };
        if starts_new {
            units.push(join_annex_b(&current));
            current.clear();
            has_picture = false;
        }
        current.push(nal);
        has_picture |= is_vcl(kind);
    }
    if !current.is_empty() {
        units.push(join_annex_b(&current));
    }
    units
}

/// Whether an Annex B access unit holds an IDR slice.
pub fn is_key_frame(access_unit: &[u8]) -> bool {
    extract_nal_units(access_unit)
        .iter()
        .any(|nal| nal_type(nal) == Some(NAL_IDR))
}

fn join_annex_b(nals: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nals.iter().map(|n| n.len() + 4).sum());
    for nal in nals {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nal);
    }
    out
}

/// Decode an SDP `sprop-parameter-sets` value into `(sps, pps)`.
pub fn decode_sprop_parameter_sets(value: &str) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    let mut sps = None;
    let mut pps = None;
    for part in value.split(',') {
        let Ok(nal) = BASE64_STANDARD.decode(part.trim()) else {
            tracing::debug!(part, "undecodable sprop-parameter-sets entry");
            continue;
        };
        match nal_type(&nal) {
            Some(NAL_SPS) => sps = Some(nal),
            Some(NAL_PPS) => pps = Some(nal),
            _ => {}
        }
    }
    (sps, pps)
}

/// H.264 RTP packetizer (RFC 6184).
///
/// Converts H.264 Annex B bitstreams into RTP packets. Supports two
/// packetization modes from RFC 6184:
///
/// - **Single NAL Unit** (§5.6): NALs that fit within the MTU are sent
///   as-is in a single RTP packet (12-byte header + NAL bytes).
///
/// - **FU-A Fragmentation** (§5.8): NALs exceeding the MTU are split
///   across multiple RTP packets. Each fragment carries a 2-byte FU
///   header (FU indicator + FU header) before the NAL payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to MTU - 2 bytes)
///   ```
///
/// SPS/PPS are captured from the first frame that contains them, either
/// through [`Packetizer::observe`] ahead of time or while packetizing. The
/// fmtp line then includes `profile-level-id` and `sprop-parameter-sets`.
///
/// Per RFC 6184 §5.1, the RTP marker bit is set on the last RTP packet
/// of an access unit.
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H264Packetizer {
    /// Create with explicit payload type and SSRC.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self::with_header(RtpHeader::new(pt, ssrc))
    }

    /// Create with a random SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc(pt: u8) -> Self {
        Self::with_header(RtpHeader::with_random_ssrc(pt))
    }

    fn with_header(header: RtpHeader) -> Self {
        Self {
            header,
            mtu: DEFAULT_MTU,
            sps: None,
            pps: None,
        }
    }

    /// Derive profile-level-id from SPS NAL (RFC 6184 §8.1): bytes 1–3 are
    /// profile_idc, constraint flags, level_idc.
    fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_deref().filter(|s| s.len() >= 4)?;
        Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }

    fn sprop_parameter_sets(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        Some(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ))
    }

    fn capture_parameter_sets(&mut self, nal_units: &[&[u8]]) {
        if self.sps.is_some() && self.pps.is_some() {
            return;
        }
        for nal in nal_units {
            match nal_type(nal) {
                Some(NAL_SPS) if self.sps.is_none() => {
                    self.sps = Some(nal.to_vec());
                    tracing::debug!(bytes = nal.len(), "H.264 SPS captured from bitstream");
                }
                Some(NAL_PPS) if self.pps.is_none() => {
                    self.pps = Some(nal.to_vec());
                    tracing::debug!(bytes = nal.len(), "H.264 PPS captured from bitstream");
                }
                _ => {}
            }
        }
    }

    /// Packetize a single NAL unit into one or more RTP packets.
    fn packetize_nal(&mut self, nal_unit: &[u8], is_last_nal: bool) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        if nal_unit.is_empty() {
            return packets;
        }

        if nal_unit.len() <= self.mtu {
            let hdr = self.header.write(is_last_nal);
            let mut packet = Vec::with_capacity(12 + nal_unit.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(nal_unit);
            packets.push(packet);
            return packets;
        }

        let nal_header = nal_unit[0];
        let kind = nal_header & 0x1f;
        // FU indicator: NRI from original NAL, type = 28 (FU-A)
        let fu_indicator = (nal_header & 0x60) | NAL_FU_A;
        let payload = &nal_unit[1..];
        let max_fragment = self.mtu - 2;

        let mut chunks = payload.chunks(max_fragment).peekable();
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let last_fragment = chunks.peek().is_none();
            let start_bit = if first { 0x80 } else { 0x00 };
            let end_bit = if last_fragment { 0x40 } else { 0x00 };

            let hdr = self.header.write(is_last_nal && last_fragment);
            let mut packet = Vec::with_capacity(12 + 2 + chunk.len());
            packet.extend_from_slice(&hdr);
            packet.push(fu_indicator);
            packet.push(start_bit | end_bit | kind);
            packet.extend_from_slice(chunk);
            packets.push(packet);
            first = false;
        }

        tracing::trace!(
            nal_type = kind,
            nal_size = nal_unit.len(),
            fragments = packets.len(),
            "FU-A fragmented NAL unit"
        );
        packets
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        let nal_units = extract_nal_units(encoded_data);
        self.capture_parameter_sets(&nal_units);

        let mut packets = Vec::new();
        for (i, nal) in nal_units.iter().enumerate() {
            let is_last = i + 1 == nal_units.len();
            packets.append(&mut self.packetize_nal(nal, is_last));
        }

        self.header.advance_timestamp(timestamp_increment);

        tracing::trace!(
            nal_count = nal_units.len(),
            rtp_packets = packets.len(),
            frame_bytes = encoded_data.len(),
            seq = self.header.sequence(),
            ts = self.header.timestamp(),
            "frame packetized"
        );
        packets
    }

    fn observe(&mut self, encoded_data: &[u8]) {
        self.capture_parameter_sets(&extract_nal_units(encoded_data));
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    fn clock_rate(&self) -> u32 {
        90000
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    /// `a=rtpmap` must precede `a=fmtp`, which references its payload type.
    fn sdp_attributes(&self) -> Vec<String> {
        let mut fmtp = format!("a=fmtp:{} packetization-mode=1", self.header.pt);
        if let Some(pl) = self.profile_level_id() {
            fmtp.push_str(&format!(";profile-level-id={pl}"));
        }
        if let Some(sprop) = self.sprop_parameter_sets() {
            fmtp.push_str(&format!(";sprop-parameter-sets={sprop}"));
        }

        vec![
            format!(
                "a=rtpmap:{} {}/{}",
                self.payload_type(),
                self.codec_name(),
                self.clock_rate()
            ),
            fmtp,
            "a=control:track1".to_string(),
        ]
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn next_rtp_timestamp(&self) -> u32 {
        self.header.timestamp() as u32
    }
}

/// NAL types found at the start of an RTP payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PayloadNals {
    pub sps: bool,
    pub pps: bool,
    /// A key frame's first slice (`first_mb_in_slice == 0`) starts in this
    /// packet: single NAL, STAP-A, or FU-A start fragment.
    pub idr_start: bool,
}

impl PayloadNals {
    pub fn inspect(payload: &[u8]) -> Self {
        let mut found = Self::default();
        let Some(kind) = nal_type(payload) else {
            return found;
        };
        match kind {
            NAL_STAP_A => {
                let mut rest = &payload[1..];
                while rest.len() >= 2 {
                    let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                    let Some(nal) = rest.get(2..2 + size) else { break };
                    found.mark(nal_type(nal), nal.get(1));
                    rest = &rest[2 + size..];
                }
            }
            NAL_FU_A => {
                if let Some(&fu_header) = payload.get(1)
                    && fu_header & 0x80 != 0
                {
                    found.mark(Some(fu_header & 0x1f), payload.get(2));
                }
            }
            _ => found.mark(Some(kind), payload.get(1)),
        }
        found
    }

    /// `slice_header` is the byte after the NAL header; its top bit is set
    /// when `first_mb_in_slice` is zero.
    fn mark(&mut self, kind: Option<u8>, slice_header: Option<&u8>) {
        match kind {
            Some(NAL_SPS) => self.sps = true,
            Some(NAL_PPS) => self.pps = true,
            Some(NAL_IDR) if slice_header.is_some_and(|b| b & 0x80 != 0) => {
                self.idr_start = true
            }
            _ => {}
        }
    }
}

/// Ensures every key frame forwarded to viewers is preceded by SPS/PPS.
///
/// Packets pass through untouched until an IDR slice starts without
/// in-band parameter sets since the previous key frame. In that case a
/// STAP-A packet carrying the last known SPS and PPS is emitted ahead of
/// it, and every following packet's sequence number is shifted by the
/// number of packets injected so far.
#[derive(Debug, Default)]
pub struct ParameterSetInjector {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    in_band: bool,
    seq_offset: u16,
}

impl ParameterSetInjector {
    /// Seed with parameter sets advertised in the source's SDP.
    pub fn from_sprop(sprop: Option<&str>) -> Self {
        let (sps, pps) = sprop.map(decode_sprop_parameter_sets).unwrap_or_default();
        Self {
            sps,
            pps,
            ..Self::default()
        }
    }

    pub fn has_parameter_sets(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// Process one RTP packet; returns the packets to forward, in order.
    pub fn process(&mut self, packet: Bytes) -> Vec<Bytes> {
        let Some(view) = RtpPacketView::parse(&packet) else {
            return vec![packet];
        };
        let nals = PayloadNals::inspect(view.payload);
        if nals.sps || nals.pps {
            self.learn(view.payload);
            self.in_band = true;
        }

        let mut out = Vec::with_capacity(2);
        if nals.idr_start {
            if !self.in_band {
                if let Some(stap) = self.stap_a(&view) {
                    tracing::trace!(seq = view.sequence, "prepending SPS/PPS to key frame");
                    out.push(stap);
                    self.seq_offset = self.seq_offset.wrapping_add(1);
                }
            }
            self.in_band = false;
        }

        if self.seq_offset == 0 {
            out.push(packet);
        } else {
            let mut shifted = packet.to_vec();
            rtp::set_sequence(&mut shifted, view.sequence.wrapping_add(self.seq_offset));
            out.push(Bytes::from(shifted));
        }
        out
    }

    fn learn(&mut self, payload: &[u8]) {
        let mut store = |nal: &[u8]| match nal_type(nal) {
            Some(NAL_SPS) => self.sps = Some(nal.to_vec()),
            Some(NAL_PPS) => self.pps = Some(nal.to_vec()),
            _ => {}
        };
        if nal_type(payload) == Some(NAL_STAP_A) {
            let mut rest = &payload[1..];
            while rest.len() >= 2 {
                let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                let Some(nal) = rest.get(2..2 + size) else { break };
                store(nal);
                rest = &rest[2 + size..];
            }
        } else {
            store(payload);
        }
    }

    /// STAP-A (RFC 6184 §5.7.1) sharing the IDR packet's timestamp and SSRC,
    /// taking the sequence slot just before it.
    fn stap_a(&self, idr: &RtpPacketView<'_>) -> Option<Bytes> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        let nri = sps[0] & 0x60;
        let header = rtp::build_header(
            idr.payload_type,
            false,
            idr.sequence.wrapping_add(self.seq_offset),
            idr.timestamp,
            idr.ssrc,
        );
        let mut packet = Vec::with_capacity(12 + 1 + 4 + sps.len() + pps.len());
        packet.extend_from_slice(&header);
        packet.push(nri | NAL_STAP_A);
        for nal in [sps, pps] {
            packet.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            packet.extend_from_slice(nal);
        }
        Some(Bytes::from(packet))
    }
}
