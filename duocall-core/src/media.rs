//! Media packet value types and RTCP feedback inspection
//!
//! Packets are relayed, never decoded: the transport host hands the core
//! the raw buffer plus the header fields the relay decision needs (SSRC,
//! sequence number, timestamp, and for simulcast video the RID, temporal
//! layer id and keyframe flag it already extracted during depacketization).

use crate::types::MediaKind;
use bytes::Bytes;

/// One inbound or outbound RTP packet.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub kind: MediaKind,
    /// Raw packet bytes as received from (or handed to) the transport.
    pub data: Bytes,
    pub ssrc: u32,
    pub sequence_number: u16,
    pub timestamp: u32,
    /// Simulcast restriction id, when RID-based simulcast is negotiated.
    pub rid: Option<String>,
    /// Codec temporal layer id, when the payload carries one.
    pub temporal_layer: Option<u8>,
    /// Whether this packet starts a full (non-differential) video frame.
    pub keyframe: bool,
}

impl RtpPacket {
    /// A copy of this packet with rewritten header fields, leaving the
    /// original untouched for the sender's own bookkeeping.
    #[must_use]
    pub fn with_header(&self, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            sequence_number,
            timestamp,
            ssrc,
            ..self.clone()
        }
    }
}

/// One inbound RTCP compound packet.
#[derive(Debug, Clone)]
pub struct RtcpPacket {
    /// True when this feedback belongs to the video stream.
    pub video: bool,
    pub data: Bytes,
}

/// One data-channel message.
#[derive(Debug, Clone)]
pub struct DataPacket {
    pub label: Option<String>,
    pub binary: bool,
    pub data: Bytes,
}

const RTCP_PT_PSFB: u8 = 206;
const RTCP_PSFB_FMT_AFB: u8 = 15;

/// Extract the receiver-estimated maximum bitrate from a compound RTCP
/// buffer, if it contains a REMB block. Returns `None` for anything else;
/// malformed input is treated as "no REMB", never as an error.
#[must_use]
pub fn remb_bitrate(mut data: &[u8]) -> Option<u32> {
    while data.len() >= 4 {
        let version = data[0] >> 6;
        if version != 2 {
            return None;
        }
        let fmt = data[0] & 0x1f;
        let pt = data[1];
        let words = usize::from(u16::from_be_bytes([data[2], data[3]]));
        let packet_len = (words + 1) * 4;
        if packet_len > data.len() {
            return None;
        }
        // PSFB application-layer feedback: header, sender SSRC, media SSRC,
        // then the "REMB" identifier and a 6-bit exponent / 18-bit mantissa.
        if pt == RTCP_PT_PSFB && fmt == RTCP_PSFB_FMT_AFB && packet_len >= 20 {
            let packet = &data[..packet_len];
            if &packet[12..16] == b"REMB" {
                let exp = u32::from(packet[17] >> 2);
                let mantissa = (u32::from(packet[17] & 0x03) << 16)
                    | (u32::from(packet[18]) << 8)
                    | u32::from(packet[19]);
                let bitrate = u64::from(mantissa) << exp;
                return Some(u32::try_from(bitrate).unwrap_or(u32::MAX));
            }
        }
        data = &data[packet_len..];
    }
    None
}
