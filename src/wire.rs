//! RDP's wire encoding.
//!
//! Unlike most header-first protocols, the RDP header trails its payload:
//! an outbound buffer is `[ application payload | eack list ][ header ]`,
//! so `RdpHeader::decode` peels the fixed-size header off the *end* of a
//! buffer and hands back whatever precedes it.

use byteorder::{ByteOrder, NetworkEndian};

use crate::err::RdpError;

mod field {
    use std::ops::Range;
    pub const FLAGS: usize = 0;
    pub const SEQ: Range<usize> = 1..3;
    pub const ACK: Range<usize> = 3..5;
}

pub const HEADER_LEN: usize = 5;
pub const SYN_PAYLOAD_LEN: usize = 24;

const FLAG_RST: u8 = 0b1000_0000;
const FLAG_EAK: u8 = 0b0100_0000;
const FLAG_ACK: u8 = 0b0010_0000;
const FLAG_SYN: u8 = 0b0001_0000;

/// The flags byte plus the two sequence fields carried on every RDP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RdpHeader {
    pub rst: bool,
    pub eak: bool,
    pub ack: bool,
    pub syn: bool,
    pub seq_nr: u16,
    pub ack_nr: u16,
}

impl RdpHeader {
    fn flags_byte(&self) -> u8 {
        let mut b = 0u8;
        if self.rst {
            b |= FLAG_RST;
        }
        if self.eak {
            b |= FLAG_EAK;
        }
        if self.ack {
            b |= FLAG_ACK;
        }
        if self.syn {
            b |= FLAG_SYN;
        }
        b
    }

    /// Append the encoded header to `buf`, which already holds the payload.
    pub fn append_to(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.resize(start + HEADER_LEN, 0);
        let header = &mut buf[start..];
        header[field::FLAGS] = self.flags_byte();
        NetworkEndian::write_u16(&mut header[field::SEQ], self.seq_nr);
        NetworkEndian::write_u16(&mut header[field::ACK], self.ack_nr);
    }

    /// Split a received buffer into `(header, payload)`. `payload` is
    /// everything that preceded the header on the wire.
    pub fn decode(bytes: &[u8]) -> Result<(RdpHeader, &[u8]), RdpError> {
        if bytes.len() < HEADER_LEN {
            return Err(RdpError::ProtocolViolation("segment shorter than the RDP header"));
        }
        let split = bytes.len() - HEADER_LEN;
        let (payload, header) = bytes.split_at(split);
        let flags = header[field::FLAGS];
        let seq_nr = NetworkEndian::read_u16(&header[field::SEQ]);
        let ack_nr = NetworkEndian::read_u16(&header[field::ACK]);
        Ok((
            RdpHeader {
                rst: flags & FLAG_RST != 0,
                eak: flags & FLAG_EAK != 0,
                ack: flags & FLAG_ACK != 0,
                syn: flags & FLAG_SYN != 0,
                seq_nr,
                ack_nr,
            },
            payload,
        ))
    }
}

/// Overwrite the `ack_nr` field of an already-encoded buffer in place, used
/// when a queued retransmission is re-sent with a freshened acknowledgement.
pub fn patch_ack_nr(bytes: &mut [u8], ack_nr: u16) {
    let len = bytes.len();
    if len < HEADER_LEN {
        return;
    }
    let header = &mut bytes[len - HEADER_LEN..];
    NetworkEndian::write_u16(&mut header[field::ACK], ack_nr);
}

/// The six connection parameters an opener proposes in its SYN payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynParams {
    pub window_size: u32,
    pub conn_timeout_ms: u32,
    pub packet_timeout_ms: u32,
    pub delayed_acks: u32,
    pub ack_timeout_ms: u32,
    pub ack_delay_count: u32,
}

impl SynParams {
    pub fn encode(&self) -> [u8; SYN_PAYLOAD_LEN] {
        let mut buf = [0u8; SYN_PAYLOAD_LEN];
        NetworkEndian::write_u32(&mut buf[0..4], self.window_size);
        NetworkEndian::write_u32(&mut buf[4..8], self.conn_timeout_ms);
        NetworkEndian::write_u32(&mut buf[8..12], self.packet_timeout_ms);
        NetworkEndian::write_u32(&mut buf[12..16], self.delayed_acks);
        NetworkEndian::write_u32(&mut buf[16..20], self.ack_timeout_ms);
        NetworkEndian::write_u32(&mut buf[20..24], self.ack_delay_count);
        buf
    }

    /// The length of a SYN payload is authoritative: anything else is a
    /// malformed handshake, never a short or long read to tolerate.
    pub fn decode(bytes: &[u8]) -> Result<SynParams, RdpError> {
        if bytes.len() != SYN_PAYLOAD_LEN {
            return Err(RdpError::ProtocolViolation("SYN payload has the wrong length"));
        }
        Ok(SynParams {
            window_size: NetworkEndian::read_u32(&bytes[0..4]),
            conn_timeout_ms: NetworkEndian::read_u32(&bytes[4..8]),
            packet_timeout_ms: NetworkEndian::read_u32(&bytes[8..12]),
            delayed_acks: NetworkEndian::read_u32(&bytes[12..16]),
            ack_timeout_ms: NetworkEndian::read_u32(&bytes[16..20]),
            ack_delay_count: NetworkEndian::read_u32(&bytes[20..24]),
        })
    }
}

/// Encode a list of out-of-order sequence numbers for an EACK segment.
pub fn encode_eack_list(seqs: &[u16]) -> Vec<u8> {
    let mut buf = vec![0u8; seqs.len() * 2];
    for (i, seq) in seqs.iter().enumerate() {
        NetworkEndian::write_u16(&mut buf[i * 2..i * 2 + 2], *seq);
    }
    buf
}

/// Decode the sequence-number list carried by an EACK segment's payload.
pub fn decode_eack_list(bytes: &[u8]) -> Result<Vec<u16>, RdpError> {
    if bytes.len() % 2 != 0 {
        return Err(RdpError::ProtocolViolation("EACK payload has an odd length"));
    }
    Ok(bytes.chunks_exact(2).map(NetworkEndian::read_u16).collect())
}

/// `a < b` accounting for 16-bit sequence number wraparound (the signed-half
/// trick from RFC 1323/9293: the shorter distance around the ring wins).
pub fn wrapping_lt(a: u16, b: u16) -> bool {
    a.wrapping_sub(b) > 0x8000
}

/// `a <= b`, wraparound-aware.
pub fn wrapping_le(a: u16, b: u16) -> bool {
    a == b || wrapping_lt(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_the_trailer() {
        let header = RdpHeader { rst: false, eak: true, ack: true, syn: false, seq_nr: 1001, ack_nr: 2000 };
        let mut buf = b"hello".to_vec();
        header.append_to(&mut buf);
        assert_eq!(buf.len(), 5 + HEADER_LEN);

        let (decoded, payload) = RdpHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn decode_rejects_undersized_buffers() {
        assert!(RdpHeader::decode(&[0u8; 3]).is_err());
    }

    #[test]
    fn syn_params_round_trip() {
        let params = SynParams {
            window_size: 5,
            conn_timeout_ms: 10_000,
            packet_timeout_ms: 1_000,
            delayed_acks: 1,
            ack_timeout_ms: 500,
            ack_delay_count: 5,
        };
        let decoded = SynParams::decode(&params.encode()).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn syn_params_rejects_wrong_length() {
        assert!(SynParams::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn eack_list_round_trips() {
        let seqs = vec![1002, 1004, 1005];
        let encoded = encode_eack_list(&seqs);
        assert_eq!(decode_eack_list(&encoded).unwrap(), seqs);
    }

    #[test]
    fn wrapping_lt_handles_rollover() {
        assert!(wrapping_lt(0xfffe, 2));
        assert!(!wrapping_lt(2, 0xfffe));
        assert!(wrapping_lt(1000, 1001));
        assert!(!wrapping_lt(1001, 1001));
    }

    #[test]
    fn patch_ack_nr_rewrites_the_trailer_in_place() {
        let header = RdpHeader { rst: false, eak: false, ack: true, syn: false, seq_nr: 7, ack_nr: 1 };
        let mut buf = b"x".to_vec();
        header.append_to(&mut buf);
        patch_ack_nr(&mut buf, 99);
        let (decoded, _) = RdpHeader::decode(&buf).unwrap();
        assert_eq!(decoded.ack_nr, 99);
        assert_eq!(decoded.seq_nr, 7);
    }
}
