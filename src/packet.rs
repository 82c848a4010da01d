//! Wire layout for audio datagrams.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        sequence number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  ciphertext (rest of datagram)                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! One packet is one datagram, so the payload length is implied.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed header in bytes
pub const HEADER_LEN: usize = 8;

/// Largest UDP payload; uncompressed PCM frames exceed a typical MTU
pub const MAX_DATAGRAM_LEN: usize = 65_507;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram truncated: {len} bytes, header needs {HEADER_LEN}")]
    Truncated { len: usize },
}

/// Audio packet as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub sequence_number: u32,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl AudioPacket {
    pub fn new(sequence_number: u32, timestamp: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_number,
            timestamp,
            payload: payload.into(),
        }
    }
}

pub fn encode(packet: &AudioPacket) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + packet.payload.len());
    buf.put_u32(packet.sequence_number);
    buf.put_u32(packet.timestamp);
    buf.put_slice(&packet.payload);
    buf.freeze()
}

pub fn decode(datagram: &[u8]) -> Result<AudioPacket, DecodeError> {
    if datagram.len() < HEADER_LEN {
        return Err(DecodeError::Truncated { len: datagram.len() });
    }

    let mut header = &datagram[..HEADER_LEN];
    let sequence_number = header.get_u32();
    let timestamp = header.get_u32();

    Ok(AudioPacket {
        sequence_number,
        timestamp,
        payload: Bytes::copy_from_slice(&datagram[HEADER_LEN..]),
    })
}

/// Signed distance from `b` to `a` in modulo-2^32 space.
///
/// Positive when `a` is newer than `b`.
pub fn seq_distance(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// True when `a` precedes `b`, taking wraparound into account
pub fn seq_is_before(a: u32, b: u32) -> bool {
    seq_distance(a, b) < 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout_is_big_endian() {
        let packet = AudioPacket::new(0x0102_0304, 0x0a0b_0c0d, vec![0xff, 0xee]);
        let bytes = encode(&packet);

        assert_eq!(&bytes[..], &[1, 2, 3, 4, 0x0a, 0x0b, 0x0c, 0x0d, 0xff, 0xee]);
    }

    #[test]
    fn test_decode_inverts_encode() {
        let packet = AudioPacket::new(u32::MAX, 960 * 7, vec![9u8; 120]);
        assert_eq!(decode(&encode(&packet)).unwrap(), packet);

        let empty = AudioPacket::new(1, 2, Vec::new());
        assert_eq!(decode(&encode(&empty)).unwrap(), empty);
    }

    #[test]
    fn test_decode_rejects_short_datagram() {
        assert_eq!(decode(&[0u8; 7]), Err(DecodeError::Truncated { len: 7 }));
        assert_eq!(decode(&[]), Err(DecodeError::Truncated { len: 0 }));
    }

    #[test]
    fn test_sequence_comparison_wraps() {
        assert!(seq_is_before(u32::MAX, 0));
        assert!(!seq_is_before(0, u32::MAX));
        assert!(seq_is_before(5, 6));
        assert_eq!(seq_distance(2, u32::MAX - 1), 4);
        assert_eq!(seq_distance(10, 10), 0);
    }
}
