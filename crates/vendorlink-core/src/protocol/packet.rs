//! Application packet framing.
//!
//! ```text
//! +------+------+-------+-------+-----------+-------------+----------+
//! | 0xFF | 0x02 | lenHi | lenLo | messageId | payload ... | checksum |
//! +------+------+-------+-------+-----------+-------------+----------+
//! ```
//!
//! `len` counts the 5 header bytes plus the payload. The checksum is the byte
//! that brings the sum of every byte in the frame to zero (mod 256).

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;
use thiserror::Error;

use super::constants::{
    CHECKSUM_LEN, FRAME_MARKER, FRAME_START, HEADER_LEN, MAX_FRAME_LEN, MAX_PAYLOAD_LEN,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Bad start bytes: {0:02X} {1:02X}")]
    BadStart(u8, u8),
    #[error("Length field says {declared} bytes but frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

/// A decoded (or about to be encoded) application packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Packet {
    pub message_id: u8,
    pub payload: Vec<u8>,
    pub checksum: u8,
}

impl Packet {
    /// Build a packet, rejecting oversized payloads before anything is sent.
    pub fn new(message_id: u8, payload: &[u8]) -> Result<Self, PacketError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        let header = header_bytes(message_id, payload.len());
        let checksum = checksum(header.iter().chain(payload.iter()));
        Ok(Self {
            message_id,
            payload: payload.to_vec(),
            checksum,
        })
    }

    /// Value of the 2-byte length field.
    pub fn declared_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.declared_len() + CHECKSUM_LEN);
        buf.extend_from_slice(&header_bytes(self.message_id, self.payload.len()));
        buf.extend_from_slice(&self.payload);
        buf.push(self.checksum);
        buf
    }

    /// Parse one complete frame.
    pub fn from_bytes(frame: &[u8]) -> Result<Self, PacketError> {
        if frame.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(PacketError::TooShort {
                expected: HEADER_LEN + CHECKSUM_LEN,
                actual: frame.len(),
            });
        }
        if frame[0] != FRAME_START || frame[1] != FRAME_MARKER {
            return Err(PacketError::BadStart(frame[0], frame[1]));
        }

        let declared = BigEndian::read_u16(&frame[2..4]) as usize;
        if declared < HEADER_LEN || declared + CHECKSUM_LEN != frame.len() {
            return Err(PacketError::LengthMismatch {
                declared,
                actual: frame.len(),
            });
        }
        if declared - HEADER_LEN > MAX_PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge {
                len: declared - HEADER_LEN,
                max: MAX_PAYLOAD_LEN,
            });
        }

        let expected = checksum(frame[..declared].iter());
        let actual = frame[declared];
        if expected != actual {
            return Err(PacketError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            message_id: frame[4],
            payload: frame[HEADER_LEN..declared].to_vec(),
            checksum: actual,
        })
    }
}

/// Encode `payload` under `message_id` into wire bytes.
pub fn encode(message_id: u8, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    Packet::new(message_id, payload).map(|p| p.to_bytes())
}

/// Decode a chunk if it is exactly one well-formed frame.
pub fn decode(frame: &[u8]) -> Result<Packet, PacketError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(PacketError::PayloadTooLarge {
            len: frame.len().saturating_sub(HEADER_LEN + CHECKSUM_LEN),
            max: MAX_PAYLOAD_LEN,
        });
    }
    Packet::from_bytes(frame)
}

/// Two's-complement checksum over `bytes`.
pub fn checksum<'a>(bytes: impl IntoIterator<Item = &'a u8>) -> u8 {
    let sum = bytes
        .into_iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    0u8.wrapping_sub(sum)
}

fn header_bytes(message_id: u8, payload_len: usize) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = FRAME_START;
    header[1] = FRAME_MARKER;
    // payload_len <= MAX_PAYLOAD_LEN, fits in u16
    BigEndian::write_u16(&mut header[2..4], (HEADER_LEN + payload_len) as u16);
    header[4] = message_id;
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_sum(frame: &[u8]) -> u8 {
        frame.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
    }

    #[test]
    fn test_checksum_zeroes_frame_sum() {
        for len in 0..=MAX_PAYLOAD_LEN {
            let payload: Vec<u8> = (0..len).map(|i| (i * 37 + 11) as u8).collect();
            let frame = encode(0x42, &payload).unwrap();
            assert_eq!(frame.len(), HEADER_LEN + len + CHECKSUM_LEN);
            assert_eq!(frame_sum(&frame), 0, "payload len {}", len);
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = encode(0x10, &[0xAA, 0xBB]).unwrap();
        assert_eq!(&frame[..5], &[0xFF, 0x02, 0x00, 0x07, 0x10]);
        assert_eq!(&frame[5..7], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_empty_payload_checksum() {
        // FF + 02 + 00 + 05 + 01 = 0x107 -> 0x07, complement 0xF9
        let frame = encode(0x01, &[]).unwrap();
        assert_eq!(frame, vec![0xFF, 0x02, 0x00, 0x05, 0x01, 0xF9]);
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            encode(0x01, &payload),
            Err(PacketError::PayloadTooLarge { len: 51, max: 50 })
        );
    }

    #[test]
    fn test_decode_valid_frame() {
        let frame = encode(0x33, b"hi").unwrap();
        let packet = decode(&frame).unwrap();
        assert_eq!(packet.message_id, 0x33);
        assert_eq!(packet.payload, b"hi");
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let mut frame = encode(0x33, b"hello").unwrap();
        frame[6] ^= 0x01;
        assert!(matches!(
            decode(&frame),
            Err(PacketError::ChecksumMismatch { .. })
        ));

        assert!(matches!(
            decode(&[0xFF, 0x55, 0x02, 0x00, 0xEE, 0x10]),
            Err(PacketError::BadStart(0xFF, 0x55))
        ));
        assert!(matches!(
            decode(&[0xFF, 0x02]),
            Err(PacketError::TooShort { .. })
        ));
    }
}
