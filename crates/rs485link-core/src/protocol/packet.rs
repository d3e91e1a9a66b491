//! Frame encoding
//!
//! Builds wire frames and implements the DLE byte-stuffing used between the
//! start and end markers.
//!
//! The CRC32 covers address + length + payload as they are before stuffing,
//! and is itself stuffed on the wire.

use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;

use super::{
    is_reserved, FramingFault, ProtocolError, CHECKSUM_LEN, END_MARKER, ESCAPE_BYTE, ESCAPE_XOR,
    MAX_PAYLOAD_LEN, START_MARKER,
};

/// A checked frame
///
/// Only built by [`Frame::new`] or by parsing, so the payload always fits the
/// length field and the checksum always matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    address: u8,
    payload: Vec<u8>,
    checksum: u32,
}

impl Frame {
    /// Create a frame for `address`, computing its checksum
    pub fn new(address: u8, payload: Vec<u8>) -> Result<Self, ProtocolError> {
        check_payload_len(payload.len())?;
        let checksum = calculate_crc(address, &payload);
        Ok(Self {
            address,
            payload,
            checksum,
        })
    }

    /// Destination address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Payload bytes (not stuffed)
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take the payload out of the frame
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// CRC32 over address, length and payload
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Payload length as carried in the length field
    pub fn length(&self) -> u8 {
        self.payload.len() as u8
    }

    /// Encode the frame to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_size_hint());
        bytes.push(START_MARKER);
        stuff_into(&[self.address, self.length()], &mut bytes);
        stuff_into(&self.payload, &mut bytes);

        let mut crc_bytes = [0u8; CHECKSUM_LEN];
        BigEndian::write_u32(&mut crc_bytes, self.checksum);
        stuff_into(&crc_bytes, &mut bytes);

        bytes.push(END_MARKER);
        bytes
    }

    /// Parse one complete wire frame, markers included
    ///
    /// Leading bytes before the start marker are ignored, as the streaming
    /// decoder does.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let start = data
            .iter()
            .position(|&b| b == START_MARKER)
            .ok_or(ProtocolError::Framing(FramingFault::TooShort(0)))?;
        let body = &data[start + 1..];
        let end = body
            .iter()
            .position(|&b| b == END_MARKER)
            .ok_or(ProtocolError::Framing(FramingFault::TooShort(body.len())))?;

        let body = unstuff(&body[..end])?;
        Self::from_body(&body)
    }

    /// Validate a de-stuffed frame body (everything between the markers)
    pub(crate) fn from_body(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < 2 + CHECKSUM_LEN {
            return Err(ProtocolError::Framing(FramingFault::TooShort(body.len())));
        }

        let crc_at = body.len() - CHECKSUM_LEN;
        let received_crc = BigEndian::read_u32(&body[crc_at..]);

        let mut hasher = Hasher::new();
        hasher.update(&body[..crc_at]);
        let expected_crc = hasher.finalize();

        if received_crc != expected_crc {
            return Err(ProtocolError::ChecksumMismatch {
                expected: expected_crc,
                actual: received_crc,
            });
        }

        let address = body[0];
        let declared = body[1];
        let payload = &body[2..crc_at];
        if payload.len() != declared as usize {
            return Err(ProtocolError::Framing(FramingFault::LengthMismatch {
                declared,
                actual: payload.len(),
            }));
        }

        Ok(Self {
            address,
            payload: payload.to_vec(),
            checksum: received_crc,
        })
    }

    fn encoded_size_hint(&self) -> usize {
        // Markers plus a little room for escapes
        2 + 2 + self.payload.len() + CHECKSUM_LEN + 8
    }
}

/// Encode `payload` for `address` into a complete wire frame
pub fn encode(address: u8, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    Frame::new(address, payload.to_vec()).map(|frame| frame.to_bytes())
}

/// Escape every reserved byte in `data`
pub fn stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    stuff_into(data, &mut out);
    out
}

/// Reverse [`stuff`]
///
/// Fails on an unescaped marker, a dangling escape, or an escape whose
/// target is not a reserved byte, so every input has at most one decoding.
pub fn unstuff(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();

    while let Some(&b) = iter.next() {
        match b {
            ESCAPE_BYTE => {
                let next = *iter
                    .next()
                    .ok_or(ProtocolError::Framing(FramingFault::TooShort(data.len())))?;
                let original = next ^ ESCAPE_XOR;
                if !is_reserved(original) {
                    return Err(ProtocolError::Framing(FramingFault::InvalidEscape(next)));
                }
                out.push(original);
            }
            START_MARKER => return Err(ProtocolError::Framing(FramingFault::UnexpectedStart)),
            END_MARKER => {
                return Err(ProtocolError::Framing(FramingFault::LengthMismatch {
                    declared: 0,
                    actual: out.len(),
                }))
            }
            _ => out.push(b),
        }
    }

    Ok(out)
}

fn stuff_into(data: &[u8], out: &mut Vec<u8>) {
    for &b in data {
        if is_reserved(b) {
            out.push(ESCAPE_BYTE);
            out.push(b ^ ESCAPE_XOR);
        } else {
            out.push(b);
        }
    }
}

fn check_payload_len(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(())
}

/// CRC32 over address, length and payload
pub(crate) fn calculate_crc(address: u8, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[address, payload.len() as u8]);
    hasher.update(payload);
    hasher.finalize()
}
