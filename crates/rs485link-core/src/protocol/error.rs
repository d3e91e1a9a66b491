//! Protocol errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during bus communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame rejected before its checksum could be checked
    #[error("Framing error: {0}")]
    Framing(FramingFault),

    /// Checksum trailer disagrees with the frame contents
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// CRC carried by the frame
        expected: u32,
        /// CRC computed over the received bytes
        actual: u32,
    },

    /// No reply before the deadline
    #[error("Response timeout")]
    Timeout,

    /// Every allowed attempt failed
    #[error("No valid response after {attempts} attempts (last failure: {last})")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Why the final attempt failed
        last: ErrorKind,
    },

    /// Payload longer than a frame can carry
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Length that was asked for
        len: usize,
        /// Largest allowed payload
        max: usize,
    },

    /// Request cancelled or the master stopped
    #[error("Request cancelled")]
    Cancelled,

    /// Address outside the range allowed for this use
    #[error("Invalid address: {0}")]
    InvalidAddress(u8),

    /// A request is already in flight
    #[error("A request is already in flight")]
    Busy,

    /// Serial port failure
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed response converted back into an error
    #[error("Request failed: {0}")]
    RequestFailed(ErrorKind),

    /// I/O failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Classify this error for reporting in a [`Response`](crate::master::Response)
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Framing(_) => ErrorKind::Framing,
            ProtocolError::ChecksumMismatch { .. } => ErrorKind::Checksum,
            ProtocolError::Timeout => ErrorKind::Timeout,
            ProtocolError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            ProtocolError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            ProtocolError::Cancelled => ErrorKind::Cancelled,
            ProtocolError::InvalidAddress(_) => ErrorKind::InvalidAddress,
            ProtocolError::Busy => ErrorKind::Busy,
            ProtocolError::SerialError(_) | ProtocolError::IoError(_) => ErrorKind::Io,
            ProtocolError::Config(_) => ErrorKind::Config,
            ProtocolError::RequestFailed(kind) => *kind,
        }
    }
}

/// Reason a frame was rejected before its checksum could be verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FramingFault {
    /// A start marker appeared inside a frame
    UnexpectedStart,
    /// An escape byte was followed by a byte that is not an escaped marker
    InvalidEscape(u8),
    /// The frame ended before address, length and checksum were complete
    TooShort(usize),
    /// The length field disagrees with the number of payload bytes
    LengthMismatch { declared: u8, actual: usize },
    /// The frame grew past the largest legal frame without an end marker
    Overflow,
    /// The gap between two bytes of a frame exceeded the packet timeout
    PacketTimeout,
}

impl std::fmt::Display for FramingFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingFault::UnexpectedStart => write!(f, "unexpected start marker"),
            FramingFault::InvalidEscape(b) => write!(f, "invalid escape sequence (0x10 {:#04x})", b),
            FramingFault::TooShort(n) => write!(f, "frame too short ({} bytes)", n),
            FramingFault::LengthMismatch { declared, actual } => write!(
                f,
                "length field says {} bytes, payload has {}",
                declared, actual
            ),
            FramingFault::Overflow => write!(f, "frame exceeds maximum size"),
            FramingFault::PacketTimeout => write!(f, "inter-byte timeout"),
        }
    }
}

/// Terminal error category carried by a failed response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed frame
    Framing,
    /// Reply failed its checksum
    Checksum,
    /// No reply within the attempt's timeout
    Timeout,
    /// All attempts used up; see the response's last failure
    RetriesExhausted,
    /// Payload longer than [`MAX_PAYLOAD_LEN`](super::MAX_PAYLOAD_LEN)
    PayloadTooLarge,
    /// Cancelled before completion
    Cancelled,
    /// Bad destination address, or a reply not addressed to the master
    InvalidAddress,
    /// The master was already busy
    Busy,
    /// Transport read or write failed
    Io,
    /// Invalid configuration
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Framing => "framing",
            ErrorKind::Checksum => "checksum",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RetriesExhausted => "retries exhausted",
            ErrorKind::PayloadTooLarge => "payload too large",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidAddress => "invalid address",
            ErrorKind::Busy => "busy",
            ErrorKind::Io => "i/o",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

impl From<serialport::Error> for ProtocolError {
    fn from(e: serialport::Error) -> Self {
        ProtocolError::SerialError(e.to_string())
    }
}
