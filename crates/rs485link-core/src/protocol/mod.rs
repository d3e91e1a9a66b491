//! Wire Protocol
//!
//! Implements the rs485link frame format: STX/ETX delimited frames with
//! DLE byte-stuffing and a CRC32 trailer, plus the transport abstraction the
//! master and slave engines drive.
//!
//! Frame format:
//! - 1 byte: start marker (`STX`)
//! - 1 byte: destination address
//! - 1 byte: payload length
//! - N bytes: payload
//! - 4 bytes: CRC32 of address + length + payload (big-endian)
//! - 1 byte: end marker (`ETX`)
//!
//! Everything between the markers is byte-stuffed.

use std::time::{Duration, Instant};

mod decoder;
mod error;
mod packet;
pub mod serial;
mod stream;

pub use decoder::FrameDecoder;
pub use error::{ErrorKind, FramingFault, ProtocolError};
pub use packet::{encode, stuff, unstuff, Frame};
pub use serial::{list_ports, open_port, DirectionControl, PortInfo, SerialTransport};
pub use stream::{BusPort, Direction, MemoryBus, Transport};

/// Start of frame (ASCII STX)
pub const START_MARKER: u8 = 0x02;

/// End of frame (ASCII ETX)
pub const END_MARKER: u8 = 0x03;

/// Escape byte (ASCII DLE); the following byte is XORed with [`ESCAPE_XOR`]
pub const ESCAPE_BYTE: u8 = 0x10;

/// Transform applied to an escaped byte
pub const ESCAPE_XOR: u8 = 0x20;

/// Maximum payload length, bounded by the one-byte length field
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Width of the CRC32 trailer in bytes
pub const CHECKSUM_LEN: usize = 4;

/// Address of the master node; slaves address their replies here
pub const MASTER_ADDRESS: u8 = 0;

/// Address accepted by every slave
pub const BROADCAST_ADDRESS: u8 = 255;

/// First address a slave may use
pub const FIRST_SLAVE_ADDRESS: u8 = 1;

/// Last address a slave may use
pub const LAST_SLAVE_ADDRESS: u8 = BROADCAST_ADDRESS - 1;

/// Default baud rate for the bus
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default time to wait for a slave's reply, per attempt
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u8 = 3;

/// Maximum gap between two bytes of the same frame before it is discarded
pub const PACKET_TIMEOUT_MS: u64 = 500;

/// Time the line must stay quiet before the master transmits
pub const LINE_READY_TIME_MS: u64 = 10;

/// Settling time for the transceiver after a direction change
pub const TRANSCEIVER_TOGGLE_TIME_US: u64 = 100;

/// Returns true for bytes that must be escaped inside a frame
pub fn is_reserved(byte: u8) -> bool {
    matches!(byte, START_MARKER | END_MARKER | ESCAPE_BYTE)
}

/// Returns true if `address` may be used by a slave
pub fn is_valid_slave_address(address: u8) -> bool {
    (FIRST_SLAVE_ADDRESS..=LAST_SLAVE_ADDRESS).contains(&address)
}

/// Returns true if the master may send a request expecting a reply to `address`
pub fn is_unicast_address(address: u8) -> bool {
    is_valid_slave_address(address)
}

/// Deadline `timeout` from now
///
/// Timeouts too long for an [`Instant`] are clamped to about a century, which
/// is as good as never.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_after_huge_timeout() {
        let before = Instant::now();
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > before + Duration::from_secs(3600));

        let short = deadline_after(Duration::from_millis(10));
        assert!(short >= before + Duration::from_millis(10));
    }

    #[test]
    fn test_reserved_bytes() {
        assert!(is_reserved(START_MARKER));
        assert!(is_reserved(END_MARKER));
        assert!(is_reserved(ESCAPE_BYTE));
        assert!(!is_reserved(b'A'));
        // Escaped forms must never be reserved themselves
        for b in [START_MARKER, END_MARKER, ESCAPE_BYTE] {
            assert!(!is_reserved(b ^ ESCAPE_XOR));
        }
    }

    #[test]
    fn test_slave_address_range() {
        assert!(!is_valid_slave_address(MASTER_ADDRESS));
        assert!(!is_valid_slave_address(BROADCAST_ADDRESS));
        assert!(is_valid_slave_address(1));
        assert!(is_valid_slave_address(254));
    }
}
