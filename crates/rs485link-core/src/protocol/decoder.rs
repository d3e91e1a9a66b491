//! Streaming frame decoder
//!
//! Bytes arrive from the bus in arbitrary chunks. [`FrameDecoder`] buffers
//! them and runs a small state machine:
//! - `Hunting`: discard everything until a start marker
//! - `Body`: collect de-stuffed bytes until the end marker
//! - `Escape`: previous byte was DLE, the next one is transformed
//!
//! A framing fault drops the partial frame and resumes hunting at the next
//! start marker, so one corrupted frame never wedges the stream.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use super::packet::Frame;
use super::{
    is_reserved, FramingFault, ProtocolError, CHECKSUM_LEN, END_MARKER, ESCAPE_BYTE, ESCAPE_XOR,
    MAX_PAYLOAD_LEN, PACKET_TIMEOUT_MS, START_MARKER,
};

/// Largest de-stuffed body: address + length + payload + CRC
const MAX_BODY_LEN: usize = 2 + MAX_PAYLOAD_LEN + CHECKSUM_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Hunting,
    Body,
    Escape,
}

/// Incremental decoder for the wire frame format
#[derive(Debug)]
pub struct FrameDecoder {
    /// Bytes pushed but not yet examined
    pending: VecDeque<u8>,
    /// De-stuffed bytes of the frame being assembled
    body: Vec<u8>,
    state: State,
    /// When the last byte of the current frame was pushed
    last_byte_at: Option<Instant>,
    packet_timeout: Option<Duration>,
    /// A partial frame was dropped for inactivity and not yet reported
    timed_out: bool,
}

impl FrameDecoder {
    /// Create a decoder with the default inter-byte packet timeout
    pub fn new() -> Self {
        Self::with_packet_timeout(Some(Duration::from_millis(PACKET_TIMEOUT_MS)))
    }

    /// Create a decoder with a custom packet timeout (`None` disables it)
    pub fn with_packet_timeout(packet_timeout: Option<Duration>) -> Self {
        Self {
            pending: VecDeque::with_capacity(MAX_BODY_LEN * 2),
            body: Vec::with_capacity(MAX_BODY_LEN),
            state: State::Hunting,
            last_byte_at: None,
            packet_timeout,
            timed_out: false,
        }
    }

    /// Append received bytes
    ///
    /// If a frame was in progress and the gap since its last byte exceeds
    /// the packet timeout, the partial frame is discarded first.
    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let now = Instant::now();
        if self.is_stale(now) {
            debug!(
                buffered = self.body.len(),
                "packet timeout, discarding partial frame"
            );
            self.abandon_frame();
            self.timed_out = true;
        }
        self.last_byte_at = Some(now);
        self.pending.extend(bytes);
    }

    /// Decode the next frame from the buffered bytes
    ///
    /// Returns `Ok(None)` when more bytes are needed. Errors describe a
    /// single rejected frame; decoding continues on the next call.
    pub fn decode(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if std::mem::take(&mut self.timed_out) {
            return Err(ProtocolError::Framing(FramingFault::PacketTimeout));
        }
        while let Some(byte) = self.pending.pop_front() {
            match self.state {
                State::Hunting => {
                    if byte == START_MARKER {
                        self.begin_frame();
                    }
                }
                State::Body => match byte {
                    START_MARKER => {
                        // Resynchronise on this marker: it starts the next frame
                        self.begin_frame();
                        return Err(ProtocolError::Framing(FramingFault::UnexpectedStart));
                    }
                    END_MARKER => {
                        self.state = State::Hunting;
                        let result = Frame::from_body(&self.body);
                        self.body.clear();
                        return result.map(Some);
                    }
                    ESCAPE_BYTE => self.state = State::Escape,
                    b => self.accept(b)?,
                },
                State::Escape => {
                    if byte == START_MARKER {
                        self.begin_frame();
                        return Err(ProtocolError::Framing(FramingFault::UnexpectedStart));
                    }
                    let original = byte ^ ESCAPE_XOR;
                    if !is_reserved(original) {
                        self.abandon_frame();
                        return Err(ProtocolError::Framing(FramingFault::InvalidEscape(byte)));
                    }
                    self.state = State::Body;
                    self.accept(original)?;
                }
            }
        }

        Ok(None)
    }

    /// Decode every complete frame currently buffered, skipping errors
    pub fn decode_all(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            match self.decode() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => debug!("dropping frame: {}", e),
            }
        }
        frames
    }

    /// Drop all buffered bytes and any partial frame
    pub fn reset(&mut self) {
        self.pending.clear();
        self.abandon_frame();
        self.last_byte_at = None;
        self.timed_out = false;
    }

    /// True while a frame has been started but not finished
    pub fn in_frame(&self) -> bool {
        self.state != State::Hunting
    }

    /// Number of bytes pushed but not yet examined
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Check whether the partial frame has gone stale at `now`
    fn is_stale(&self, now: Instant) -> bool {
        match (self.packet_timeout, self.last_byte_at) {
            (Some(timeout), Some(last)) => {
                self.in_frame() && now.saturating_duration_since(last) > timeout
            }
            _ => false,
        }
    }

    fn begin_frame(&mut self) {
        self.body.clear();
        self.state = State::Body;
    }

    fn abandon_frame(&mut self) {
        self.body.clear();
        self.state = State::Hunting;
    }

    fn accept(&mut self, byte: u8) -> Result<(), ProtocolError> {
        if self.body.len() >= MAX_BODY_LEN {
            self.abandon_frame();
            return Err(ProtocolError::Framing(FramingFault::Overflow));
        }
        self.body.push(byte);
        Ok(())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;

    #[test]
    fn test_decode_in_small_chunks() {
        let encoded = encode(5, b"AB3x9").unwrap();
        let mut decoder = FrameDecoder::new();

        for chunk in encoded.chunks(2) {
            assert!(decoder.decode().unwrap().is_none());
            decoder.push(chunk);
        }

        let frame = decoder.decode().unwrap().expect("frame should be complete");
        assert_eq!(frame.address(), 5);
        assert_eq!(frame.payload(), b"AB3x9");
        assert!(decoder.decode().unwrap().is_none());
    }

    #[test]
    fn test_noise_before_frame_is_skipped() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0x00, 0x0a, 0x0a, 0xff, 0x41]);
        decoder.push(&encode(3, b"ok").unwrap());
        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(frame.payload(), b"ok");
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let mut bytes = encode(1, b"first").unwrap();
        bytes.extend(encode(2, b"second").unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let frames = decoder.decode_all();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].address(), 1);
        assert_eq!(frames[1].payload(), b"second");
    }

    #[test]
    fn test_resync_after_truncated_frame() {
        let good = encode(4, b"hello").unwrap();
        let mut bytes = good[..good.len() / 2].to_vec();
        bytes.extend(&good);

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);

        match decoder.decode() {
            Err(ProtocolError::Framing(FramingFault::UnexpectedStart)) => {}
            other => panic!("Expected UnexpectedStart, got {:?}", other),
        }
        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(frame.payload(), b"hello");
    }

    #[test]
    fn test_invalid_escape_hunts_for_next_start() {
        let mut bytes = vec![START_MARKER, 5, ESCAPE_BYTE, 0x41, 0x42, END_MARKER];
        bytes.extend(encode(5, b"x").unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::Framing(FramingFault::InvalidEscape(0x41)))
        ));
        assert_eq!(decoder.decode().unwrap().unwrap().payload(), b"x");
    }

    #[test]
    fn test_checksum_error_is_reported() {
        let mut bytes = encode(6, b"data").unwrap();
        bytes[4] ^= 0x01; // 'a' -> '`'

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
        assert!(!decoder.in_frame());
    }

    #[test]
    fn test_short_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[START_MARKER, 1, 0, END_MARKER]);
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::Framing(FramingFault::TooShort(2)))
        ));
    }

    #[test]
    fn test_overflow_without_end_marker() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[START_MARKER]);
        decoder.push(&vec![0x41; MAX_BODY_LEN + 1]);
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::Framing(FramingFault::Overflow))
        ));
        decoder.push(&encode(1, b"after").unwrap());
        assert_eq!(decoder.decode().unwrap().unwrap().payload(), b"after");
    }

    #[test]
    fn test_packet_timeout_discards_partial_frame() {
        let encoded = encode(8, b"slow").unwrap();
        let mut decoder = FrameDecoder::with_packet_timeout(Some(Duration::from_millis(20)));

        decoder.push(&encoded[..3]);
        assert!(decoder.decode().unwrap().is_none());
        assert!(decoder.in_frame());

        std::thread::sleep(Duration::from_millis(40));
        decoder.push(&encoded[3..]);
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::Framing(FramingFault::PacketTimeout))
        ));
        // The tail has no start marker, so nothing decodes
        assert!(decoder.decode().unwrap().is_none());
        assert!(!decoder.in_frame());
    }

    #[test]
    fn test_reset_clears_everything() {
        let encoded = encode(8, b"gone").unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);
        decoder.reset();
        assert_eq!(decoder.buffered(), 0);
        assert!(decoder.decode().unwrap().is_none());
    }
}
