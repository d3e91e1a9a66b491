//! Slave engine
//!
//! A slave listens on one address. Every valid frame addressed to it (or to
//! the broadcast address) is passed to its [`Handler`]; a unicast reply is
//! framed to the master's address and sent straight back.

mod handler;

pub use handler::{EchoHandler, Handler, PingPongHandler, SlaveContext};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_POLL_INTERVAL_MS;
use crate::protocol::{
    deadline_after, encode, Direction, Frame, FrameDecoder, ProtocolError, Transport, BROADCAST_ADDRESS,
    MASTER_ADDRESS,
};

/// Counters kept by the slave engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveStats {
    /// Frames addressed to this slave
    pub unicast_frames: u64,
    /// Broadcast frames handled
    pub broadcast_frames: u64,
    /// Frames for other addresses
    pub ignored_frames: u64,
    /// Frames dropped for checksum or framing faults
    pub dropped_frames: u64,
    /// Replies sent to the master
    pub replies: u64,
    /// Replies lost to a transport failure
    pub failed_replies: u64,
    /// Reads that failed in the transport
    pub read_errors: u64,
}

/// Receive/dispatch engine for a bus slave
pub struct Slave<T: Transport, H: Handler> {
    transport: T,
    handler: H,
    decoder: FrameDecoder,
    context: SlaveContext,
    poll_interval: Duration,
    stats: SlaveStats,
}

impl<T: Transport, H: Handler> Slave<T, H> {
    /// Create a slave listening on `address`
    pub fn new(transport: T, address: u8, handler: H) -> Result<Self, ProtocolError> {
        let context = SlaveContext::new(address)?;
        Ok(Self {
            transport,
            handler,
            decoder: FrameDecoder::new(),
            context,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            stats: SlaveStats::default(),
        })
    }

    /// Change how long one [`poll`](Self::poll) may wait for bytes
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Replace the frame decoder (e.g. to change the packet timeout)
    pub fn with_decoder(mut self, decoder: FrameDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Address the slave currently listens on
    pub fn address(&self) -> u8 {
        self.context.address()
    }

    /// Move the slave to another address
    pub fn set_address(&mut self, address: u8) -> Result<(), ProtocolError> {
        self.context.set_address(address)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> SlaveStats {
        self.stats
    }

    /// The application handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Mutable access to the application handler
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Consume the slave and return its transport and handler
    pub fn into_parts(self) -> (T, H) {
        (self.transport, self.handler)
    }

    /// Serve until `running` is cleared
    ///
    /// Transport errors are logged and the loop keeps listening; the master
    /// recovers lost traffic by retrying.
    pub fn run(&mut self, running: &AtomicBool) -> Result<(), ProtocolError> {
        info!(address = self.address(), "slave listening");
        while running.load(Ordering::SeqCst) {
            if let Err(e) = self.poll() {
                warn!(address = self.address(), "read failed: {}", e);
                // Don't spin on a port that fails straight away
                std::thread::sleep(self.poll_interval);
            }
        }
        info!(address = self.address(), "slave stopped");
        Ok(())
    }

    /// Read once (for at most the poll interval) and handle every complete
    /// frame received
    ///
    /// Returns the number of frames passed to the handler. Only a failed
    /// read is reported as an error; a failed reply is logged and counted.
    pub fn poll(&mut self) -> Result<usize, ProtocolError> {
        let bytes = match self.transport.read_available(deadline_after(self.poll_interval)) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.stats.read_errors += 1;
                return Err(e);
            }
        };
        if !bytes.is_empty() {
            self.decoder.push(&bytes);
        }

        let mut handled = 0;
        loop {
            match self.decoder.decode() {
                Ok(Some(frame)) => {
                    if self.dispatch(frame) {
                        handled += 1;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.stats.dropped_frames += 1;
                    debug!(address = self.address(), "dropping frame: {}", e);
                }
            }
        }
        Ok(handled)
    }

    /// Route one frame; the address is re-read for every frame
    fn dispatch(&mut self, frame: Frame) -> bool {
        if frame.address() == BROADCAST_ADDRESS {
            self.stats.broadcast_frames += 1;
            debug!(len = frame.payload().len(), "broadcast received");
            self.handler
                .handle_broadcast(&mut self.context, frame.payload());
            return true;
        }

        if frame.address() != self.context.address() {
            self.stats.ignored_frames += 1;
            return false;
        }

        self.stats.unicast_frames += 1;
        debug!(
            address = frame.address(),
            len = frame.payload().len(),
            "request received"
        );
        if let Some(reply) = self.handler.handle_unicast(&mut self.context, frame.payload()) {
            self.reply(&reply);
        }
        true
    }

    fn reply(&mut self, payload: &[u8]) {
        let bytes = match encode(MASTER_ADDRESS, payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(address = self.address(), "dropping reply: {}", e);
                return;
            }
        };

        let written = self
            .transport
            .set_direction(Direction::Transmit)
            .and_then(|_| self.transport.write(&bytes));
        // Always hand the line back, even after a failed write
        let released = self.transport.set_direction(Direction::Receive);
        match written.and(released) {
            Ok(()) => self.stats.replies += 1,
            Err(e) => {
                self.stats.failed_replies += 1;
                warn!(address = self.address(), "reply not sent: {}", e);
            }
        }
    }
}
