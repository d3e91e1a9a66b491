//! Application handlers for the slave engine

use crate::protocol::{is_valid_slave_address, ProtocolError};

/// What a handler can see and change about the slave serving it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveContext {
    address: u8,
}

impl SlaveContext {
    /// Create a context for a slave listening on `address`
    pub fn new(address: u8) -> Result<Self, ProtocolError> {
        if !is_valid_slave_address(address) {
            return Err(ProtocolError::InvalidAddress(address));
        }
        Ok(Self { address })
    }

    /// Address the slave currently listens on
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Move the slave to a new address; takes effect for the next frame
    pub fn set_address(&mut self, address: u8) -> Result<(), ProtocolError> {
        if !is_valid_slave_address(address) {
            return Err(ProtocolError::InvalidAddress(address));
        }
        self.address = address;
        Ok(())
    }
}

/// Application logic run by a slave for each frame it accepts
pub trait Handler {
    /// Handle a frame addressed to this slave; `Some` is sent back to the master
    fn handle_unicast(&mut self, ctx: &mut SlaveContext, payload: &[u8]) -> Option<Vec<u8>>;

    /// Handle a broadcast frame; broadcasts are never answered
    fn handle_broadcast(&mut self, ctx: &mut SlaveContext, payload: &[u8]) {
        let _ = (ctx, payload);
    }
}

impl<F> Handler for F
where
    F: FnMut(&mut SlaveContext, &[u8]) -> Option<Vec<u8>>,
{
    fn handle_unicast(&mut self, ctx: &mut SlaveContext, payload: &[u8]) -> Option<Vec<u8>> {
        self(ctx, payload)
    }
}

/// Replies with the request payload unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn handle_unicast(&mut self, _ctx: &mut SlaveContext, payload: &[u8]) -> Option<Vec<u8>> {
        Some(payload.to_vec())
    }
}

/// Answers `ping` with `pong` and ignores everything else
#[derive(Debug, Clone, Copy, Default)]
pub struct PingPongHandler;

impl PingPongHandler {
    /// Request payload
    pub const PING: &'static [u8] = b"ping";
    /// Reply payload
    pub const PONG: &'static [u8] = b"pong";
}

impl Handler for PingPongHandler {
    fn handle_unicast(&mut self, _ctx: &mut SlaveContext, payload: &[u8]) -> Option<Vec<u8>> {
        (payload == Self::PING).then(|| Self::PONG.to_vec())
    }
}
