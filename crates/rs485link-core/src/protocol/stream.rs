//! Transport abstraction
//!
//! The engines only need three operations from the bus: write bytes, switch
//! the transceiver direction, and collect whatever arrived before a
//! deadline. [`SerialTransport`](super::SerialTransport) provides them over
//! a real port; [`MemoryBus`] simulates a multi-drop half-duplex bus in
//! memory.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// Transceiver direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Driver enabled, receiver disabled
    Transmit,
    /// Driver disabled, receiver enabled
    Receive,
}

/// Abstraction for the byte stream underneath the engines
pub trait Transport: Send {
    /// Write all bytes to the bus
    fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError>;

    /// Switch the transceiver direction
    fn set_direction(&mut self, direction: Direction) -> Result<(), ProtocolError>;

    /// Return every byte that arrives before `deadline`
    ///
    /// Returns as soon as some bytes are available. May return an empty
    /// vector. Never blocks past `deadline`; a deadline in the past returns
    /// what is already buffered.
    fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>, ProtocolError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        (**self).write(bytes)
    }

    fn set_direction(&mut self, direction: Direction) -> Result<(), ProtocolError> {
        (**self).set_direction(direction)
    }

    fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>, ProtocolError> {
        (**self).read_available(deadline)
    }
}

/// Pending corruption applied to the next write on the bus
#[derive(Debug, Clone, Copy)]
struct Corruption {
    offset: usize,
    mask: u8,
}

#[derive(Debug)]
struct Node {
    direction: Direction,
    inbox: VecDeque<u8>,
    detached: bool,
}

#[derive(Debug, Default)]
struct BusState {
    nodes: Vec<Node>,
    corrupt_next: Option<Corruption>,
    drop_next: usize,
    /// Total bytes written by all nodes
    bytes_written: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BusState>,
    arrived: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        // A panicking test thread must not take the whole bus down with it
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-memory multi-drop bus
///
/// Every [`BusPort`] attached to the bus sees the bytes written by every
/// other port, as long as it is in [`Direction::Receive`] when they are
/// written. A port never hears its own transmission.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    shared: Arc<Shared>,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node, initially in receive mode
    pub fn attach(&self) -> BusPort {
        let mut state = self.shared.lock();
        state.nodes.push(Node {
            direction: Direction::Receive,
            inbox: VecDeque::new(),
            detached: false,
        });
        BusPort {
            id: state.nodes.len() - 1,
            shared: self.shared.clone(),
        }
    }

    /// Deliver raw bytes to every receiving node, as line noise would
    pub fn inject(&self, bytes: &[u8]) {
        let mut state = self.shared.lock();
        for node in state.nodes.iter_mut().filter(|n| n.receiving()) {
            node.inbox.extend(bytes);
        }
        self.shared.arrived.notify_all();
    }

    /// XOR `mask` into byte `offset` of the next write by any node
    pub fn corrupt_next_write(&self, offset: usize, mask: u8) {
        self.shared.lock().corrupt_next = Some(Corruption { offset, mask });
    }

    /// Silently lose the next `count` writes
    pub fn drop_next_writes(&self, count: usize) {
        self.shared.lock().drop_next = count;
    }

    /// Total bytes written onto the bus so far
    pub fn bytes_written(&self) -> u64 {
        self.shared.lock().bytes_written
    }
}

/// One node's connection to a [`MemoryBus`]
#[derive(Debug)]
pub struct BusPort {
    id: usize,
    shared: Arc<Shared>,
}

impl Node {
    fn receiving(&self) -> bool {
        !self.detached && self.direction == Direction::Receive
    }
}

impl Transport for BusPort {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let mut state = self.shared.lock();
        state.bytes_written += bytes.len() as u64;

        if state.drop_next > 0 {
            state.drop_next -= 1;
            return Ok(());
        }

        let mut data = bytes.to_vec();
        if let Some(c) = state.corrupt_next.take() {
            if let Some(b) = data.get_mut(c.offset) {
                *b ^= c.mask;
            }
        }

        let me = self.id;
        for (id, node) in state.nodes.iter_mut().enumerate() {
            if id != me && node.receiving() {
                node.inbox.extend(&data);
            }
        }
        self.shared.arrived.notify_all();
        Ok(())
    }

    fn set_direction(&mut self, direction: Direction) -> Result<(), ProtocolError> {
        let mut state = self.shared.lock();
        if let Some(node) = state.nodes.get_mut(self.id) {
            node.direction = direction;
        }
        Ok(())
    }

    fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>, ProtocolError> {
        let mut state = self.shared.lock();
        loop {
            if let Some(node) = state.nodes.get_mut(self.id) {
                if !node.inbox.is_empty() {
                    return Ok(node.inbox.drain(..).collect());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let (guard, _) = self
                .shared
                .arrived
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }
}

impl Drop for BusPort {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let Some(node) = state.nodes.get_mut(self.id) {
            node.detached = true;
            node.inbox.clear();
        }
    }
}
