//! Master engine
//!
//! The master owns the bus: it sends one request at a time and waits for the
//! addressed slave to answer. Each exchange walks through
//! `Idle -> Sending -> AwaitingReply -> {Success | Retry | Failed}`, with
//! `Retry -> Sending` until the request's retries are spent.
//!
//! [`Master::begin`] and [`Master::poll`] expose the machine step by step so
//! a worker thread can interleave it with other work (see
//! [`ThreadedMaster`]); [`Master::send_request`] drives it to completion.

pub mod request;
pub mod threaded;

pub use request::{MasterStats, Request, Response, RetryPolicy};
pub use threaded::ThreadedMaster;

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::MasterConfig;
use crate::protocol::{
    deadline_after, encode, is_unicast_address, is_valid_slave_address, Direction, ErrorKind,
    FrameDecoder, ProtocolError, Transport, BROADCAST_ADDRESS, MASTER_ADDRESS,
};

/// Where the master is in the current exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    /// No request has been started
    Idle,
    /// Waiting for the line to settle before transmitting
    Sending,
    /// Request transmitted, waiting for the reply
    AwaitingReply,
    /// Last exchange completed with a matching reply
    Success,
    /// Last attempt failed, deciding whether to try again
    Retry,
    /// Last exchange failed for good
    Failed,
}

impl MasterState {
    /// True while an exchange is in progress
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            MasterState::Sending | MasterState::AwaitingReply | MasterState::Retry
        )
    }
}

/// Bookkeeping for the request in flight
#[derive(Debug)]
struct Exchange {
    request: Request,
    /// Encoded frame, reused for every attempt
    frame: Vec<u8>,
    /// Time of the first transmission
    started: Option<Instant>,
    attempts: u32,
    deadline: Option<Instant>,
    last_failure: Option<ErrorKind>,
    cancelled: bool,
}

impl Exchange {
    fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }
}

/// Request/reply engine for the bus master
pub struct Master<T: Transport> {
    transport: T,
    decoder: FrameDecoder,
    config: MasterConfig,
    state: MasterState,
    exchange: Option<Exchange>,
    stats: MasterStats,
}

impl<T: Transport> Master<T> {
    /// Create a master with default settings
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, MasterConfig::default())
    }

    /// Create a master with custom settings
    pub fn with_config(transport: T, config: MasterConfig) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::new(),
            config,
            state: MasterState::Idle,
            exchange: None,
            stats: MasterStats::default(),
        }
    }

    /// Replace the frame decoder (e.g. to change the packet timeout)
    pub fn with_decoder(mut self, decoder: FrameDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Build a request to `address` using this master's default policy
    pub fn request(&self, address: u8, payload: impl Into<Vec<u8>>) -> Request {
        Request::new(address, payload).with_policy(self.config.policy())
    }

    /// Current state
    pub fn state(&self) -> MasterState {
        self.state
    }

    /// Engine settings
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> MasterStats {
        self.stats
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the underlying transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the master and return its transport
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Send a request and block until it succeeds, fails or runs out of retries
    pub fn send_request(&mut self, request: Request) -> Response {
        if let Err(e) = self.begin(request) {
            return Response::rejected(&e);
        }
        loop {
            if let Some(response) = self.poll() {
                return response;
            }
        }
    }

    /// Start an exchange
    ///
    /// Fails with [`ProtocolError::Busy`] while another exchange is in
    /// progress. Requests with an oversized payload or an unusable address
    /// are rejected here, before anything is transmitted.
    pub fn begin(&mut self, request: Request) -> Result<(), ProtocolError> {
        if self.state.is_busy() {
            return Err(ProtocolError::Busy);
        }

        let frame = match Self::prepare(&request) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(address = request.address, "rejecting request: {}", e);
                self.stats.requests += 1;
                self.stats.failures += 1;
                return Err(e);
            }
        };

        debug!(
            address = request.address,
            len = request.payload.len(),
            max_retries = request.policy.max_retries,
            "starting request"
        );
        self.stats.requests += 1;
        self.exchange = Some(Exchange {
            request,
            frame,
            started: None,
            attempts: 0,
            deadline: None,
            last_failure: None,
            cancelled: false,
        });
        self.state = MasterState::Sending;
        Ok(())
    }

    /// Forbid further retries of the exchange in flight
    ///
    /// An attempt already on the wire still runs until its reply or its
    /// deadline; if it fails the exchange ends with `Cancelled`.
    pub fn cancel(&mut self) {
        if let Some(exchange) = self.exchange.as_mut() {
            if !exchange.cancelled {
                debug!(address = exchange.request.address, "cancelling request");
                exchange.cancelled = true;
            }
        }
    }

    /// Advance the exchange by one bounded step
    ///
    /// Blocks for at most the line-ready interval or one poll interval.
    /// Returns the [`Response`] once the exchange reaches a terminal state.
    pub fn poll(&mut self) -> Option<Response> {
        loop {
            match self.state {
                MasterState::Idle | MasterState::Success | MasterState::Failed => return None,
                MasterState::Sending => return self.transmit(),
                MasterState::AwaitingReply => return self.await_reply(),
                MasterState::Retry => {
                    if let Some(response) = self.retry_or_fail() {
                        return Some(response);
                    }
                }
            }
        }
    }

    fn prepare(request: &Request) -> Result<Vec<u8>, ProtocolError> {
        let address_ok = if request.expects_reply {
            is_unicast_address(request.address)
        } else {
            request.address == BROADCAST_ADDRESS || is_valid_slave_address(request.address)
        };
        if !address_ok {
            return Err(ProtocolError::InvalidAddress(request.address));
        }
        encode(request.address, &request.payload)
    }

    /// Wait out the line-ready interval, discarding late traffic
    fn drain_line(&mut self) {
        let until = deadline_after(self.config.line_ready());
        loop {
            match self.transport.read_available(until) {
                Ok(bytes) if !bytes.is_empty() => {
                    self.stats.rx_bytes += bytes.len() as u64;
                    debug!(len = bytes.len(), "discarding stale bytes before transmit");
                }
                Ok(_) => {}
                Err(e) => debug!("read error while draining line: {}", e),
            }
            if Instant::now() >= until {
                break;
            }
        }
        self.decoder.reset();
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        self.transport.set_direction(Direction::Transmit)?;
        let written = self.transport.write(frame);
        // Always hand the line back, even if the write failed
        let released = self.transport.set_direction(Direction::Receive);
        written.and(released)
    }

    fn transmit(&mut self) -> Option<Response> {
        let cancelled = self.exchange.as_ref().map(|e| e.cancelled).unwrap_or(true);
        if cancelled {
            return Some(self.finish_failed(ErrorKind::Cancelled));
        }

        self.drain_line();

        let mut exchange = self.exchange.take()?;
        exchange.started.get_or_insert_with(Instant::now);
        exchange.attempts += 1;
        self.stats.attempts += 1;

        debug!(
            address = exchange.request.address,
            attempt = exchange.attempts,
            len = exchange.frame.len(),
            "transmitting"
        );
        let result = self.write_frame(&exchange.frame);
        let expects_reply = exchange.request.expects_reply;
        let timeout = exchange.request.policy.timeout;

        match result {
            Ok(()) => {
                self.stats.tx_bytes += exchange.frame.len() as u64;
                self.stats.tx_frames += 1;
                exchange.deadline = Some(deadline_after(timeout));
                self.exchange = Some(exchange);
                if expects_reply {
                    self.state = MasterState::AwaitingReply;
                    None
                } else {
                    Some(self.finish_success(Vec::new()))
                }
            }
            Err(e) => {
                warn!(
                    address = exchange.request.address,
                    attempt = exchange.attempts,
                    "message not sent: {}",
                    e
                );
                exchange.last_failure = Some(ErrorKind::Io);
                self.exchange = Some(exchange);
                if expects_reply {
                    self.state = MasterState::Retry;
                    None
                } else {
                    Some(self.finish_failed(ErrorKind::Io))
                }
            }
        }
    }

    fn await_reply(&mut self) -> Option<Response> {
        let deadline = self.exchange.as_ref().and_then(|e| e.deadline)?;
        let now = Instant::now();
        if now >= deadline {
            return self.fail_attempt(ErrorKind::Timeout);
        }

        let slice_end = deadline_after(self.config.poll_interval()).min(deadline);
        match self.transport.read_available(slice_end) {
            Ok(bytes) => {
                if !bytes.is_empty() {
                    self.stats.rx_bytes += bytes.len() as u64;
                    self.decoder.push(&bytes);
                }
            }
            Err(e) => {
                warn!("read error while awaiting reply: {}", e);
                return self.fail_attempt(ErrorKind::Io);
            }
        }

        loop {
            match self.decoder.decode() {
                Ok(None) => return None,
                Ok(Some(frame)) => {
                    self.stats.rx_frames += 1;
                    if Instant::now() > deadline {
                        self.stats.discarded_frames += 1;
                        debug!(address = frame.address(), "discarding reply after deadline");
                        continue;
                    }
                    if frame.address() != MASTER_ADDRESS {
                        self.stats.discarded_frames += 1;
                        debug!(address = frame.address(), "reply addressed elsewhere");
                        return self.fail_attempt(ErrorKind::InvalidAddress);
                    }
                    return Some(self.finish_success(frame.into_payload()));
                }
                Err(ProtocolError::ChecksumMismatch { expected, actual }) => {
                    self.stats.checksum_errors += 1;
                    debug!(expected, actual, "reply failed checksum");
                    return self.fail_attempt(ErrorKind::Checksum);
                }
                Err(e) => {
                    self.stats.framing_errors += 1;
                    debug!("dropping malformed frame: {}", e);
                }
            }
        }
    }

    fn fail_attempt(&mut self, kind: ErrorKind) -> Option<Response> {
        if kind == ErrorKind::Timeout {
            self.stats.timeouts += 1;
        }
        if let Some(exchange) = self.exchange.as_mut() {
            debug!(
                address = exchange.request.address,
                attempt = exchange.attempts,
                "attempt failed: {}",
                kind
            );
            exchange.last_failure = Some(kind);
            exchange.deadline = None;
        }
        self.state = MasterState::Retry;
        None
    }

    fn retry_or_fail(&mut self) -> Option<Response> {
        let (cancelled, attempts, max_attempts) = match self.exchange.as_ref() {
            Some(e) => (e.cancelled, e.attempts, e.request.policy.max_attempts()),
            None => {
                self.state = MasterState::Idle;
                return None;
            }
        };

        if cancelled {
            return Some(self.finish_failed(ErrorKind::Cancelled));
        }
        if attempts >= max_attempts {
            return Some(self.finish_failed(ErrorKind::RetriesExhausted));
        }
        self.state = MasterState::Sending;
        None
    }

    fn finish_success(&mut self, payload: Vec<u8>) -> Response {
        self.state = MasterState::Success;
        self.stats.successes += 1;
        let (elapsed, attempts) = self
            .exchange
            .take()
            .map(|e| (e.elapsed(), e.attempts))
            .unwrap_or_default();
        debug!(attempts, elapsed_ms = elapsed.as_millis() as u64, "request succeeded");
        Response::succeeded(payload, elapsed, attempts)
    }

    fn finish_failed(&mut self, error: ErrorKind) -> Response {
        self.state = MasterState::Failed;
        self.stats.failures += 1;
        let Some(exchange) = self.exchange.take() else {
            return Response::failed(error, None, Duration::ZERO, 0);
        };
        info!(
            address = exchange.request.address,
            attempts = exchange.attempts,
            "request failed: {}",
            error
        );
        Response::failed(
            error,
            exchange.last_failure,
            exchange.elapsed(),
            exchange.attempts,
        )
    }
}
