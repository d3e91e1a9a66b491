use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rs485link_core::config::{BusConfig, MasterConfig};
use rs485link_core::master::{Master, Request};
use rs485link_core::protocol::{
    encode, BusPort, Direction, ErrorKind, FrameDecoder, MemoryBus, ProtocolError, Transport,
    BROADCAST_ADDRESS, MASTER_ADDRESS,
};
use rs485link_core::slave::{EchoHandler, Handler, PingPongHandler, Slave, SlaveContext};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> MasterConfig {
    MasterConfig {
        timeout_ms: 200,
        max_retries: 3,
        line_ready_ms: 2,
        poll_interval_ms: 2,
    }
}

/// A slave serving on its own thread until dropped
struct SlaveThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SlaveThread {
    fn spawn<H: Handler + Send + 'static>(bus: &MemoryBus, address: u8, handler: H) -> Self {
        Self::spawn_on(bus.attach(), address, handler)
    }

    fn spawn_on<T, H>(transport: T, address: u8, handler: H) -> Self
    where
        T: Transport + 'static,
        H: Handler + Send + 'static,
    {
        let mut slave = Slave::new(transport, address, handler)
            .unwrap()
            .with_poll_interval(Duration::from_millis(2));
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::spawn(move || {
            slave.run(&flag).unwrap();
        });
        Self {
            running,
            handle: Some(handle),
        }
    }
}

impl Drop for SlaveThread {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn test_echo_end_to_end() {
    init_tracing();
    let bus = MemoryBus::new();
    let _slave = SlaveThread::spawn(&bus, 5, EchoHandler);
    let bus_config = BusConfig {
        master: test_config(),
        ..BusConfig::default()
    };
    let mut master =
        Master::with_config(bus.attach(), bus_config.master).with_decoder(bus_config.decoder());

    let request = master.request(5, "AB3x9");
    let response = master.send_request(request);

    assert!(response.is_success(), "{:?}", response);
    assert_eq!(response.payload(), b"AB3x9");
    assert_eq!(response.attempts(), 1);
    assert!(response.elapsed() < Duration::from_millis(200));
}

#[test]
fn test_address_mismatch_exhausts_retries() {
    init_tracing();
    let bus = MemoryBus::new();
    let _slave = SlaveThread::spawn(&bus, 5, EchoHandler);
    let mut master = Master::with_config(bus.attach(), test_config());

    let request = Request::new(7, "AB3x9")
        .with_retries(2)
        .with_timeout(Duration::from_millis(50));
    let response = master.send_request(request);

    assert!(!response.is_success());
    assert_eq!(response.error(), Some(ErrorKind::RetriesExhausted));
    assert_eq!(response.last_failure(), Some(ErrorKind::Timeout));
    assert_eq!(response.attempts(), 3);
    match response.into_result() {
        Err(ProtocolError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("Expected RetriesExhausted, got {:?}", other),
    }
}

#[test]
fn test_retry_bound() {
    init_tracing();
    let bus = MemoryBus::new();
    let mut master = Master::with_config(bus.attach(), test_config());

    let retries = 4u8;
    let timeout = Duration::from_millis(40);
    let request = Request::new(9, "anyone?")
        .with_retries(retries)
        .with_timeout(timeout);
    let frame_len = encode(9, b"anyone?").unwrap().len() as u64;
    let worst_case = request.policy.worst_case();

    let started = Instant::now();
    let response = master.send_request(request);
    let took = started.elapsed();

    assert_eq!(response.error(), Some(ErrorKind::RetriesExhausted));
    assert_eq!(response.attempts(), retries as u32 + 1);
    // Exactly N + 1 transmissions
    assert_eq!(bus.bytes_written(), frame_len * (retries as u64 + 1));
    assert_eq!(master.stats().attempts, retries as u64 + 1);
    assert!(took >= worst_case);
    // Line-ready waits plus scheduling overhead
    assert!(took < worst_case + Duration::from_millis(300), "took {:?}", took);
}

/// Transport whose replies become readable at scripted times after each write
struct DelayedReplies {
    script: VecDeque<(Duration, Vec<u8>)>,
    pending: Vec<(Instant, Vec<u8>)>,
    writes: usize,
}

impl Transport for DelayedReplies {
    fn write(&mut self, _bytes: &[u8]) -> Result<(), ProtocolError> {
        self.writes += 1;
        if let Some((delay, reply)) = self.script.pop_front() {
            self.pending.push((Instant::now() + delay, reply));
        }
        Ok(())
    }

    fn set_direction(&mut self, _direction: Direction) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>, ProtocolError> {
        loop {
            let now = Instant::now();
            let mut ready = Vec::new();
            self.pending.retain(|(at, bytes)| {
                if *at <= now {
                    ready.extend_from_slice(bytes);
                    false
                } else {
                    true
                }
            });
            if !ready.is_empty() || now >= deadline {
                return Ok(ready);
            }
            let next = self
                .pending
                .iter()
                .map(|(at, _)| *at)
                .min()
                .unwrap_or(deadline)
                .min(deadline);
            thread::sleep(next.saturating_duration_since(now));
        }
    }
}

#[test]
fn test_stale_reply_rejected() {
    init_tracing();
    let timeout = Duration::from_millis(40);
    let transport = DelayedReplies {
        script: VecDeque::from(vec![
            // Answer to the first attempt shows up just after its deadline
            (timeout + Duration::from_millis(2), encode(MASTER_ADDRESS, b"stale").unwrap()),
            (Duration::ZERO, encode(MASTER_ADDRESS, b"fresh").unwrap()),
        ]),
        pending: Vec::new(),
        writes: 0,
    };
    let config = MasterConfig {
        line_ready_ms: 30,
        ..test_config()
    };
    let mut master = Master::with_config(transport, config);

    let response = master.send_request(Request::new(5, "ping").with_timeout(timeout));

    assert!(response.is_success());
    assert_eq!(response.payload(), b"fresh");
    assert_eq!(response.attempts(), 2);
    assert_eq!(master.transport().writes, 2);
}

#[test]
fn test_address_sweep() {
    init_tracing();
    let bus = MemoryBus::new();
    // Answers each ping, then moves on to the next address
    let handler = |ctx: &mut SlaveContext, payload: &[u8]| {
        let reply = PingPongHandler.handle_unicast(ctx, payload);
        let next = ctx.address().wrapping_add(1);
        let _ = ctx.set_address(next);
        reply
    };
    let _slave = SlaveThread::spawn(&bus, 1, handler);
    let mut master = Master::with_config(bus.attach(), test_config());

    for address in 1..=30u8 {
        let request = master.request(address, PingPongHandler::PING);
        let response = master.send_request(request);
        assert!(response.is_success(), "address {}: {:?}", address, response);
        assert_eq!(response.payload(), PingPongHandler::PONG);
        assert_eq!(response.attempts(), 1);
    }
}

struct CountingHandler {
    broadcasts: Arc<AtomicUsize>,
}

impl Handler for CountingHandler {
    fn handle_unicast(&mut self, _ctx: &mut SlaveContext, payload: &[u8]) -> Option<Vec<u8>> {
        Some(payload.to_vec())
    }

    fn handle_broadcast(&mut self, _ctx: &mut SlaveContext, _payload: &[u8]) {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_broadcast_reaches_all_slaves_unanswered() {
    init_tracing();
    let bus = MemoryBus::new();
    let broadcasts = Arc::new(AtomicUsize::new(0));
    let _slaves: Vec<SlaveThread> = (1..=3)
        .map(|address| {
            let handler = CountingHandler {
                broadcasts: broadcasts.clone(),
            };
            SlaveThread::spawn(&bus, address, handler)
        })
        .collect();
    let mut listener: BusPort = bus.attach();
    let mut master = Master::with_config(bus.attach(), test_config());

    let response = master.send_request(Request::broadcast("sync"));
    assert!(response.is_success());
    assert_eq!(response.attempts(), 1);

    let deadline = Instant::now() + Duration::from_secs(1);
    while broadcasts.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(broadcasts.load(Ordering::SeqCst), 3);

    // Only the broadcast itself ever appears on the bus
    let mut decoder = FrameDecoder::new();
    let until = Instant::now() + Duration::from_millis(100);
    while Instant::now() < until {
        decoder.push(&listener.read_available(until).unwrap());
    }
    let addresses: Vec<u8> = decoder.decode_all().iter().map(|f| f.address()).collect();
    assert_eq!(addresses, vec![BROADCAST_ADDRESS]);
}

#[test]
fn test_recovers_from_corrupted_request() {
    init_tracing();
    let bus = MemoryBus::new();
    let _slave = SlaveThread::spawn(&bus, 5, EchoHandler);
    let config = MasterConfig {
        timeout_ms: 60,
        ..test_config()
    };
    let mut master = Master::with_config(bus.attach(), config);

    // Flip one payload bit of the first transmission
    bus.corrupt_next_write(3, 0x01);
    let request = master.request(5, "AB3x9");
    let response = master.send_request(request);

    assert!(response.is_success());
    assert_eq!(response.payload(), b"AB3x9");
    assert_eq!(response.attempts(), 2);
    assert_eq!(response.last_failure(), None);
    assert_eq!(master.stats().timeouts, 1);
}

#[test]
fn test_recovers_from_lost_request() {
    init_tracing();
    let bus = MemoryBus::new();
    let _slave = SlaveThread::spawn(&bus, 5, EchoHandler);
    let config = MasterConfig {
        timeout_ms: 60,
        ..test_config()
    };
    let mut master = Master::with_config(bus.attach(), config);

    bus.drop_next_writes(2);
    let request = master.request(5, "again");
    let response = master.send_request(request);

    assert!(response.is_success());
    assert_eq!(response.attempts(), 3);
}

/// Bus port whose first read and first write fail
struct FlakyPort {
    inner: BusPort,
    failing_writes: usize,
    failing_reads: usize,
}

impl Transport for FlakyPort {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(ProtocolError::SerialError("transient".into()));
        }
        self.inner.write(bytes)
    }

    fn set_direction(&mut self, direction: Direction) -> Result<(), ProtocolError> {
        self.inner.set_direction(direction)
    }

    fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>, ProtocolError> {
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(ProtocolError::SerialError("transient".into()));
        }
        self.inner.read_available(deadline)
    }
}

#[test]
fn test_slave_survives_transport_errors() {
    init_tracing();
    let bus = MemoryBus::new();
    let port = FlakyPort {
        inner: bus.attach(),
        failing_writes: 1,
        failing_reads: 1,
    };
    let slave = SlaveThread::spawn_on(port, 5, EchoHandler);
    let mut master = Master::with_config(bus.attach(), test_config());

    let request = master.request(5, "AB3x9");
    let response = master.send_request(request);

    // The first reply is lost, the retry is answered
    assert!(response.is_success(), "{:?}", response);
    assert_eq!(response.payload(), b"AB3x9");
    assert_eq!(response.attempts(), 2);
    assert!(!slave.handle.as_ref().unwrap().is_finished());
}
