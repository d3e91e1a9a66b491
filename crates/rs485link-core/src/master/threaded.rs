//! Threaded master facade
//!
//! A dedicated worker thread owns the [`Master`] and its transport. Callers
//! on any thread hand requests to it through a FIFO queue and block (or
//! `.await`) on a per-request completion channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{Master, MasterStats, Request, Response};
use crate::protocol::{ErrorKind, ProtocolError, Transport};

/// Extra time a caller waits beyond the request's own worst case
const COMPLETION_SLACK: Duration = Duration::from_millis(500);

/// How long the idle worker waits on the queue before re-checking for shutdown
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Progress reports sent to a blocking caller
#[derive(Debug)]
enum JobEvent {
    Started,
    Finished(Response),
}

/// How the worker reports back to the caller
enum Completion {
    Blocking(Sender<JobEvent>),
    Async(tokio::sync::oneshot::Sender<Response>),
}

impl Completion {
    /// Tell a blocking caller its request left the queue
    ///
    /// Returns false if the caller is gone.
    fn started(&self) -> bool {
        match self {
            Completion::Blocking(tx) => tx.send(JobEvent::Started).is_ok(),
            Completion::Async(tx) => !tx.is_closed(),
        }
    }

    fn finish(self, response: Response) {
        // The caller may have given up waiting
        match self {
            Completion::Blocking(tx) => {
                let _ = tx.send(JobEvent::Finished(response));
            }
            Completion::Async(tx) => {
                let _ = tx.send(response);
            }
        }
    }
}

struct Job {
    request: Request,
    completion: Completion,
}

/// State shared between the facade and its worker
struct Shared {
    shutdown: AtomicBool,
    stats: Mutex<MasterStats>,
}

/// Runs a [`Master`] on a background thread behind a blocking API
pub struct ThreadedMaster<T: Transport + 'static> {
    /// Engine waiting to be started (or returned by a stopped worker)
    idle: Mutex<Option<Master<T>>>,
    queue: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<Master<T>>>>,
    shared: Arc<Shared>,
    /// Line-ready time per attempt, added to the caller's wait bound
    line_ready: Duration,
}

impl<T: Transport + 'static> ThreadedMaster<T> {
    /// Wrap a master; call [`start`](Self::start) before submitting
    pub fn new(master: Master<T>) -> Self {
        let line_ready = master.config().line_ready();
        let shared = Shared {
            shutdown: AtomicBool::new(false),
            stats: Mutex::new(master.stats()),
        };
        Self {
            idle: Mutex::new(Some(master)),
            queue: Mutex::new(None),
            worker: Mutex::new(None),
            shared: Arc::new(shared),
            line_ready,
        }
    }

    /// Spawn the worker thread
    ///
    /// Does nothing if the worker is already running.
    pub fn start(&self) -> Result<(), ProtocolError> {
        let mut worker = self.worker.lock().map_err(|_| ProtocolError::Cancelled)?;
        if worker.is_some() {
            return Ok(()); // Already running
        }

        let master = self
            .idle
            .lock()
            .map_err(|_| ProtocolError::Cancelled)?
            .take()
            .ok_or(ProtocolError::Cancelled)?;

        let (tx, rx) = mpsc::channel();
        self.shared.shutdown.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("rs485-master".into())
            .spawn(move || run_worker(master, rx, shared))?;

        *self.queue.lock().map_err(|_| ProtocolError::Cancelled)? = Some(tx);
        *worker = Some(handle);
        info!("master worker started");
        Ok(())
    }

    /// Stop the worker
    ///
    /// Queued requests complete with `Cancelled`. A request mid-attempt
    /// finishes that attempt but is not retried. Blocks until the worker
    /// has exited. Calling `stop` again is harmless.
    pub fn stop(&self) {
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return;
        };

        self.shared.shutdown.store(true, Ordering::SeqCst);
        // Dropping the sender disconnects the queue once it is drained
        if let Ok(mut queue) = self.queue.lock() {
            queue.take();
        }

        match handle.join() {
            Ok(master) => {
                if let Ok(mut idle) = self.idle.lock() {
                    *idle = Some(master);
                }
                info!("master worker stopped");
            }
            Err(_) => warn!("master worker panicked"),
        }
    }

    /// True while the worker thread is running
    pub fn is_running(&self) -> bool {
        self.worker.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    /// Snapshot of the engine counters
    pub fn stats(&self) -> MasterStats {
        self.shared
            .stats
            .lock()
            .map(|s| *s)
            .unwrap_or_default()
    }

    /// Submit a request and block until it completes
    ///
    /// Returns a `Cancelled` response if the facade is not running or is
    /// stopped while the request waits.
    pub fn submit(&self, request: Request) -> Response {
        let bound = request
            .policy
            .worst_case()
            .saturating_add(self.line_ready.saturating_mul(request.policy.max_attempts()))
            .saturating_add(COMPLETION_SLACK);
        let (tx, rx) = mpsc::channel();
        if !self.enqueue(Job {
            request,
            completion: Completion::Blocking(tx),
        }) {
            return Response::rejected(&ProtocolError::Cancelled);
        }

        // The wait bound starts once the worker picks the request up
        match rx.recv() {
            Ok(JobEvent::Started) => {}
            Ok(JobEvent::Finished(response)) => return response,
            Err(_) => return Response::rejected(&ProtocolError::Cancelled),
        }

        let started = Instant::now();
        match rx.recv_timeout(bound) {
            Ok(JobEvent::Finished(response)) => response,
            Ok(JobEvent::Started) => {
                warn!("unexpected second start event");
                Response::failed(ErrorKind::Cancelled, None, started.elapsed(), 0)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    bound_ms = bound.as_millis() as u64,
                    "no completion from master worker"
                );
                Response::failed(ErrorKind::Timeout, None, started.elapsed(), 0)
            }
            Err(RecvTimeoutError::Disconnected) => {
                Response::failed(ErrorKind::Cancelled, None, started.elapsed(), 0)
            }
        }
    }

    /// Submit a request from async code
    pub async fn submit_async(&self, request: Request) -> Response {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if !self.enqueue(Job {
            request,
            completion: Completion::Async(tx),
        }) {
            return Response::rejected(&ProtocolError::Cancelled);
        }
        rx.await
            .unwrap_or_else(|_| Response::rejected(&ProtocolError::Cancelled))
    }

    fn enqueue(&self, job: Job) -> bool {
        let Ok(queue) = self.queue.lock() else {
            return false;
        };
        match queue.as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => {
                debug!("master not running, rejecting request");
                false
            }
        }
    }
}

impl<T: Transport + 'static> Drop for ThreadedMaster<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<T: Transport>(
    mut master: Master<T>,
    rx: Receiver<Job>,
    shared: Arc<Shared>,
) -> Master<T> {
    loop {
        let job = match rx.recv_timeout(IDLE_WAIT) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => {
                if shared.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if shared.shutdown.load(Ordering::SeqCst) {
            job.completion
                .finish(Response::rejected(&ProtocolError::Cancelled));
            continue;
        }

        if !job.completion.started() {
            debug!(address = job.request.address, "caller gone, skipping request");
            continue;
        }

        let response = execute(&mut master, job.request, &shared.shutdown);
        if let Ok(mut stats) = shared.stats.lock() {
            *stats = master.stats();
        }
        job.completion.finish(response);
    }

    // Anything still queued after the sender went away
    for job in rx.try_iter() {
        job.completion
            .finish(Response::rejected(&ProtocolError::Cancelled));
    }
    debug!("master worker exiting");
    master
}

fn execute<T: Transport>(
    master: &mut Master<T>,
    request: Request,
    shutdown: &AtomicBool,
) -> Response {
    if let Err(e) = master.begin(request) {
        return Response::rejected(&e);
    }
    loop {
        if shutdown.load(Ordering::SeqCst) {
            master.cancel();
        }
        if let Some(response) = master.poll() {
            return response;
        }
    }
}
