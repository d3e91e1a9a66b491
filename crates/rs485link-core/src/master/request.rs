//! Requests, responses and retry policy

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::{
    ErrorKind, ProtocolError, BROADCAST_ADDRESS, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS,
};

/// How long to wait per attempt and how often to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u8,
    /// Time to wait for a reply, per attempt
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(max_retries: u8, timeout: Duration) -> Self {
        Self {
            max_retries,
            timeout,
        }
    }

    /// Total attempts allowed, first one included
    pub fn max_attempts(&self) -> u32 {
        self.max_retries as u32 + 1
    }

    /// Longest time a request can take: `(max_retries + 1) * timeout`
    ///
    /// Saturates at [`Duration::MAX`].
    pub fn worst_case(&self) -> Duration {
        self.timeout
            .checked_mul(self.max_attempts())
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// An outgoing request from the master
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Destination slave address
    pub address: u8,
    /// Request payload
    pub payload: Vec<u8>,
    /// Retry and timeout settings for this request
    pub policy: RetryPolicy,
    /// Whether the master waits for a reply
    pub expects_reply: bool,
}

impl Request {
    /// Request to `address` expecting a reply, with the default policy
    pub fn new(address: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            payload: payload.into(),
            policy: RetryPolicy::default(),
            expects_reply: true,
        }
    }

    /// Message to every slave; sent once, never answered
    pub fn broadcast(payload: impl Into<Vec<u8>>) -> Self {
        Self::fire_and_forget(BROADCAST_ADDRESS, payload)
    }

    /// Message to `address` that is sent once without waiting for a reply
    pub fn fire_and_forget(address: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            payload: payload.into(),
            policy: RetryPolicy::new(0, Duration::ZERO),
            expects_reply: false,
        }
    }

    /// Override the number of retries
    pub fn with_retries(mut self, max_retries: u8) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Override the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = timeout;
        self
    }

    /// Replace the whole policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Outcome of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    success: bool,
    payload: Vec<u8>,
    elapsed: Duration,
    attempts: u32,
    error: Option<ErrorKind>,
    last_failure: Option<ErrorKind>,
}

impl Response {
    pub(crate) fn succeeded(payload: Vec<u8>, elapsed: Duration, attempts: u32) -> Self {
        Self {
            success: true,
            payload,
            elapsed,
            attempts,
            error: None,
            last_failure: None,
        }
    }

    pub(crate) fn failed(
        error: ErrorKind,
        last_failure: Option<ErrorKind>,
        elapsed: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            success: false,
            payload: Vec::new(),
            elapsed,
            attempts,
            error: Some(error),
            last_failure,
        }
    }

    /// A failure that happened before any attempt was made
    pub(crate) fn rejected(error: &ProtocolError) -> Self {
        Self::failed(error.kind(), None, Duration::ZERO, 0)
    }

    /// Whether a matching reply was received (or the message was sent, for
    /// requests that expect no reply)
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Reply payload; empty on failure
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Time from the first transmission to the terminal state
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Attempts consumed, including the successful one
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Terminal error kind, if the request failed
    pub fn error(&self) -> Option<ErrorKind> {
        self.error
    }

    /// Cause of the last failed attempt (timeout, checksum, ...)
    pub fn last_failure(&self) -> Option<ErrorKind> {
        self.last_failure
    }

    /// Take the reply payload, or convert the failure into an error
    pub fn into_result(self) -> Result<Vec<u8>, ProtocolError> {
        match self.error {
            None => Ok(self.payload),
            Some(ErrorKind::RetriesExhausted) => Err(ProtocolError::RetriesExhausted {
                attempts: self.attempts,
                last: self.last_failure.unwrap_or(ErrorKind::Timeout),
            }),
            Some(ErrorKind::Cancelled) => Err(ProtocolError::Cancelled),
            Some(ErrorKind::Timeout) => Err(ProtocolError::Timeout),
            Some(kind) => Err(ProtocolError::RequestFailed(kind)),
        }
    }
}

/// Counters kept by the master engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterStats {
    /// Requests started
    pub requests: u64,
    /// Requests that completed successfully
    pub successes: u64,
    /// Requests that failed
    pub failures: u64,
    /// Transmission attempts
    pub attempts: u64,
    /// Attempts that ran out of time
    pub timeouts: u64,
    /// Replies rejected for a bad checksum
    pub checksum_errors: u64,
    /// Frames rejected by the decoder for framing faults
    pub framing_errors: u64,
    /// Frames discarded as late or addressed elsewhere
    pub discarded_frames: u64,
    /// Bytes written to the bus
    pub tx_bytes: u64,
    /// Bytes read from the bus
    pub rx_bytes: u64,
    /// Frames written to the bus
    pub tx_frames: u64,
    /// Frames decoded from the bus, whether accepted or not
    pub rx_frames: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_case_bound() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.worst_case(), Duration::from_millis(400));
    }

    #[test]
    fn test_worst_case_saturates() {
        let policy = RetryPolicy::new(3, Duration::from_secs(u64::MAX / 2));
        assert_eq!(policy.worst_case(), Duration::MAX);
    }

    #[test]
    fn test_request_builders() {
        let req = Request::new(5, "AB3x9")
            .with_retries(1)
            .with_timeout(Duration::from_millis(50));
        assert_eq!(req.address, 5);
        assert_eq!(req.payload, b"AB3x9");
        assert_eq!(req.policy.max_retries, 1);
        assert!(req.expects_reply);

        let bc = Request::broadcast(vec![1, 2]);
        assert_eq!(bc.address, BROADCAST_ADDRESS);
        assert!(!bc.expects_reply);
    }

    #[test]
    fn test_failed_response_into_result() {
        let resp = Response::failed(
            ErrorKind::RetriesExhausted,
            Some(ErrorKind::Checksum),
            Duration::from_millis(30),
            3,
        );
        assert!(!resp.is_success());
        assert!(resp.payload().is_empty());
        match resp.into_result() {
            Err(ProtocolError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, ErrorKind::Checksum);
            }
            other => panic!("Expected RetriesExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_success_into_result() {
        let resp = Response::succeeded(b"pong".to_vec(), Duration::from_millis(3), 1);
        assert_eq!(resp.error(), None);
        assert_eq!(resp.into_result().unwrap(), b"pong");
    }
}
