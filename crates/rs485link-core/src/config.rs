//! Bus and master configuration
//!
//! Settings are stored as JSON. Every field has a default, so a file only
//! needs to name what differs from the protocol defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::master::RetryPolicy;
use crate::protocol::{
    DirectionControl, FrameDecoder, ProtocolError, SerialTransport, DEFAULT_BAUD_RATE,
    DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS, LINE_READY_TIME_MS, PACKET_TIMEOUT_MS,
    TRANSCEIVER_TOGGLE_TIME_US,
};

/// Default length of one bounded transport read
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

/// Serial bus settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Serial port name (e.g. "/dev/ttyUSB0")
    pub port_name: String,

    /// Baud rate
    pub baud_rate: u32,

    /// How the transceiver direction is switched
    pub direction_control: DirectionControl,

    /// Transceiver settling time after a direction change, in microseconds
    pub toggle_time_us: u64,

    /// Maximum gap between two bytes of one frame, in milliseconds
    pub packet_timeout_ms: u64,

    /// Master engine settings
    pub master: MasterConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            direction_control: DirectionControl::default(),
            toggle_time_us: TRANSCEIVER_TOGGLE_TIME_US,
            packet_timeout_ms: PACKET_TIMEOUT_MS,
            master: MasterConfig::default(),
        }
    }
}

impl BusConfig {
    /// Parse a configuration from JSON text
    pub fn from_json_str(json: &str) -> Result<Self, ProtocolError> {
        let config: BusConfig =
            serde_json::from_str(json).map_err(|e| ProtocolError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Save this configuration as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProtocolError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProtocolError::Config(e.to_string()))?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Reject settings the engines cannot work with
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.baud_rate == 0 {
            return Err(ProtocolError::Config("baud_rate must be non-zero".into()));
        }
        if self.packet_timeout_ms == 0 {
            return Err(ProtocolError::Config(
                "packet_timeout_ms must be non-zero".into(),
            ));
        }
        self.master.validate()
    }

    /// Transceiver settling time
    pub fn toggle_time(&self) -> Duration {
        Duration::from_micros(self.toggle_time_us)
    }

    /// Inter-byte packet timeout
    pub fn packet_timeout(&self) -> Duration {
        Duration::from_millis(self.packet_timeout_ms)
    }

    /// Frame decoder using the configured packet timeout
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::with_packet_timeout(Some(self.packet_timeout()))
    }

    /// Open the configured serial port
    pub fn open_transport(&self) -> Result<SerialTransport, ProtocolError> {
        self.validate()?;
        if self.port_name.is_empty() {
            return Err(ProtocolError::Config("port_name is not set".into()));
        }
        let transport =
            SerialTransport::open(&self.port_name, self.baud_rate, self.direction_control)?;
        Ok(transport.with_toggle_time(self.toggle_time()))
    }
}

/// Master engine settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Default time to wait for a reply, per attempt, in milliseconds
    pub timeout_ms: u64,

    /// Default number of retries after the first attempt
    pub max_retries: u8,

    /// Quiet time before each transmission, in milliseconds
    pub line_ready_ms: u64,

    /// Longest single transport read while awaiting a reply, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            line_ready_ms: LINE_READY_TIME_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl MasterConfig {
    /// Reject zero timeouts
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.timeout_ms == 0 {
            return Err(ProtocolError::Config("timeout_ms must be non-zero".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ProtocolError::Config(
                "poll_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Retry policy applied to requests built by the master
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.timeout_ms))
    }

    /// Quiet time before each transmission
    pub fn line_ready(&self) -> Duration {
        Duration::from_millis(self.line_ready_ms)
    }

    /// Longest single transport read
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
