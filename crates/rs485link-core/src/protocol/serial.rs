//! Serial port handling
//!
//! Provides a [`Transport`] over a real serial port with RS485 transceiver
//! direction control, plus port discovery helpers.

use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{Direction, ProtocolError, Transport, DEFAULT_BAUD_RATE, TRANSCEIVER_TOGGLE_TIME_US};

/// Bits on the wire per byte (1 start + 8 data + 1 stop)
const BITS_PER_BYTE: u64 = 10;

/// Upper bound for a single blocking read on the port
const READ_SLICE: Duration = Duration::from_millis(5);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
            ),
            _ => (None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
        }
    }
}

/// Sort key so that USB RS485 adapters (ttyUSB*) come first, then ttyACM*,
/// then on-board UARTs (ttyAMA*, ttyS*), each numerically, then the rest by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in ["ttyUSB", "ttyACM", "ttyAMA", "ttyS"].iter().enumerate() {
        if let Some(rest) = basename.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (rank as u8, num, basename.to_string());
        }
    }
    (4, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: add adapters the enumeration API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyUSB") || fname.starts_with("ttyAMA") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        manufacturer: None,
                        product: None,
                    });
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port with short read timeouts suitable for bus polling
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    let mut port = serialport::new(name, baud)
        .timeout(READ_SLICE)
        .open()
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    configure_port(port.as_mut())?;
    Ok(port)
}

/// Configure a serial port for bus communication (8N1, no flow control)
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;
    Ok(())
}

/// How the transceiver's DE/RE lines are driven
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DirectionControl {
    /// Transceiver switches direction on its own (auto-direction adapters)
    #[default]
    Automatic,
    /// DE/RE wired to the port's RTS line
    Rts {
        /// RTS level that enables the driver
        active_high: bool,
    },
}

/// [`Transport`] over a serial port
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    control: DirectionControl,
    toggle_time: Duration,
    baud_rate: u32,
}

impl SerialTransport {
    /// Wrap an open port
    pub fn new(port: Box<dyn SerialPort>, control: DirectionControl) -> Self {
        let baud_rate = port.baud_rate().unwrap_or(DEFAULT_BAUD_RATE);
        Self {
            port,
            control,
            toggle_time: Duration::from_micros(TRANSCEIVER_TOGGLE_TIME_US),
            baud_rate,
        }
    }

    /// Open `name` and wrap it, starting in receive mode
    pub fn open(
        name: &str,
        baud_rate: u32,
        control: DirectionControl,
    ) -> Result<Self, ProtocolError> {
        let port = open_port(name, Some(baud_rate))?;
        let mut transport = Self::new(port, control);
        transport.set_direction(Direction::Receive)?;
        Ok(transport)
    }

    /// Set the transceiver settling time after a direction change
    pub fn with_toggle_time(mut self, toggle_time: Duration) -> Self {
        self.toggle_time = toggle_time;
        self
    }

    /// Discard anything pending in the port's buffers
    pub fn clear_buffers(&mut self) -> Result<(), ProtocolError> {
        self.port.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    /// Time the UART needs to shift `len` bytes out at the current baud rate
    fn wire_time(&self, len: usize) -> Duration {
        let baud = if self.baud_rate == 0 {
            warn!("baud rate is 0, assuming {}", DEFAULT_BAUD_RATE);
            DEFAULT_BAUD_RATE
        } else {
            self.baud_rate
        };
        let bits = len as u64 * BITS_PER_BYTE;
        Duration::from_micros(bits * 1_000_000 / baud as u64)
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;

        // flush() only empties the OS buffer; the driver must stay enabled
        // until the UART has shifted the last bit out
        let wait = self.wire_time(bytes.len()).mul_f32(1.1);
        debug!(
            len = bytes.len(),
            wait_us = wait.as_micros() as u64,
            "waiting for transmission"
        );
        std::thread::sleep(wait);
        Ok(())
    }

    fn set_direction(&mut self, direction: Direction) -> Result<(), ProtocolError> {
        match self.control {
            DirectionControl::Automatic => Ok(()),
            DirectionControl::Rts { active_high } => {
                let level = match direction {
                    Direction::Transmit => active_high,
                    Direction::Receive => !active_high,
                };
                self.port.write_request_to_send(level)?;
                std::thread::sleep(self.toggle_time);
                Ok(())
            }
        }
    }

    fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>, ProtocolError> {
        let mut received = Vec::new();
        let mut buffer = [0u8; 256];

        loop {
            let waiting = self.port.bytes_to_read()? as usize;
            if waiting > 0 {
                let want = waiting.min(buffer.len());
                match self.port.read(&mut buffer[..want]) {
                    Ok(n) => received.extend_from_slice(&buffer[..n]),
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::TimedOut
                            || e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            if !received.is_empty() {
                return Ok(received);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(received);
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(1)));
        }
    }
}
