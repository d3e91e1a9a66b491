//! # rs485link Core Library
//!
//! Master/slave communication over a shared half-duplex RS485 bus.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Frame encoding and streaming decoding (STX/ETX markers, DLE
//!   byte-stuffing, CRC32 integrity check)
//! - A master engine with per-request timeout and bounded retries
//! - A threaded master facade with blocking and async submission
//! - A slave engine dispatching frames to an application handler
//! - Serial and in-memory transports
//!
//! ## Example
//!
//! ```rust,ignore
//! use rs485link_core::prelude::*;
//!
//! let transport = SerialTransport::open("/dev/ttyUSB0", 9600, DirectionControl::Automatic)?;
//! let mut master = Master::new(transport);
//!
//! let response = master.send_request(Request::new(5, "ping"));
//! if response.is_success() {
//!     println!("reply: {:?}", response.payload());
//! }
//! ```

pub mod config;
pub mod master;
pub mod protocol;
pub mod slave;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{BusConfig, MasterConfig};
    pub use crate::master::{
        Master, MasterState, MasterStats, Request, Response, RetryPolicy, ThreadedMaster,
    };
    pub use crate::protocol::{
        encode, DirectionControl, ErrorKind, Frame, FrameDecoder, MemoryBus, ProtocolError,
        SerialTransport, Transport,
    };
    pub use crate::slave::{EchoHandler, Handler, PingPongHandler, Slave, SlaveContext};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
