//! # KeyLink Core Library
//!
//! Link layer for pairing a key-holding "Master" terminal with a receiving
//! "Sub" terminal over an auto-discovered serial/USB channel.
//!
//! This library provides:
//! - Legacy frame codec (STX / 4-digit command / length / ETX / LRC)
//! - Heartbeat-driven connection supervision for both link roles
//! - Endpoint discovery across candidate ports and baud rates
//! - Cable presence detection before any port is opened
//! - A bounded diagnostics bus shared by every component
//!
//! Key-injection cryptography itself is out of scope: application frames
//! are forwarded opaquely to whatever handler the caller registers.
//!
//! ## Example
//!
//! ```rust,ignore
//! use keylink_core::link::{probe_endpoints, ConnectionSupervisor, SerialTransport};
//! use keylink_core::diag::DiagBus;
//!
//! let bus = DiagBus::new(512);
//! let found = probe_endpoints(&serial_factory, &[0, 1], &[9600, 115200], &bus)
//!     .expect("no openable port");
//! let transport = serial_factory(found.port, found.baud);
//! let sup = ConnectionSupervisor::start_master(transport, Default::default(), bus);
//! ```

#![warn(missing_docs)]

pub mod diag;
pub mod link;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::diag::{DiagBus, DiagEntry, Severity};
    pub use crate::link::{
        probe_endpoints, CableDetector, CommandCode, ConnectionState, ConnectionSupervisor,
        DetectionResult, FrameDecoder, LinkError, LinkRole, Message, ProbeResult,
        SerialTransport, SupervisorConfig, Transport,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
