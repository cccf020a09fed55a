//! Terminal link layer
//!
//! Implements the legacy byte-oriented pairing protocol between the Master
//! (key holder) and Sub (key receiver) terminals.
//!
//! Heartbeat command codes `0100`/`0110` are consumed by this layer; every
//! other command code is opaque application traffic.

mod detect;
mod error;
mod frame;
mod probe;
pub mod serial;
mod supervisor;
mod transport;

pub use detect::{default_probes, CableDetector, DetectionResult, Probe};
pub use error::LinkError;
pub use frame::{encode, CommandCode, FrameDecoder, Message};
pub use probe::{probe_endpoints, ProbeResult};
pub use serial::{list_ports, PortInfo};
pub use supervisor::{
    ConnectionState, ConnectionSupervisor, HandlerRegistration, LinkRole, LinkStats,
    SupervisorConfig,
};
pub use transport::{SerialTransport, Transport};

/// Heartbeat request, sent periodically by the Master role
pub const HEARTBEAT_REQUEST: CommandCode = CommandCode(*b"0100");

/// Heartbeat acknowledgment, returned by the Sub role
pub const HEARTBEAT_ACK: CommandCode = CommandCode(*b"0110");

/// Default baud rate for terminal communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Maximum payload size accepted by the frame codec
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// Hard cap on the decoder's internal buffer. Reaching it under a
/// never-terminated garbage stream discards the buffer instead of growing.
pub const MAX_DECODER_BUFFER: usize = 16 * 1024;

/// Default timeout for a heartbeat acknowledgment in milliseconds
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2000;

/// Default interval between heartbeat polls in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
