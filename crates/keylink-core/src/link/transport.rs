//! Transport abstraction
//!
//! A byte-stream duplex channel with explicit per-call timeouts. The link
//! layer never blocks without a deadline: every read and write names one.
//!
//! Concrete transports wrap whatever the platform provides (USB-serial CDC,
//! vendor RS-232 bridges). Tests substitute in-memory implementations.

use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

use super::{serial, LinkError};

/// Byte-stream duplex channel with open/close/read/write semantics.
///
/// A read that sees no data within its timeout returns `Ok(0)`: timeout is
/// an expected outcome on this link, not an error.
pub trait Transport: Send {
    /// Open the underlying channel. Opening an already-open transport is an
    /// [`LinkError::AlreadyConnected`] error.
    fn open(&mut self) -> Result<(), LinkError>;

    /// Close the underlying channel. Closing a closed transport is a no-op.
    fn close(&mut self);

    /// True while the channel is open.
    fn is_open(&self) -> bool;

    /// Write `data`, returning the number of bytes accepted.
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, LinkError>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means the timeout elapsed with
    /// no data.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError>;

    /// Human-readable endpoint description for diagnostics ("/dev/ttyUSB0@115200").
    fn describe(&self) -> String;
}

/// USB-serial transport over the `serialport` crate.
///
/// Configured 8N1 with DTR/RTS asserted on open, matching the legacy
/// terminal firmware's expectations.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Create an unopened transport for `port_name` at `baud_rate`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            port: None,
        }
    }

    /// Port name this transport targets.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Configured baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), LinkError> {
        if self.port.is_some() {
            return Err(LinkError::AlreadyConnected);
        }
        let mut port = serial::open_port(&self.port_name, Some(self.baud_rate))?;
        serial::configure_port(port.as_mut())?;
        serial::clear_buffers(port.as_mut())?;
        debug!(port = %self.port_name, baud = self.baud_rate, "serial transport open");
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "serial transport closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, LinkError> {
        let port = self.port.as_mut().ok_or(LinkError::NotConnected)?;
        port.set_timeout(timeout)
            .map_err(|e| LinkError::Serial(e.to_string()))?;
        port.write_all(data)
            .map_err(|e| LinkError::Serial(e.to_string()))?;
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        let port = self.port.as_mut().ok_or(LinkError::NotConnected)?;
        port.set_timeout(timeout)
            .map_err(|e| LinkError::Serial(e.to_string()))?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(LinkError::Serial(e.to_string())),
        }
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.port_name, self.baud_rate)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
