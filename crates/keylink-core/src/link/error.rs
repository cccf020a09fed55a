//! Link errors

use thiserror::Error;

/// Errors that can occur on the terminal link
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Link timeout")]
    Timeout,

    #[error("Transport not open")]
    NotConnected,

    #[error("Transport already open")]
    AlreadyConnected,

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Invalid command code: {0}")]
    InvalidCommand(String),

    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Offending payload length
        len: usize,
        /// Maximum the codec accepts
        max: usize,
    },

    #[error("Supervisor stopped")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
