//! Frame encoding/decoding
//!
//! Implements the legacy terminal frame format:
//!
//! - 1 byte: STX (0x02)
//! - 4 bytes: command code, ASCII decimal digits
//! - 2 bytes: payload length (big-endian)
//! - N bytes: payload
//! - 1 byte: ETX (0x03)
//! - 1 byte: LRC, XOR of every byte after STX (ETX included)
//!
//! The peer firmware is not under our control, so this layout is preserved
//! bit-for-bit.

use byteorder::{BigEndian, ByteOrder};
use std::fmt;

use crate::diag::DiagBus;

use super::{LinkError, MAX_DECODER_BUFFER, MAX_PAYLOAD_SIZE};

const STX: u8 = 0x02;
const ETX: u8 = 0x03;

/// Frame overhead around the payload: STX + command + length + ETX + LRC
const FRAME_OVERHEAD: usize = 1 + 4 + 2 + 1 + 1;

/// Header bytes needed before the payload length is known
const HEADER_LEN: usize = 1 + 4 + 2;

/// A 4-character decimal command code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandCode(pub [u8; 4]);

impl CommandCode {
    /// Parse a code from a 4-digit string.
    pub fn parse(code: &str) -> Result<Self, LinkError> {
        let bytes = code.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(u8::is_ascii_digit) {
            return Err(LinkError::InvalidCommand(code.to_string()));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// The code as a string slice.
    pub fn as_str(&self) -> &str {
        // Constructors only admit ASCII digits.
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// 4-character decimal command code
    pub command: CommandCode,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message from a command code and payload.
    pub fn new(command: CommandCode, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }
}

/// XOR of every byte after STX, ETX included
fn lrc(frame_after_stx: &[u8]) -> u8 {
    frame_after_stx.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Encode a message into its wire frame.
///
/// Total for any valid command code and payload up to [`MAX_PAYLOAD_SIZE`].
pub fn encode(message: &Message) -> Result<Vec<u8>, LinkError> {
    if message.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(LinkError::PayloadTooLarge {
            len: message.payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut bytes = Vec::with_capacity(message.payload.len() + FRAME_OVERHEAD);
    bytes.push(STX);
    bytes.extend_from_slice(&message.command.0);

    let mut len_bytes = [0u8; 2];
    BigEndian::write_u16(&mut len_bytes, message.payload.len() as u16);
    bytes.extend_from_slice(&len_bytes);

    bytes.extend_from_slice(&message.payload);
    bytes.push(ETX);
    bytes.push(lrc(&bytes[1..]));

    Ok(bytes)
}

/// Why the decoder rejected the byte at the front of its buffer
enum Reject {
    NoStx,
    BadCommand,
    Oversized(usize),
    MissingEtx,
    BadLrc { expected: u8, actual: u8 },
}

impl fmt::Display for Reject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reject::NoStx => write!(f, "expected STX"),
            Reject::BadCommand => write!(f, "non-decimal command code"),
            Reject::Oversized(len) => write!(f, "declared payload length {} over cap", len),
            Reject::MissingEtx => write!(f, "ETX missing at frame end"),
            Reject::BadLrc { expected, actual } => {
                write!(f, "LRC mismatch: expected {:#04x}, got {:#04x}", expected, actual)
            }
        }
    }
}

/// Outcome of one extraction attempt against the buffer front
enum Extract {
    /// Not enough bytes buffered to decide yet
    NeedMore,
    /// Complete frame of the given total length
    Frame(Message, usize),
    /// Front byte is not a valid frame start; skip one byte and retry
    Skip(Reject),
}

/// Stateful frame decoder.
///
/// Bytes are appended on each [`feed`](FrameDecoder::feed) and a
/// complete-frame prefix is removed once parsed. Reads may be split or
/// coalesced arbitrarily: feeding one byte at a time yields the same
/// messages as feeding everything at once. A malformed prefix skips exactly
/// one byte (bounded resynchronization) and publishes a diagnostic.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    bus: DiagBus,
    skipped_bytes: u64,
    overflows: u64,
}

impl FrameDecoder {
    /// Create a decoder publishing framing diagnostics to `bus`.
    pub fn new(bus: DiagBus) -> Self {
        Self {
            buffer: Vec::new(),
            bus,
            skipped_bytes: 0,
            overflows: 0,
        }
    }

    /// Total bytes discarded during resynchronization.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes
    }

    /// Times the buffer cap was hit and the buffer discarded.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Bytes currently held waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append newly read bytes and return every complete message now
    /// extractable from the front of the buffer, in arrival order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Message> {
        self.buffer.extend_from_slice(bytes);

        let mut messages = Vec::new();
        loop {
            match self.try_extract() {
                Extract::Frame(message, consumed) => {
                    self.buffer.drain(..consumed);
                    messages.push(message);
                }
                Extract::Skip(reason) => {
                    self.buffer.remove(0);
                    self.skipped_bytes += 1;
                    self.bus
                        .warn("codec", format!("skipped 1 byte: {}", reason));
                }
                Extract::NeedMore => break,
            }
        }

        // Bound memory under a garbage stream that never frames.
        if self.buffer.len() > MAX_DECODER_BUFFER {
            self.bus.error(
                "codec",
                format!(
                    "decoder buffer exceeded {} bytes, discarding {}",
                    MAX_DECODER_BUFFER,
                    self.buffer.len()
                ),
            );
            self.buffer.clear();
            self.overflows += 1;
        }

        messages
    }

    fn try_extract(&self) -> Extract {
        let buf = &self.buffer;
        if buf.is_empty() {
            return Extract::NeedMore;
        }
        if buf[0] != STX {
            return Extract::Skip(Reject::NoStx);
        }
        if buf.len() < HEADER_LEN {
            return Extract::NeedMore;
        }

        let command = &buf[1..5];
        if !command.iter().all(u8::is_ascii_digit) {
            return Extract::Skip(Reject::BadCommand);
        }

        let payload_len = BigEndian::read_u16(&buf[5..7]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Extract::Skip(Reject::Oversized(payload_len));
        }

        let total = payload_len + FRAME_OVERHEAD;
        if buf.len() < total {
            return Extract::NeedMore;
        }

        if buf[total - 2] != ETX {
            return Extract::Skip(Reject::MissingEtx);
        }

        let expected = lrc(&buf[1..total - 1]);
        let actual = buf[total - 1];
        if expected != actual {
            return Extract::Skip(Reject::BadLrc { expected, actual });
        }

        let message = Message {
            command: CommandCode([buf[1], buf[2], buf[3], buf[4]]),
            payload: buf[7..7 + payload_len].to_vec(),
        };
        Extract::Frame(message, total)
    }
}

impl fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("buffered", &self.buffer.len())
            .field("skipped_bytes", &self.skipped_bytes)
            .finish()
    }
}
