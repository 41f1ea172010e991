//! Remote serial protocol spoken between a debugger and the debug stub.
//!
//! ## Wire Format
//!
//! ```text
//! $<payload>#<checksum>
//! ```
//!
//! - **payload**: command or reply text. `$`, `#`, `}` and `*` are sent as
//!   `}` followed by the byte XOR `0x20`.
//! - **checksum**: two lowercase hex digits, the sum of the payload bytes as
//!   sent (escapes included) modulo 256.
//!
//! Outside a packet a single byte carries meaning on its own:
//!
//! | Byte | Name      | Meaning                                   |
//! |------|-----------|-------------------------------------------|
//! | `+`  | ack       | previous packet received intact           |
//! | `-`  | nack      | previous packet corrupted, resend it      |
//! | 0x03 | interrupt | stop the running program                  |
//!
//! Every other byte between packets is line noise and ignored.

pub mod command;
pub mod hex;
pub mod reply;

pub use command::{BreakpointKind, Command};

pub const PACKET_START: u8 = b'$';
pub const PACKET_END: u8 = b'#';
pub const ESCAPE: u8 = b'}';
/// Run-length marker. Never generated, but escaped so a peer cannot misread it.
pub const RUN_LENGTH: u8 = b'*';
pub const ACK: u8 = b'+';
pub const NACK: u8 = b'-';
pub const INTERRUPT: u8 = 0x03;

/// Largest payload accepted or produced (advertised in `qSupported`).
pub const MAX_PACKET_SIZE: usize = 16 * 1024;

/// Protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    PacketTooLarge(usize),
    InvalidHex(&'static str),
    InvalidCommand(&'static str),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PacketTooLarge(size) => write!(f, "packet too large: {size}"),
            Self::InvalidHex(what) => write!(f, "invalid hex: {what}"),
            Self::InvalidCommand(msg) => write!(f, "invalid command: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

fn needs_escape(byte: u8) -> bool {
    matches!(byte, PACKET_START | PACKET_END | ESCAPE | RUN_LENGTH)
}

/// Modulo-256 sum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Frame `payload` as `$<escaped payload>#<checksum>`.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_PACKET_SIZE {
        return Err(ProtocolError::PacketTooLarge(payload.len()));
    }
    let mut body = Vec::with_capacity(payload.len() + 8);
    for &b in payload {
        if needs_escape(b) {
            body.push(ESCAPE);
            body.push(b ^ 0x20);
        } else {
            body.push(b);
        }
    }
    let sum = checksum(&body);
    let mut buf = Vec::with_capacity(body.len() + 4);
    buf.push(PACKET_START);
    buf.extend_from_slice(&body);
    buf.push(PACKET_END);
    buf.extend_from_slice(hex::encode(&[sum]).as_bytes());
    Ok(buf)
}

fn unescape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.iter();
    while let Some(&b) = bytes.next() {
        if b == ESCAPE {
            if let Some(&next) = bytes.next() {
                out.push(next ^ 0x20);
            }
        } else {
            out.push(b);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Decoder (buffered, handles partial reads)
// ---------------------------------------------------------------------------

/// One unit read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nack,
    Interrupt,
    /// A packet with a valid checksum; the payload is unescaped.
    Packet(Vec<u8>),
    /// A complete packet whose checksum did not match.
    Corrupt,
}

/// Buffered frame decoder for streaming data.
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4 * 1024),
        }
    }

    /// Feed data and extract complete frames.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut offset = 0;

        while let Some(&b) = self.buf.get(offset) {
            match b {
                ACK => {
                    frames.push(Frame::Ack);
                    offset += 1;
                }
                NACK => {
                    frames.push(Frame::Nack);
                    offset += 1;
                }
                INTERRUPT => {
                    frames.push(Frame::Interrupt);
                    offset += 1;
                }
                PACKET_START => {
                    let rest = self.buf.get(offset + 1..).unwrap_or_default();
                    let Some(end) = rest.iter().position(|&c| c == PACKET_END) else {
                        if rest.len() > 2 * MAX_PACKET_SIZE {
                            let len = rest.len();
                            self.buf.clear();
                            return Err(ProtocolError::PacketTooLarge(len));
                        }
                        break;
                    };
                    let Some(sum_text) = rest.get(end + 1..end + 3) else {
                        break;
                    };
                    let body = rest.get(..end).unwrap_or_default();
                    let frame = match hex::decode(sum_text) {
                        Ok(sum) if sum.first() == Some(&checksum(body)) => {
                            Frame::Packet(unescape(body))
                        }
                        _ => Frame::Corrupt,
                    };
                    frames.push(frame);
                    offset += 1 + end + 3;
                }
                _ => offset += 1,
            }
        }

        // Compact: remove consumed bytes once at the end
        if offset > 0 {
            self.buf.drain(..offset.min(self.buf.len()));
        }

        Ok(frames)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
