//! Reply payloads sent by the stub.

use crate::MAX_PACKET_SIZE;

pub const OK: &[u8] = b"OK";
/// Reply for unsupported commands.
pub const EMPTY: &[u8] = b"";

/// Error numbers carried by `Exx` replies.
pub const E_MALFORMED: u8 = 0x00;
pub const E_ACCESS_DENIED: u8 = 0x01;
pub const E_FAILED: u8 = 0x02;

/// Signal reported for a stop requested with the interrupt byte.
pub const SIGINT: u8 = 2;
/// Signal reported for breakpoint and single-step stops.
pub const SIGTRAP: u8 = 5;

/// Thread id of the single sandboxed thread.
pub const THREAD_ID: u64 = 1;

pub fn error(code: u8) -> Vec<u8> {
    format!("E{code:02x}").into_bytes()
}

/// Stop reply: `S<signal>`.
pub fn stopped(signal: u8) -> Vec<u8> {
    format!("S{signal:02x}").into_bytes()
}

/// Exit reply: `W<status>`.
pub fn exited(status: u8) -> Vec<u8> {
    format!("W{status:02x}").into_bytes()
}

pub fn supported() -> Vec<u8> {
    format!("PacketSize={MAX_PACKET_SIZE:x};QStartNoAckMode+").into_bytes()
}

pub fn current_thread() -> Vec<u8> {
    format!("QC{THREAD_ID:x}").into_bytes()
}

pub fn thread_list() -> Vec<u8> {
    format!("m{THREAD_ID:x}").into_bytes()
}

pub fn end_of_list() -> Vec<u8> {
    b"l".to_vec()
}

/// `qAttached`: `1` when attached to an existing process.
pub fn attached() -> Vec<u8> {
    b"1".to_vec()
}
