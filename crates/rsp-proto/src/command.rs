//! Debugger commands.
//!
//! | Payload                 | Command            |
//! |-------------------------|--------------------|
//! | `?`                     | halt reason        |
//! | `g` / `G<hex>`          | read / write all registers |
//! | `p<n>` / `P<n>=<hex>`   | read / write one register  |
//! | `m<addr>,<len>`         | read memory        |
//! | `M<addr>,<len>:<hex>`   | write memory       |
//! | `c[addr]` / `s[addr]`   | continue / step    |
//! | `Z<t>,<addr>,<kind>`    | insert breakpoint  |
//! | `z<t>,<addr>,<kind>`    | remove breakpoint  |
//! | `D[;pid]`               | detach             |
//! | `k`                     | kill               |
//! | `H<op><thread>`         | select thread      |
//! | `qSupported[:features]` | feature negotiation |
//! | `qAttached`, `qC`, `qfThreadInfo`, `qsThreadInfo` | queries |
//! | `QStartNoAckMode`       | stop acknowledging packets |

use crate::ProtocolError;
use crate::hex;

/// Breakpoint type carried by `Z`/`z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    Software,
    /// Hardware breakpoints and watchpoints (`Z1`..`Z4`), not provided.
    Other(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    HaltReason,
    ReadRegisters,
    WriteRegisters(Vec<u8>),
    ReadRegister(usize),
    WriteRegister { index: usize, value: Vec<u8> },
    ReadMemory { addr: u64, len: u64 },
    WriteMemory { addr: u64, data: Vec<u8> },
    Continue(Option<u64>),
    Step(Option<u64>),
    InsertBreakpoint { kind: BreakpointKind, addr: u64 },
    RemoveBreakpoint { kind: BreakpointKind, addr: u64 },
    Detach,
    Kill,
    SetThread,
    QuerySupported,
    QueryAttached,
    QueryCurrentThread,
    QueryThreadInfoFirst,
    QueryThreadInfoNext,
    StartNoAckMode,
    /// Anything else; answered with the empty reply.
    Unknown(Vec<u8>),
}

impl Command {
    /// Whether the command can only be served while the program is halted.
    pub fn needs_halt(&self) -> bool {
        matches!(
            self,
            Self::HaltReason
                | Self::ReadRegisters
                | Self::WriteRegisters(_)
                | Self::ReadRegister(_)
                | Self::WriteRegister { .. }
                | Self::ReadMemory { .. }
                | Self::WriteMemory { .. }
                | Self::Continue(_)
                | Self::Step(_)
                | Self::InsertBreakpoint { .. }
                | Self::RemoveBreakpoint { .. }
        )
    }

    /// Parse an unescaped packet payload.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let Some((&head, rest)) = payload.split_first() else {
            return Ok(Self::Unknown(Vec::new()));
        };
        let cmd = match head {
            b'?' => Self::HaltReason,
            b'g' => Self::ReadRegisters,
            b'G' => Self::WriteRegisters(hex::decode(rest)?),
            b'p' => Self::ReadRegister(parse_index(rest)?),
            b'P' => {
                let (index, value) = split_once(rest, b'=')
                    .ok_or(ProtocolError::InvalidCommand("P expects n=value"))?;
                Self::WriteRegister {
                    index: parse_index(index)?,
                    value: hex::decode(value)?,
                }
            }
            b'm' => {
                let (addr, len) = parse_addr_len(rest)?;
                Self::ReadMemory { addr, len }
            }
            b'M' => {
                let (range, data) = split_once(rest, b':')
                    .ok_or(ProtocolError::InvalidCommand("M expects addr,len:data"))?;
                let (addr, len) = parse_addr_len(range)?;
                let data = hex::decode(data)?;
                if data.len() as u64 != len {
                    return Err(ProtocolError::InvalidCommand("M length does not match data"));
                }
                Self::WriteMemory { addr, data }
            }
            b'c' => Self::Continue(parse_optional_addr(rest)?),
            b's' => Self::Step(parse_optional_addr(rest)?),
            b'Z' | b'z' => {
                let (kind, addr) = parse_breakpoint(rest)?;
                if head == b'Z' {
                    Self::InsertBreakpoint { kind, addr }
                } else {
                    Self::RemoveBreakpoint { kind, addr }
                }
            }
            b'D' => Self::Detach,
            b'k' => Self::Kill,
            b'H' => Self::SetThread,
            b'q' => parse_query(rest),
            b'Q' if rest == b"StartNoAckMode" => Self::StartNoAckMode,
            _ => Self::Unknown(payload.to_vec()),
        };
        Ok(cmd)
    }
}

fn parse_query(rest: &[u8]) -> Command {
    let name = split_once(rest, b':').map_or(rest, |(name, _)| name);
    match name {
        b"Supported" => Command::QuerySupported,
        b"Attached" => Command::QueryAttached,
        b"C" => Command::QueryCurrentThread,
        b"fThreadInfo" => Command::QueryThreadInfoFirst,
        b"sThreadInfo" => Command::QueryThreadInfoNext,
        _ => {
            let mut payload = vec![b'q'];
            payload.extend_from_slice(rest);
            Command::Unknown(payload)
        }
    }
}

fn split_once(s: &[u8], sep: u8) -> Option<(&[u8], &[u8])> {
    let at = s.iter().position(|&b| b == sep)?;
    Some((s.get(..at)?, s.get(at + 1..)?))
}

fn parse_index(text: &[u8]) -> Result<usize, ProtocolError> {
    usize::try_from(hex::parse_u64(text)?)
        .map_err(|_| ProtocolError::InvalidCommand("register index out of range"))
}

fn parse_addr_len(text: &[u8]) -> Result<(u64, u64), ProtocolError> {
    let (addr, len) =
        split_once(text, b',').ok_or(ProtocolError::InvalidCommand("expected addr,len"))?;
    Ok((hex::parse_u64(addr)?, hex::parse_u64(len)?))
}

fn parse_optional_addr(text: &[u8]) -> Result<Option<u64>, ProtocolError> {
    if text.is_empty() {
        Ok(None)
    } else {
        hex::parse_u64(text).map(Some)
    }
}

fn parse_breakpoint(text: &[u8]) -> Result<(BreakpointKind, u64), ProtocolError> {
    let mut fields = text.split(|&b| b == b',');
    let ty = fields
        .next()
        .ok_or(ProtocolError::InvalidCommand("missing breakpoint type"))?;
    let addr = fields
        .next()
        .ok_or(ProtocolError::InvalidCommand("missing breakpoint address"))?;
    let kind = match hex::parse_u64(ty)? {
        0 => BreakpointKind::Software,
        other => BreakpointKind::Other(u8::try_from(other).unwrap_or(u8::MAX)),
    };
    Ok((kind, hex::parse_u64(addr)?))
}
