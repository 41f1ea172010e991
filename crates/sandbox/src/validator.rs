//! Acceptance check for code entering the executable region.

/// Why a code buffer was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} at offset {offset:#x}")]
pub struct Rejection {
    /// Offset within the submitted buffer.
    pub offset: usize,
    pub reason: &'static str,
}

/// Decides whether bytes may become executable at a sandbox address.
pub trait CodeValidator: Send + Sync {
    fn validate(&self, addr: u64, code: &[u8]) -> Result<(), Rejection>;

    /// Check a replacement of `old` by `new` at `addr`.
    fn validate_replacement(&self, addr: u64, old: &[u8], new: &[u8]) -> Result<(), Rejection> {
        let _ = old;
        self.validate(addr, new)
    }
}

/// Two-byte `0F xx` opcodes that leave the sandbox or touch system state.
const FORBIDDEN_0F: &[(u8, &str)] = &[
    (0x00, "system table instruction"),
    (0x01, "system table instruction"),
    (0x05, "syscall"),
    (0x07, "sysret"),
    (0x20, "control register move"),
    (0x22, "control register move"),
    (0x30, "wrmsr"),
    (0x32, "rdmsr"),
    (0x34, "sysenter"),
    (0x35, "sysexit"),
];

fn forbidden_single(op: u8) -> Option<&'static str> {
    let reason = match op {
        0xCD | 0xCE | 0xF1 => "software interrupt",
        0xE4..=0xE7 | 0xEC..=0xEF | 0x6C..=0x6F => "port I/O",
        0xFA | 0xFB => "interrupt flag change",
        0x8E => "segment register load",
        0xEA | 0x9A => "far transfer",
        0xCA | 0xCB => "far return",
        0xCF => "iret",
        _ => return None,
    };
    Some(reason)
}

/// Conservative byte filter.
///
/// Refuses any occurrence of a privileged or sandbox-escaping opcode byte,
/// wherever it appears. It over-rejects (immediates can trip it) but never
/// lets one of those encodings through. `HLT` and `INT3` are allowed.
#[derive(Debug, Default, Clone, Copy)]
pub struct BundleValidator;

impl CodeValidator for BundleValidator {
    fn validate(&self, _addr: u64, code: &[u8]) -> Result<(), Rejection> {
        let mut bytes = code.iter().copied().enumerate().peekable();
        while let Some((offset, op)) = bytes.next() {
            if let Some(reason) = forbidden_single(op) {
                return Err(Rejection { offset, reason });
            }
            if op != 0x0F {
                continue;
            }
            let Some(&(_, next)) = bytes.peek() else {
                continue;
            };
            if let Some(&(_, reason)) = FORBIDDEN_0F.iter().find(|(b, _)| *b == next) {
                return Err(Rejection { offset, reason });
            }
        }
        Ok(())
    }
}

/// Accepts everything. For hosts that validate out of band.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl CodeValidator for AcceptAll {
    fn validate(&self, _addr: u64, _code: &[u8]) -> Result<(), Rejection> {
        Ok(())
    }
}
