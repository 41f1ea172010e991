//! x86 segment descriptor encoding.
//!
//! ```text
//!  63      56 55 54 53 52 51   48 47 46 45 44 43  40 39       16 15        0
//! [base 31:24][G][D][L][A][lim 19:16][P][DPL][S][type][base 23:0 ][lim 15:0 ]
//! ```

use crate::config::DESCRIPTOR_ADDRESS_LIMIT;
use crate::error::{Result, SandboxError};

const PAGE: u64 = 4096;
/// Largest byte-granular segment (20-bit limit).
const BYTE_GRANULAR_MAX: u64 = 1 << 20;

const BIT_S: u64 = 1 << 44;
const BIT_P: u64 = 1 << 47;
const BIT_D: u64 = 1 << 54;
const BIT_G: u64 = 1 << 55;

const TYPE_CODE: u64 = 0b1000;
/// Readable for code, writable for data.
const TYPE_RW: u64 = 0b0010;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Code,
    Data,
}

/// Access rights of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAccess {
    pub kind: SegmentKind,
    /// Code: readable as data. Data: writable.
    pub rw: bool,
    /// Descriptor privilege level, 0 (most) to 3 (least privileged).
    pub privilege: u8,
}

impl SegmentAccess {
    /// Execute + read, user privilege.
    pub const fn code() -> Self {
        Self {
            kind: SegmentKind::Code,
            rw: true,
            privilege: 3,
        }
    }

    /// Read + write, user privilege.
    pub const fn data() -> Self {
        Self {
            kind: SegmentKind::Data,
            rw: true,
            privilege: 3,
        }
    }

    pub fn executable(&self) -> bool {
        self.kind == SegmentKind::Code
    }

    pub fn writable(&self) -> bool {
        self.kind == SegmentKind::Data && self.rw
    }
}

/// A segment bounding `[base, base + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub base: u64,
    pub size: u64,
    pub access: SegmentAccess,
}

impl SegmentDescriptor {
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Encode as a present 32-bit descriptor word.
    pub fn encode(&self) -> Result<u64> {
        if self.size == 0 || self.end() > DESCRIPTOR_ADDRESS_LIMIT {
            return Err(SandboxError::InvalidArgument(format!(
                "segment {:#x}+{:#x} cannot be described",
                self.base, self.size
            )));
        }
        if self.access.privilege > 3 {
            return Err(SandboxError::InvalidArgument(format!(
                "privilege level {} out of range",
                self.access.privilege
            )));
        }
        let (limit, granular) = if self.size <= BYTE_GRANULAR_MAX {
            (self.size - 1, false)
        } else if self.size % PAGE == 0 {
            (self.size / PAGE - 1, true)
        } else {
            return Err(SandboxError::InvalidArgument(format!(
                "segment size {:#x} is not page granular",
                self.size
            )));
        };

        let mut ty = 0;
        if self.access.kind == SegmentKind::Code {
            ty |= TYPE_CODE;
        }
        if self.access.rw {
            ty |= TYPE_RW;
        }

        let base = self.base;
        let mut word = limit & 0xFFFF;
        word |= (base & 0xFF_FFFF) << 16;
        word |= ty << 40;
        word |= BIT_S | BIT_P | BIT_D;
        word |= u64::from(self.access.privilege) << 45;
        word |= ((limit >> 16) & 0xF) << 48;
        word |= ((base >> 24) & 0xFF) << 56;
        if granular {
            word |= BIT_G;
        }
        Ok(word)
    }

    /// Decode a table entry. Returns `None` for an empty (not present) entry.
    pub fn decode(word: u64) -> Option<Self> {
        if word & BIT_P == 0 {
            return None;
        }
        let limit = (word & 0xFFFF) | (((word >> 48) & 0xF) << 16);
        let base = ((word >> 16) & 0xFF_FFFF) | (((word >> 56) & 0xFF) << 24);
        let size = if word & BIT_G != 0 {
            (limit + 1) * PAGE
        } else {
            limit + 1
        };
        let ty = (word >> 40) & 0xF;
        let kind = if ty & TYPE_CODE != 0 {
            SegmentKind::Code
        } else {
            SegmentKind::Data
        };
        Some(Self {
            base,
            size,
            access: SegmentAccess {
                kind,
                rw: ty & TYPE_RW != 0,
                privilege: ((word >> 45) & 0b11) as u8,
            },
        })
    }
}
