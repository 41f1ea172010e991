//! x86-64 register file in debugger order.
//!
//! | Index | Registers                         | Width |
//! |-------|-----------------------------------|-------|
//! | 0-15  | rax rbx rcx rdx rsi rdi rbp rsp r8-r15 | 8 |
//! | 16    | rip                               | 8     |
//! | 17    | eflags                            | 4     |
//! | 18-23 | cs ss ds es fs gs                 | 4     |
//!
//! Values travel as little-endian bytes, concatenated in index order for the
//! whole-file transfer.

pub const REGISTER_COUNT: usize = 24;

pub const RSP: usize = 7;
pub const RIP: usize = 16;
pub const EFLAGS: usize = 17;
pub const CS: usize = 18;
pub const SS: usize = 19;
pub const DS: usize = 20;
pub const ES: usize = 21;
pub const FS: usize = 22;
pub const GS: usize = 23;

/// Trap flag: the processor stops after the next instruction.
pub const EFLAGS_TF: u64 = 1 << 8;

const NAMES: [&str; REGISTER_COUNT] = [
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip", "eflags", "cs", "ss", "ds", "es", "fs", "gs",
];

/// Debugger name of register `index`.
pub fn name(index: usize) -> Option<&'static str> {
    NAMES.get(index).copied()
}

/// Width in bytes of register `index`, or `None` outside the file.
pub fn width(index: usize) -> Option<usize> {
    match index {
        0..=RIP => Some(8),
        EFLAGS..REGISTER_COUNT => Some(4),
        _ => None,
    }
}

/// Size of the whole-file transfer: 17 * 8 + 7 * 4.
pub const REGISTER_FILE_SIZE: usize = 164;

/// Register values of the sandboxed thread.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Registers {
    values: [u64; REGISTER_COUNT],
}

impl Registers {
    pub fn get(&self, index: usize) -> Option<u64> {
        self.values.get(index).copied()
    }

    /// Set register `index`, truncated to its width.
    pub fn set(&mut self, index: usize, value: u64) -> bool {
        let Some(w) = width(index) else {
            return false;
        };
        let value = if w == 8 { value } else { value & 0xFFFF_FFFF };
        match self.values.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn rip(&self) -> u64 {
        self.get(RIP).unwrap_or_default()
    }

    pub fn set_rip(&mut self, value: u64) {
        self.set(RIP, value);
    }

    pub fn rsp(&self) -> u64 {
        self.get(RSP).unwrap_or_default()
    }

    pub fn trap_flag(&self) -> bool {
        self.get(EFLAGS).unwrap_or_default() & EFLAGS_TF != 0
    }

    pub fn set_trap_flag(&mut self, on: bool) {
        let flags = self.get(EFLAGS).unwrap_or_default();
        let flags = if on {
            flags | EFLAGS_TF
        } else {
            flags & !EFLAGS_TF
        };
        self.set(EFLAGS, flags);
    }

    /// Little-endian bytes of one register.
    pub fn read_one(&self, index: usize) -> Option<Vec<u8>> {
        let w = width(index)?;
        let bytes = self.get(index)?.to_le_bytes();
        Some(bytes.get(..w)?.to_vec())
    }

    /// Store one register from exactly `width(index)` little-endian bytes.
    pub fn write_one(&mut self, index: usize, bytes: &[u8]) -> bool {
        match width(index) {
            Some(w) if w == bytes.len() => {
                let mut buf = [0u8; 8];
                if let Some(dst) = buf.get_mut(..w) {
                    dst.copy_from_slice(bytes);
                }
                self.set(index, u64::from_le_bytes(buf))
            }
            _ => false,
        }
    }

    /// The whole file, `REGISTER_FILE_SIZE` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        (0..REGISTER_COUNT)
            .filter_map(|i| self.read_one(i))
            .flatten()
            .collect()
    }

    /// Parse a whole-file transfer. Returns `None` unless exactly
    /// `REGISTER_FILE_SIZE` bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != REGISTER_FILE_SIZE {
            return None;
        }
        let mut regs = Self::default();
        let mut offset = 0;
        for index in 0..REGISTER_COUNT {
            let w = width(index)?;
            if !regs.write_one(index, bytes.get(offset..offset + w)?) {
                return None;
            }
            offset += w;
        }
        Some(regs)
    }
}

/// Registers as captured when the thread halted. Never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSnapshot(Registers);

impl RegisterSnapshot {
    pub fn capture(regs: &Registers) -> Self {
        Self(regs.clone())
    }

    pub fn registers(&self) -> &Registers {
        &self.0
    }
}
