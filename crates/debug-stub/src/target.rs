use sandbox::{Result, Sandbox};
use sandbox_port::LockKind;

/// Memory of the debugged program, as seen by the stub.
pub trait Target: Send + Sync {
    fn memory_size(&self) -> u64;
    fn read_memory(&self, addr: u64, len: u64) -> Result<Vec<u8>>;
    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<()>;
    /// Replace one byte and return the previous value.
    fn swap_byte(&self, addr: u64, byte: u8) -> Result<u8>;
    /// Store `byte` only if `addr` still holds `current`; returns the byte
    /// found there.
    fn compare_swap_byte(&self, addr: u64, current: u8, byte: u8) -> Result<u8>;
}

impl<L: LockKind> Target for Sandbox<L> {
    fn memory_size(&self) -> u64 {
        Sandbox::memory_size(self)
    }

    fn read_memory(&self, addr: u64, len: u64) -> Result<Vec<u8>> {
        Sandbox::read_memory(self, addr, len)
    }

    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<()> {
        Sandbox::write_memory(self, addr, data)
    }

    fn swap_byte(&self, addr: u64, byte: u8) -> Result<u8> {
        Sandbox::swap_byte(self, addr, byte)
    }

    fn compare_swap_byte(&self, addr: u64, current: u8, byte: u8) -> Result<u8> {
        Sandbox::compare_swap_byte(self, addr, current, byte)
    }
}
