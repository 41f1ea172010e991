//! Sandbox memory and code region occupancy.

use std::collections::BTreeMap;

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::publish::HALT_OPCODE;

/// Occupancy of the code region: created blocks keyed by start address.
#[derive(Debug, Clone)]
pub struct CodeRegion {
    start: u64,
    size: u64,
    blocks: BTreeMap<u64, u64>,
}

impl CodeRegion {
    pub fn new(start: u64, size: u64) -> Self {
        Self {
            start,
            size,
            blocks: BTreeMap::new(),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// Whether `[addr, addr + len)` lies inside the region without overflow.
    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.start && end <= self.end(),
            None => false,
        }
    }

    /// True when no created block overlaps `[addr, addr + len)`.
    pub fn is_free(&self, addr: u64, len: u64) -> bool {
        let end = addr.saturating_add(len);
        match self.blocks.range(..end).next_back() {
            Some((&start, &size)) => start + size <= addr,
            None => true,
        }
    }

    /// Length of the block created exactly at `addr`.
    pub fn block_at(&self, addr: u64) -> Option<u64> {
        self.blocks.get(&addr).copied()
    }

    pub(crate) fn insert(&mut self, addr: u64, len: u64) {
        self.blocks.insert(addr, len);
    }

    pub(crate) fn remove(&mut self, addr: u64) -> Option<u64> {
        self.blocks.remove(&addr)
    }

    /// Created blocks as `(start, len)`, in address order.
    pub fn blocks(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.blocks.iter().map(|(&a, &l)| (a, l))
    }

    pub fn used_bytes(&self) -> u64 {
        self.blocks.values().sum()
    }
}

/// Sandbox memory plus code region bookkeeping, guarded together.
pub struct AddressSpace {
    memory: Vec<u8>,
    code: CodeRegion,
}

impl AddressSpace {
    /// Zeroed memory with the whole code region filled with halt bytes.
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let size = usize::try_from(config.memory_size)
            .map_err(|_| SandboxError::InvalidArgument("memory size too large".to_string()))?;
        let mut space = Self {
            memory: vec![0; size],
            code: CodeRegion::new(config.code_region.start, config.code_region.size),
        };
        let (start, len) = (space.code.start(), space.code.size());
        space.bytes_mut(start, len)?.fill(HALT_OPCODE);
        Ok(space)
    }

    pub fn memory_size(&self) -> u64 {
        self.memory.len() as u64
    }

    pub fn code(&self) -> &CodeRegion {
        &self.code
    }

    pub(crate) fn code_mut(&mut self) -> &mut CodeRegion {
        &mut self.code
    }

    fn span(&self, addr: u64, len: u64) -> Result<std::ops::Range<usize>> {
        match addr.checked_add(len) {
            Some(end) if end <= self.memory_size() => Ok(addr as usize..end as usize),
            _ => Err(SandboxError::AccessDenied { addr, len }),
        }
    }

    /// Bytes at `[addr, addr + len)`; outside memory is `AccessDenied`.
    pub fn bytes(&self, addr: u64, len: u64) -> Result<&[u8]> {
        let span = self.span(addr, len)?;
        self.memory
            .get(span)
            .ok_or(SandboxError::AccessDenied { addr, len })
    }

    pub fn bytes_mut(&mut self, addr: u64, len: u64) -> Result<&mut [u8]> {
        let span = self.span(addr, len)?;
        self.memory
            .get_mut(span)
            .ok_or(SandboxError::AccessDenied { addr, len })
    }
}
