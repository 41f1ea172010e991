use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, SandboxError};

/// Storage for descriptor words.
///
/// Every `install` and `clear` is a single aligned 64-bit store, so a reader
/// sees either the old or the new entry, never a mix.
pub trait DescriptorTable: Send + Sync {
    fn capacity(&self) -> u32;
    fn install(&self, index: u32, entry: u64) -> Result<()>;
    fn clear(&self, index: u32) -> Result<()>;
    fn read(&self, index: u32) -> Result<u64>;
}

/// In-process descriptor table.
pub struct SoftwareTable {
    entries: Box<[AtomicU64]>,
}

impl SoftwareTable {
    pub fn new(capacity: u32) -> Self {
        Self {
            entries: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn entry(&self, index: u32) -> Result<&AtomicU64> {
        self.entries
            .get(index as usize)
            .ok_or(SandboxError::InvalidHandle(index))
    }
}

impl DescriptorTable for SoftwareTable {
    fn capacity(&self) -> u32 {
        self.entries.len() as u32
    }

    fn install(&self, index: u32, entry: u64) -> Result<()> {
        self.entry(index)?.store(entry, Ordering::Release);
        Ok(())
    }

    fn clear(&self, index: u32) -> Result<()> {
        self.entry(index)?.store(0, Ordering::Release);
        Ok(())
    }

    fn read(&self, index: u32) -> Result<u64> {
        Ok(self.entry(index)?.load(Ordering::Acquire))
    }
}
