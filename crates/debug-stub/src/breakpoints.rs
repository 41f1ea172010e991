//! Software breakpoints.
//!
//! Breakpoints are only present in memory while the program runs. The
//! session lifts them on every halt and arms them again on resume, so
//! memory reads made while halted always show the program's own bytes.

use std::collections::BTreeMap;

use sandbox::{Result, SandboxError};
use tracing::{debug, warn};

use crate::target::Target;

pub const TRAP_OPCODE: u8 = 0xCC;

#[derive(Debug, Default)]
pub struct Breakpoints {
    /// Address to the byte the trap replaced, when armed.
    saved: BTreeMap<u64, Option<u8>>,
}

impl Breakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.saved.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.saved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }

    /// Register a breakpoint. Inserting the same address twice is a no-op.
    pub fn insert(&mut self, target: &dyn Target, addr: u64) -> Result<()> {
        if addr >= target.memory_size() {
            return Err(SandboxError::AccessDenied { addr, len: 1 });
        }
        self.saved.entry(addr).or_insert(None);
        Ok(())
    }

    /// Forget a breakpoint, restoring its byte if armed.
    pub fn remove(&mut self, target: &dyn Target, addr: u64) -> Result<()> {
        if let Some(Some(byte)) = self.saved.remove(&addr) {
            lift(target, addr, byte)?;
        }
        Ok(())
    }

    /// Write the trap opcode at every breakpoint except `skip`.
    pub fn arm(&mut self, target: &dyn Target, skip: Option<u64>) -> Result<()> {
        for (&addr, saved) in self.saved.iter_mut() {
            if saved.is_some() || Some(addr) == skip {
                continue;
            }
            *saved = Some(target.swap_byte(addr, TRAP_OPCODE)?);
        }
        Ok(())
    }

    /// Put the original bytes back.
    pub fn disarm(&mut self, target: &dyn Target) {
        for (&addr, saved) in self.saved.iter_mut() {
            let Some(byte) = saved.take() else {
                continue;
            };
            if let Err(e) = lift(target, addr, byte) {
                warn!(addr = format_args!("{addr:#x}"), error = %e, "failed to lift breakpoint");
            }
        }
    }

    /// Disarm and forget every breakpoint.
    pub fn clear(&mut self, target: &dyn Target) {
        self.disarm(target);
        self.saved.clear();
    }
}

/// Put `byte` back at `addr` unless the trap was overwritten meanwhile, in
/// which case the new code stays.
fn lift(target: &dyn Target, addr: u64, byte: u8) -> Result<()> {
    let found = target.compare_swap_byte(addr, TRAP_OPCODE, byte)?;
    if found != TRAP_OPCODE {
        debug!(
            addr = format_args!("{addr:#x}"),
            found, "breakpoint byte was replaced, keeping the new code"
        );
    }
    Ok(())
}
