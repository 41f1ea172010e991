//! Local descriptor table backend (Linux, x86).
//!
//! Entries are written with `modify_ldt(0x11, ..)`, which updates a whole
//! descriptor at once, and read back with `modify_ldt(0, ..)`.

use std::ffi::c_void;
use std::io;

use super::table::DescriptorTable;
use crate::error::{Result, SandboxError};

const MODIFY_LDT_READ: libc::c_long = 0;
const MODIFY_LDT_WRITE: libc::c_long = 0x11;

const LDT_ENTRIES: u32 = 8192;
const LDT_ENTRY_SIZE: usize = 8;

/// The kernel always sets the accessed bit on entries it installs.
const ACCESSED_BIT: u64 = 1 << 40;

// struct user_desc flag bits.
const SEG_32BIT: u32 = 1 << 0;
const CONTENTS_SHIFT: u32 = 1;
const READ_EXEC_ONLY: u32 = 1 << 3;
const LIMIT_IN_PAGES: u32 = 1 << 4;
const SEG_NOT_PRESENT: u32 = 1 << 5;
const USEABLE: u32 = 1 << 6;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct UserDesc {
    entry_number: u32,
    base_addr: u32,
    limit: u32,
    flags: u32,
}

/// Translate a descriptor word into the kernel's `user_desc` layout.
fn user_desc(index: u32, word: u64) -> UserDesc {
    let limit = (word & 0xFFFF) | (((word >> 48) & 0xF) << 16);
    let base = ((word >> 16) & 0xFF_FFFF) | (((word >> 56) & 0xFF) << 24);
    let ty = ((word >> 40) & 0xF) as u32;
    let code = ty & 0b1000 != 0;
    let rw = ty & 0b0010 != 0;
    // contents: 0 data, 1 data expand-down, 2 code, 3 conforming code.
    let contents = ((ty >> 2) & 0b1) | if code { 0b10 } else { 0 };

    let mut flags = contents << CONTENTS_SHIFT;
    if !rw {
        flags |= READ_EXEC_ONLY;
    }
    if word & (1 << 54) != 0 {
        flags |= SEG_32BIT;
    }
    if word & (1 << 55) != 0 {
        flags |= LIMIT_IN_PAGES;
    }
    if word & (1 << 47) == 0 {
        flags |= SEG_NOT_PRESENT;
    }
    if word & (1 << 52) != 0 {
        flags |= USEABLE;
    }
    UserDesc {
        entry_number: index,
        base_addr: base as u32,
        limit: limit as u32,
        flags,
    }
}

/// An entry the kernel treats as empty and zeroes.
fn empty_desc(index: u32) -> UserDesc {
    UserDesc {
        entry_number: index,
        flags: READ_EXEC_ONLY | SEG_NOT_PRESENT,
        ..UserDesc::default()
    }
}

fn modify_ldt(func: libc::c_long, ptr: *mut c_void, bytes: usize) -> io::Result<usize> {
    // SAFETY: `ptr` points to a live buffer of at least `bytes` bytes for the
    // duration of the call; the kernel reads or writes only within it.
    let rc = unsafe { libc::syscall(libc::SYS_modify_ldt, func, ptr, bytes) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// The calling process's local descriptor table.
#[derive(Debug, Default)]
pub struct LinuxLdt;

impl LinuxLdt {
    fn check_index(index: u32) -> Result<()> {
        if index >= LDT_ENTRIES {
            return Err(SandboxError::InvalidHandle(index));
        }
        Ok(())
    }

    fn write(mut desc: UserDesc) -> Result<()> {
        let size = std::mem::size_of::<UserDesc>();
        modify_ldt(MODIFY_LDT_WRITE, (&raw mut desc).cast(), size)?;
        Ok(())
    }
}

impl DescriptorTable for LinuxLdt {
    fn capacity(&self) -> u32 {
        LDT_ENTRIES
    }

    fn install(&self, index: u32, entry: u64) -> Result<()> {
        Self::check_index(index)?;
        if (entry >> 45) & 0b11 != 3 {
            return Err(SandboxError::InvalidArgument(
                "LDT entries must be user privilege".to_string(),
            ));
        }
        Self::write(user_desc(index, entry))
    }

    fn clear(&self, index: u32) -> Result<()> {
        Self::check_index(index)?;
        Self::write(empty_desc(index))
    }

    fn read(&self, index: u32) -> Result<u64> {
        Self::check_index(index)?;
        let count = index as usize + 1;
        let mut words = vec![0u64; count];
        let read = modify_ldt(
            MODIFY_LDT_READ,
            words.as_mut_ptr().cast(),
            count * LDT_ENTRY_SIZE,
        )?;
        if read < count * LDT_ENTRY_SIZE {
            return Ok(0);
        }
        Ok(words.get(index as usize).copied().unwrap_or(0) & !ACCESSED_BIT)
    }
}
