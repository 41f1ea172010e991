//! Dynamic Code Loader.
//!
//! Untrusted code inserts, replaces and removes bundles of machine code in
//! the code region. Every operation runs entirely under the code region
//! write lock and performs all of its checks before the first byte is
//! written, so a failed request leaves memory and bookkeeping untouched.

use sandbox_port::{LockKind, PortRwLock};
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::publish::{fill_halt, publish_code};
use crate::sandbox::Sandbox;

impl<L: LockKind> Sandbox<L> {
    fn check_alignment(&self, addr: u64, len: u64) -> Result<()> {
        let bundle = self.config().bundle_size;
        if addr % bundle != 0 || len % bundle != 0 {
            return Err(SandboxError::AlignmentViolation { addr, len, bundle });
        }
        Ok(())
    }

    fn check_replacement_allowed(&self) -> Result<()> {
        if !self.config().dyncode.allow_replacement {
            return Err(SandboxError::ReplacementDisabled);
        }
        Ok(())
    }

    /// Copy `code` into an unused, bundle-aligned range of the code region.
    ///
    /// A zero-length request succeeds without effect.
    pub fn dyncode_create(&self, dest: u64, code: &[u8]) -> Result<()> {
        self.check_segments()?;
        let len = code.len() as u64;
        if len == 0 {
            return Ok(());
        }
        self.check_alignment(dest, len)?;

        let mut space = self.space.write();
        if !space.code().contains_range(dest, len) {
            return Err(SandboxError::OutOfBounds { addr: dest, len });
        }
        if !space.code().is_free(dest, len) {
            return Err(SandboxError::RangeOccupied { addr: dest, len });
        }
        self.validator.validate(dest, code).map_err(|r| {
            warn!(addr = format_args!("{dest:#x}"), len, rejection = %r, "code rejected");
            SandboxError::ValidationFailed(r.to_string())
        })?;

        let bundle = self.config().bundle_size as usize;
        let target = space.bytes_mut(dest, len)?;
        publish_code(target, code, bundle);
        space.code_mut().insert(dest, len);
        debug!(addr = format_args!("{dest:#x}"), len, "code created");
        Ok(())
    }

    /// Replace a previously created block with code of the same length.
    ///
    /// Anything that is not exactly one block, misaligned requests included,
    /// fails with `InvalidModification`.
    pub fn dyncode_modify(&self, dest: u64, code: &[u8]) -> Result<()> {
        self.check_segments()?;
        self.check_replacement_allowed()?;
        let len = code.len() as u64;
        if len == 0 {
            return Ok(());
        }

        let mut space = self.space.write();
        if space.code().block_at(dest) != Some(len) {
            return Err(SandboxError::InvalidModification { addr: dest, len });
        }
        let old = space.bytes(dest, len)?;
        self.validator
            .validate_replacement(dest, old, code)
            .map_err(|r| {
                warn!(
                    addr = format_args!("{dest:#x}"),
                    len,
                    rejection = %r,
                    "replacement rejected"
                );
                SandboxError::ValidationFailed(r.to_string())
            })?;

        let bundle = self.config().bundle_size as usize;
        let rewritten = publish_code(space.bytes_mut(dest, len)?, code, bundle);
        debug!(addr = format_args!("{dest:#x}"), len, rewritten, "code modified");
        Ok(())
    }

    /// Remove a previously created block and refill it with halt bytes.
    pub fn dyncode_delete(&self, dest: u64, len: u64) -> Result<()> {
        self.check_segments()?;
        self.check_replacement_allowed()?;
        if len == 0 {
            return Ok(());
        }

        let mut space = self.space.write();
        if space.code().block_at(dest) != Some(len) {
            return Err(SandboxError::InvalidRange { addr: dest, len });
        }
        fill_halt(space.bytes_mut(dest, len)?);
        space.code_mut().remove(dest);
        debug!(addr = format_args!("{dest:#x}"), len, "code deleted");
        Ok(())
    }
}

/// Call gate used by untrusted code: source buffers live in sandbox memory
/// and results are `0` or a negative errno.
pub mod syscall {
    use sandbox_port::LockKind;

    use crate::error::Result;
    use crate::sandbox::Sandbox;

    fn status(result: Result<()>) -> i32 {
        match result {
            Ok(()) => 0,
            Err(e) => e.errno(),
        }
    }

    pub fn dyncode_create<L: LockKind>(sb: &Sandbox<L>, dest: u64, src: u64, size: u64) -> i32 {
        status(
            sb.read_memory(src, size)
                .and_then(|code| sb.dyncode_create(dest, &code)),
        )
    }

    pub fn dyncode_modify<L: LockKind>(sb: &Sandbox<L>, dest: u64, src: u64, size: u64) -> i32 {
        status(
            sb.read_memory(src, size)
                .and_then(|code| sb.dyncode_modify(dest, &code)),
        )
    }

    pub fn dyncode_delete<L: LockKind>(sb: &Sandbox<L>, dest: u64, size: u64) -> i32 {
        status(sb.dyncode_delete(dest, size))
    }
}
