use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sandbox_port::{Blocking, LockKind, PortRwLock};
use tracing::{error, info, warn};

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::region::{AddressSpace, CodeRegion};
use crate::segment::{SegmentAccess, SegmentHandle, SegmentManager};
use crate::validator::CodeValidator;

/// One sandbox instance: its segments, memory and loaded code.
///
/// Addresses taken and returned by every method are sandbox-relative.
pub struct Sandbox<L: LockKind = Blocking> {
    config: SandboxConfig,
    segments: Arc<SegmentManager<L>>,
    code_segment: SegmentHandle,
    data_segment: SegmentHandle,
    pub(crate) space: L::RwLock<AddressSpace>,
    pub(crate) validator: Box<dyn CodeValidator>,
    terminated: AtomicBool,
}

impl<L: LockKind> Sandbox<L> {
    /// Validate the layout and install the code and data segments.
    ///
    /// The code segment spans from the sandbox base to the end of the code
    /// region; the data segment spans all of sandbox memory.
    pub fn create(
        config: SandboxConfig,
        segments: Arc<SegmentManager<L>>,
        validator: Box<dyn CodeValidator>,
    ) -> Result<Self> {
        config.validate()?;
        let code_end = config
            .code_region
            .end()
            .ok_or_else(|| SandboxError::InvalidArgument("code region overflows".to_string()))?;
        let space = AddressSpace::new(&config)?;

        let code_segment =
            segments.create_segment(config.base_address, code_end, SegmentAccess::code())?;
        let data_segment = match segments.create_segment(
            config.base_address,
            config.memory_size,
            SegmentAccess::data(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(undo) = segments.destroy_segment(code_segment) {
                    warn!(error = %undo, "failed to release code segment");
                }
                return Err(e);
            }
        };

        info!(
            id = %config.id,
            base = format_args!("{:#x}", config.base_address),
            memory = format_args!("{:#x}", config.memory_size),
            code_start = format_args!("{:#x}", config.code_region.start),
            code_end = format_args!("{code_end:#x}"),
            "sandbox created"
        );
        Ok(Self {
            config,
            segments,
            code_segment,
            data_segment,
            space: PortRwLock::new(space),
            validator,
            terminated: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> uuid::Uuid {
        self.config.id
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn code_segment(&self) -> SegmentHandle {
        self.code_segment
    }

    pub fn data_segment(&self) -> SegmentHandle {
        self.data_segment
    }

    pub fn segments(&self) -> &Arc<SegmentManager<L>> {
        &self.segments
    }

    pub fn memory_size(&self) -> u64 {
        self.config.memory_size
    }

    /// Snapshot of the code region occupancy.
    pub fn code_region(&self) -> Result<CodeRegion> {
        self.ensure_live()?;
        Ok(self.space.read().code().clone())
    }

    /// Copy `len` bytes out of sandbox memory.
    ///
    /// Takes the shared side of the code region lock, so it observes either
    /// the state before or after any in-flight code mutation.
    pub fn read_memory(&self, addr: u64, len: u64) -> Result<Vec<u8>> {
        self.ensure_live()?;
        let space = self.space.read();
        Ok(space.bytes(addr, len)?.to_vec())
    }

    /// Store `data` into sandbox memory. The code region bookkeeping is not
    /// consulted: this is the trusted path used by loaders and the debugger.
    pub fn write_memory(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.ensure_live()?;
        let mut space = self.space.write();
        space.bytes_mut(addr, data.len() as u64)?.copy_from_slice(data);
        Ok(())
    }

    /// Replace the byte at `addr`, returning the previous value.
    pub fn swap_byte(&self, addr: u64, byte: u8) -> Result<u8> {
        self.ensure_live()?;
        let mut space = self.space.write();
        let slot = space
            .bytes_mut(addr, 1)?
            .first_mut()
            .ok_or(SandboxError::AccessDenied { addr, len: 1 })?;
        Ok(std::mem::replace(slot, byte))
    }

    /// Store `byte` at `addr` only if it still holds `current`. Returns the
    /// byte found there, so the store happened iff the result equals `current`.
    pub fn compare_swap_byte(&self, addr: u64, current: u8, byte: u8) -> Result<u8> {
        self.ensure_live()?;
        let mut space = self.space.write();
        let slot = space
            .bytes_mut(addr, 1)?
            .first_mut()
            .ok_or(SandboxError::AccessDenied { addr, len: 1 })?;
        let found = *slot;
        if found == current {
            *slot = byte;
        }
        Ok(found)
    }

    /// Stop the instance. Every later operation fails with `Terminated`.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            info!(id = %self.config.id, "sandbox terminated");
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(SandboxError::Terminated);
        }
        Ok(())
    }

    /// Re-read both segment descriptors. Corruption terminates the instance.
    pub fn check_segments(&self) -> Result<()> {
        self.ensure_live()?;
        for handle in [self.code_segment, self.data_segment] {
            if let Err(e) = self.segments.verify(handle) {
                if e.is_fatal() {
                    error!(id = %self.config.id, error = %e, "segment check failed");
                    self.terminate();
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

impl<L: LockKind> Drop for Sandbox<L> {
    fn drop(&mut self) {
        for handle in [self.code_segment, self.data_segment] {
            if let Err(e) = self.segments.destroy_segment(handle) {
                warn!(
                    id = %self.config.id,
                    slot = handle.index(),
                    error = %e,
                    "failed to release segment"
                );
            }
        }
    }
}
