//! Segment Descriptor Table Manager.
//!
//! Owns every descriptor slot of a [`DescriptorTable`]. Slot 0 and the
//! platform-reserved low slots are never handed out. A [`SegmentHandle`]
//! carries the slot's generation, so a handle goes stale once its segment is
//! destroyed and every later use fails with `InvalidHandle`.

mod descriptor;
#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
mod ldt;
mod table;

use std::sync::Arc;

use sandbox_port::{Blocking, LockKind, PortMutex};
use tracing::{error, info};

pub use descriptor::{SegmentAccess, SegmentDescriptor, SegmentKind};
#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
pub use ldt::LinuxLdt;
pub use table::{DescriptorTable, SoftwareTable};

use crate::config::{MAX_DESCRIPTOR_SLOTS, PlatformConfig};
use crate::error::{Result, SandboxError};

/// Table indicator bit of a selector: the entry lives in the LDT.
const SELECTOR_TI_LDT: u16 = 0b100;
const SELECTOR_RPL_USER: u16 = 0b11;
const SELECTOR_INDEX_MASK: u32 = MAX_DESCRIPTOR_SLOTS - 1;

/// Reference to an installed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentHandle {
    index: u32,
    generation: u32,
}

impl SegmentHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// LDT selector with user RPL, as loaded into a segment register.
    pub fn selector(&self) -> u16 {
        // Managers never hand out an index above the mask.
        (((self.index & SELECTOR_INDEX_MASK) as u16) << 3) | SELECTOR_TI_LDT | SELECTOR_RPL_USER
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    /// Installed descriptor and the exact word written for it.
    installed: Option<(SegmentDescriptor, u64)>,
}

struct Slots {
    slots: Vec<Slot>,
    live: u32,
}

pub struct SegmentManager<L: LockKind = Blocking> {
    platform: PlatformConfig,
    table: Arc<dyn DescriptorTable>,
    first_usable: usize,
    slots: L::Mutex<Slots>,
}

impl<L: LockKind> SegmentManager<L> {
    /// Manage `table`, bounded by the smallest of its capacity, the
    /// platform's slot count and what a selector can address.
    pub fn new(platform: PlatformConfig, table: Arc<dyn DescriptorTable>) -> Self {
        let capacity = platform
            .max_descriptor_slots
            .min(table.capacity())
            .min(MAX_DESCRIPTOR_SLOTS);
        let slots = (0..capacity).map(|_| Slot::default()).collect();
        Self {
            first_usable: 1 + platform.reserved_slots as usize,
            platform,
            table,
            slots: PortMutex::new(Slots { slots, live: 0 }),
        }
    }

    /// In-process table sized for the platform.
    pub fn with_software_table(platform: PlatformConfig) -> Self {
        let table = Arc::new(SoftwareTable::new(platform.max_descriptor_slots));
        Self::new(platform, table)
    }

    pub fn platform(&self) -> &PlatformConfig {
        &self.platform
    }

    /// Total slots, reserved ones included.
    pub fn capacity(&self) -> u32 {
        self.slots.lock().slots.len() as u32
    }

    pub fn live_count(&self) -> u32 {
        self.slots.lock().live
    }

    /// Install a descriptor for `[base, base + size)`.
    pub fn create_segment(
        &self,
        base: u64,
        size: u64,
        access: SegmentAccess,
    ) -> Result<SegmentHandle> {
        let gran = self.platform.descriptor_granularity;
        if size == 0 {
            return Err(SandboxError::InvalidArgument(
                "segment size is zero".to_string(),
            ));
        }
        if gran == 0 || size % gran != 0 || base % gran != 0 {
            return Err(SandboxError::InvalidArgument(format!(
                "segment {base:#x}+{size:#x} is not aligned to {gran:#x}"
            )));
        }
        let descriptor = SegmentDescriptor { base, size, access };
        let word = descriptor.encode()?;

        let mut guard = self.slots.lock();
        let state = &mut *guard;
        let capacity = state.slots.len() as u32;
        let (index, slot) = state
            .slots
            .iter_mut()
            .enumerate()
            .skip(self.first_usable)
            .find(|(_, s)| s.installed.is_none())
            .ok_or(SandboxError::ResourceExhausted { capacity })?;
        let index = index as u32;

        self.table.install(index, word)?;
        slot.installed = Some((descriptor, word));
        let generation = slot.generation;
        state.live += 1;

        info!(
            slot = index,
            base = format_args!("{base:#x}"),
            size = format_args!("{size:#x}"),
            kind = ?access.kind,
            "segment installed"
        );
        Ok(SegmentHandle { index, generation })
    }

    /// Clear the descriptor and free its slot.
    pub fn destroy_segment(&self, handle: SegmentHandle) -> Result<()> {
        let mut guard = self.slots.lock();
        let state = &mut *guard;
        let slot = Self::live_slot(&mut state.slots, handle)?;
        if let Some((_, word)) = slot.installed {
            self.check_entry(handle.index, word)?;
        }
        self.table.clear(handle.index)?;
        slot.installed = None;
        slot.generation = slot.generation.wrapping_add(1);
        state.live = state.live.saturating_sub(1);
        info!(slot = handle.index, "segment destroyed");
        Ok(())
    }

    /// The descriptor currently installed for `handle`, read back from the table.
    pub fn descriptor(&self, handle: SegmentHandle) -> Result<SegmentDescriptor> {
        let mut guard = self.slots.lock();
        let slot = Self::live_slot(&mut guard.slots, handle)?;
        match slot.installed {
            Some((descriptor, word)) => {
                self.check_entry(handle.index, word)?;
                Ok(descriptor)
            }
            None => Err(SandboxError::InvalidHandle(handle.index)),
        }
    }

    /// Check that the table still holds exactly what was installed.
    pub fn verify(&self, handle: SegmentHandle) -> Result<()> {
        self.descriptor(handle).map(|_| ())
    }

    fn live_slot(slots: &mut [Slot], handle: SegmentHandle) -> Result<&mut Slot> {
        match slots.get_mut(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation && slot.installed.is_some() => {
                Ok(slot)
            }
            _ => Err(SandboxError::InvalidHandle(handle.index)),
        }
    }

    fn check_entry(&self, index: u32, expected: u64) -> Result<()> {
        let found = self.table.read(index)?;
        if found != expected {
            error!(
                slot = index,
                expected = format_args!("{expected:#018x}"),
                found = format_args!("{found:#018x}"),
                "descriptor table corrupted"
            );
            return Err(SandboxError::TableCorrupted(index));
        }
        Ok(())
    }
}
