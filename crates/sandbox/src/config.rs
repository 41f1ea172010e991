use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

pub(crate) const DEFAULT_BASE_ADDRESS: u64 = 0x1000_0000;
pub(crate) const DEFAULT_MEMORY_SIZE: u64 = 16 * 1024 * 1024;
pub(crate) const DEFAULT_CODE_START: u64 = 0x8_0000;
pub(crate) const DEFAULT_BUNDLE_SIZE: u64 = 32;

/// A selector has 13 index bits.
pub const MAX_DESCRIPTOR_SLOTS: u32 = 1 << 13;

/// Descriptors are 32-bit: every segment must end at or below 4 GiB.
pub(crate) const DESCRIPTOR_ADDRESS_LIMIT: u64 = 1 << 32;

/// Descriptor table limits of the build target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Table size, including the reserved slots.
    pub max_descriptor_slots: u32,
    /// Segment bases and sizes must be multiples of this.
    pub descriptor_granularity: u64,
    /// Low slots never handed out, in addition to slot 0.
    pub reserved_slots: u32,
}

impl PlatformConfig {
    pub const fn for_target() -> Self {
        if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
            // LDT_ENTRIES; limits are programmed in 4 KiB pages.
            Self {
                max_descriptor_slots: 8192,
                descriptor_granularity: 4096,
                reserved_slots: 0,
            }
        } else {
            // No hardware table: a software table bounds the slot count.
            Self {
                max_descriptor_slots: 1024,
                descriptor_granularity: 4096,
                reserved_slots: 0,
            }
        }
    }

    /// Slots that can actually be allocated.
    pub fn usable_slots(&self) -> u32 {
        self.max_descriptor_slots
            .saturating_sub(1)
            .saturating_sub(self.reserved_slots)
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self::for_target()
    }
}

/// Sub-range of sandbox memory eligible for dynamically loaded code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeRegionConfig {
    pub start: u64,
    pub size: u64,
}

impl CodeRegionConfig {
    pub fn end(&self) -> Option<u64> {
        self.start.checked_add(self.size)
    }
}

impl Default for CodeRegionConfig {
    fn default() -> Self {
        Self {
            start: DEFAULT_CODE_START,
            size: DEFAULT_MEMORY_SIZE - DEFAULT_CODE_START,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynCodeConfig {
    /// When false, `modify` and `delete` are refused.
    pub allow_replacement: bool,
}

impl Default for DynCodeConfig {
    fn default() -> Self {
        Self {
            allow_replacement: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub id: uuid::Uuid,
    /// Linear address of sandbox address 0.
    pub base_address: u64,
    pub memory_size: u64,
    pub code_region: CodeRegionConfig,
    /// Instruction bundle size required by the validator.
    pub bundle_size: u64,
    pub dyncode: DynCodeConfig,
    pub platform: PlatformConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            base_address: DEFAULT_BASE_ADDRESS,
            memory_size: DEFAULT_MEMORY_SIZE,
            code_region: CodeRegionConfig::default(),
            bundle_size: DEFAULT_BUNDLE_SIZE,
            dyncode: DynCodeConfig::default(),
            platform: PlatformConfig::default(),
        }
    }
}

fn invalid(msg: String) -> SandboxError {
    SandboxError::InvalidArgument(msg)
}

impl SandboxConfig {
    /// Check that the layout can be expressed with segment descriptors.
    pub fn validate(&self) -> Result<()> {
        let gran = self.platform.descriptor_granularity;
        if gran == 0 || !gran.is_power_of_two() {
            return Err(invalid(format!("descriptor granularity {gran} is not a power of two")));
        }
        if self.bundle_size == 0 || !self.bundle_size.is_power_of_two() {
            return Err(invalid(format!("bundle size {} is not a power of two", self.bundle_size)));
        }
        let slots = self.platform.max_descriptor_slots;
        if slots > MAX_DESCRIPTOR_SLOTS || self.platform.usable_slots() == 0 {
            return Err(invalid(format!(
                "{slots} descriptor slots with {} reserved leave no selectable slot \
                 (at most {MAX_DESCRIPTOR_SLOTS})",
                self.platform.reserved_slots
            )));
        }
        if self.memory_size == 0 || self.memory_size % gran != 0 {
            return Err(invalid(format!(
                "memory size {:#x} is not a non-zero multiple of {gran:#x}",
                self.memory_size
            )));
        }
        if self.base_address % gran != 0 {
            return Err(invalid(format!(
                "base address {:#x} is not aligned to {gran:#x}",
                self.base_address
            )));
        }
        match self.base_address.checked_add(self.memory_size) {
            Some(end) if end <= DESCRIPTOR_ADDRESS_LIMIT => {}
            _ => {
                return Err(invalid(format!(
                    "sandbox {:#x}+{:#x} exceeds the 32-bit descriptor space",
                    self.base_address, self.memory_size
                )));
            }
        }

        let region = &self.code_region;
        let Some(code_end) = region.end() else {
            return Err(invalid("code region overflows".to_string()));
        };
        if region.size == 0 || code_end > self.memory_size {
            return Err(invalid(format!(
                "code region {:#x}+{:#x} is empty or outside sandbox memory",
                region.start, region.size
            )));
        }
        if region.start % self.bundle_size != 0 || region.size % self.bundle_size != 0 {
            return Err(invalid(format!(
                "code region {:#x}+{:#x} is not bundle aligned",
                region.start, region.size
            )));
        }
        // The code segment limit is the end of the code region.
        if code_end % gran != 0 {
            return Err(invalid(format!(
                "code region end {code_end:#x} is not aligned to {gran:#x}"
            )));
        }
        if usize::try_from(self.memory_size).is_err() {
            return Err(invalid("memory size does not fit the host".to_string()));
        }
        Ok(())
    }
}
