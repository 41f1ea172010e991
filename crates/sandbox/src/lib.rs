//! Sandbox core: segment descriptors bounding untrusted code, the sandbox
//! address space and the dynamic code loader.

mod config;
pub mod dyncode;
mod error;
pub mod publish;
mod region;
mod sandbox;
pub mod segment;
mod validator;

pub use config::{
    CodeRegionConfig, DynCodeConfig, MAX_DESCRIPTOR_SLOTS, PlatformConfig, SandboxConfig,
};
pub use error::{Result, SandboxError};
pub use publish::HALT_OPCODE;
pub use region::{AddressSpace, CodeRegion};
pub use sandbox::Sandbox;
pub use segment::{
    DescriptorTable, SegmentAccess, SegmentDescriptor, SegmentHandle, SegmentKind,
    SegmentManager, SoftwareTable,
};
#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
pub use segment::LinuxLdt;
pub use validator::{AcceptAll, BundleValidator, CodeValidator, Rejection};
