#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("descriptor table full ({capacity} slots)")]
    ResourceExhausted { capacity: u32 },

    #[error("invalid segment handle (slot {0})")]
    InvalidHandle(u32),

    #[error("range {addr:#x}+{len:#x} overlaps loaded code")]
    RangeOccupied { addr: u64, len: u64 },

    #[error("range {addr:#x}+{len:#x} is outside the code region")]
    OutOfBounds { addr: u64, len: u64 },

    #[error("range {addr:#x}+{len:#x} is not aligned to {bundle}-byte bundles")]
    AlignmentViolation { addr: u64, len: u64, bundle: u64 },

    #[error("code validation failed: {0}")]
    ValidationFailed(String),

    #[error("range {addr:#x}+{len:#x} is not a loaded block of the same size")]
    InvalidModification { addr: u64, len: u64 },

    #[error("range {addr:#x}+{len:#x} does not match a loaded block")]
    InvalidRange { addr: u64, len: u64 },

    #[error("code replacement is disabled")]
    ReplacementDisabled,

    #[error("access denied: {addr:#x}+{len:#x} is outside sandbox memory")]
    AccessDenied { addr: u64, len: u64 },

    #[error("descriptor table corrupted at slot {0}")]
    TableCorrupted(u32),

    #[error("sandbox terminated")]
    Terminated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Negative errno reported to untrusted code through the syscall surface.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::InvalidArgument(_)
            | Self::RangeOccupied { .. }
            | Self::OutOfBounds { .. }
            | Self::AlignmentViolation { .. }
            | Self::ValidationFailed(_)
            | Self::InvalidModification { .. }
            | Self::InvalidRange { .. }
            | Self::ReplacementDisabled => libc::EINVAL,
            Self::ResourceExhausted { .. } => libc::ENOMEM,
            Self::InvalidHandle(_) => libc::EBADF,
            Self::AccessDenied { .. } => libc::EACCES,
            Self::TableCorrupted(_) | Self::Terminated => libc::EFAULT,
            Self::Io(_) => libc::EIO,
        };
        -code
    }

    /// Errors after which the sandbox instance can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TableCorrupted(_))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
