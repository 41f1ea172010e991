use std::path::Path;
use std::sync::Arc;

use debug_stub::Registers;
use debug_stub::abi::{CS, DS, EFLAGS, ES, RSP, SS};
use sandbox::{BundleValidator, HALT_OPCODE, Sandbox, SandboxConfig, SegmentManager};
use tracing::info;

use crate::config::SegmentBackend;
use crate::error::{RunnerError, RunnerResult};

/// Reserved bit 1 plus the interrupt flag.
const ENTRY_EFLAGS: u64 = 0x202;

pub fn segment_manager(
    backend: SegmentBackend,
    config: &SandboxConfig,
) -> RunnerResult<Arc<SegmentManager>> {
    match backend {
        SegmentBackend::Software => Ok(Arc::new(SegmentManager::with_software_table(
            config.platform.clone(),
        ))),
        SegmentBackend::Ldt => ldt_manager(config),
    }
}

#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
fn ldt_manager(config: &SandboxConfig) -> RunnerResult<Arc<SegmentManager>> {
    Ok(Arc::new(SegmentManager::new(
        config.platform.clone(),
        Arc::new(sandbox::LinuxLdt),
    )))
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64"))))]
fn ldt_manager(_config: &SandboxConfig) -> RunnerResult<Arc<SegmentManager>> {
    Err(RunnerError::Config(
        "segment_backend ldt is only available on Linux x86".to_string(),
    ))
}

/// Create a sandbox and load `image` (if any) at the start of its code region.
pub async fn build_sandbox(
    config: SandboxConfig,
    backend: SegmentBackend,
    image: Option<&Path>,
) -> RunnerResult<Arc<Sandbox>> {
    let segments = segment_manager(backend, &config)?;
    let sandbox = Arc::new(Sandbox::create(config, segments, Box::new(BundleValidator))?);
    if let Some(path) = image {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| RunnerError::Config(format!("read image {}: {e}", path.display())))?;
        load_image(&sandbox, &bytes)?;
        info!(image = %path.display(), len = bytes.len(), "image loaded");
    }
    Ok(sandbox)
}

/// Pad `image` with `HLT` to a whole number of bundles and publish it at the
/// start of the code region.
pub fn load_image(sandbox: &Sandbox, image: &[u8]) -> RunnerResult<u64> {
    let bundle = usize::try_from(sandbox.config().bundle_size)
        .map_err(|_| RunnerError::Internal("bundle size does not fit the host".to_string()))?;
    let mut code = image.to_vec();
    let padded = code.len().div_ceil(bundle) * bundle;
    code.resize(padded, HALT_OPCODE);

    let start = sandbox.config().code_region.start;
    sandbox.dyncode_create(start, &code)?;
    Ok(start)
}

/// Register state the program starts with: at the start of the code region,
/// with the stack at the top of sandbox memory.
pub fn entry_registers(sandbox: &Sandbox) -> RunnerResult<Registers> {
    let mut regs = Registers::default();
    regs.set_rip(sandbox.config().code_region.start);
    let code = u64::from(sandbox.code_segment().selector());
    let data = u64::from(sandbox.data_segment().selector());
    let all_set = [
        (RSP, sandbox.memory_size()),
        (EFLAGS, ENTRY_EFLAGS),
        (CS, code),
        (SS, data),
        (DS, data),
        (ES, data),
    ]
    .into_iter()
    .all(|(index, value)| regs.set(index, value));
    if !all_set {
        return Err(RunnerError::Internal(
            "entry register index out of range".to_string(),
        ));
    }
    Ok(regs)
}
