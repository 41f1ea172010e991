use std::path::PathBuf;

use clap::Args;
use sandbox::Sandbox;
use tracing::info;

use crate::config;
use crate::error::RunnerResult;
use crate::host;

#[derive(Args)]
pub struct CheckArgs {
    /// Path to sandbox.yaml config file
    #[arg(long, short)]
    config: PathBuf,
}

/// Build the configured sandbox, print its layout and tear it down again.
pub async fn run_check(args: CheckArgs) -> RunnerResult<()> {
    let runner_config = config::load(&args.config).await?;
    let sandbox = host::build_sandbox(
        runner_config.sandbox,
        runner_config.segment_backend,
        runner_config.image.as_deref(),
    )
    .await?;
    sandbox.check_segments()?;
    print!("{}", describe(&sandbox)?);
    info!(id = %sandbox.id(), "layout ok");
    Ok(())
}

fn describe(sandbox: &Sandbox) -> RunnerResult<String> {
    let config = sandbox.config();
    let region = sandbox.code_region()?;
    let mut out = String::new();
    out.push_str(&format!("id:           {}\n", config.id));
    out.push_str(&format!("base:         {:#x}\n", config.base_address));
    out.push_str(&format!("memory:       {:#x}\n", config.memory_size));
    out.push_str(&format!(
        "code region:  {:#x}..{:#x} ({:#x} used)\n",
        region.start(),
        region.end(),
        region.used_bytes()
    ));
    out.push_str(&format!("bundle:       {}\n", config.bundle_size));
    out.push_str(&format!(
        "code segment: selector {:#06x}\n",
        sandbox.code_segment().selector()
    ));
    out.push_str(&format!(
        "data segment: selector {:#06x}\n",
        sandbox.data_segment().selector()
    ));
    out.push_str(&format!(
        "descriptors:  {}/{} in use\n",
        sandbox.segments().live_count(),
        sandbox.segments().capacity()
    ));
    for (start, len) in region.blocks() {
        out.push_str(&format!("  block {start:#x}+{len:#x}\n"));
    }
    Ok(out)
}
