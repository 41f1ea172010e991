use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::Args;
use debug_stub::sim::{LinearExecutor, RunOutcome};
use debug_stub::{DebugStub, HaltChannel, Resume, StubConfig, Target};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config;
use crate::error::{RunnerError, RunnerResult};
use crate::host;

#[derive(Args)]
pub struct DebugArgs {
    /// Path to sandbox.yaml config file
    #[arg(long, short)]
    config: PathBuf,
    /// Program image, overriding the config file
    #[arg(long)]
    image: Option<PathBuf>,
    /// Debugger listen address, overriding the config file
    #[arg(long, env = "SANDBOX_DEBUG_LISTEN")]
    listen: Option<String>,
}

/// Load the program, halt it at its entry point and serve debuggers until
/// it exits, is killed, or the runner is interrupted.
pub async fn run_debug(args: DebugArgs) -> RunnerResult<()> {
    let mut runner_config = config::load(&args.config).await?;
    if let Some(image) = args.image {
        runner_config.image = Some(image);
    }
    if let Some(listen) = args.listen {
        runner_config.debug.listen = listen;
    }
    let addr = runner_config.debug.listen_addr()?;
    let stub_config = StubConfig {
        recv_timeout: runner_config.debug.recv_timeout(),
        ..StubConfig::default()
    };

    let sandbox = host::build_sandbox(
        runner_config.sandbox,
        runner_config.segment_backend,
        runner_config.image.as_deref(),
    )
    .await?;
    let entry = host::entry_registers(&sandbox)?;
    let entry_pc = entry.rip();
    let target: Arc<dyn Target> = sandbox.clone();
    let halts: Arc<HaltChannel> = Arc::new(HaltChannel::new());
    let stub = Arc::new(DebugStub::new(target.clone(), halts.clone(), stub_config));

    let (done_tx, mut done_rx) = oneshot::channel();
    let executor = LinearExecutor::new(target, halts.clone());
    thread::Builder::new()
        .name("sandbox-main".to_string())
        .spawn(move || {
            let _ = done_tx.send(executor.run(entry));
        })
        .map_err(|e| RunnerError::Internal(format!("spawn program thread: {e}")))?;

    let listener = TcpListener::bind(addr).await?;
    info!(
        addr = %listener.local_addr()?,
        entry = format_args!("{entry_pc:#x}"),
        "waiting for debugger"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                info!(%peer, "debugger connected");
                if let Err(e) = spawn_session(&stub, stream) {
                    error!(%peer, error = %e, "failed to start session");
                }
            }
            outcome = &mut done_rx => {
                match outcome {
                    Ok(RunOutcome::Exited(status)) => info!(status, "program exited"),
                    Ok(RunOutcome::Killed) => info!("program killed by debugger"),
                    Err(_) => error!("program thread ended without an outcome"),
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, killing program");
                if !halts.resume(Resume::Kill) {
                    warn!("program was not halted; leaving it to finish");
                }
                break;
            }
        }
    }
    Ok(())
}

/// Serve one debugger on its own thread. A second debugger connecting while
/// a session is active is turned away by the stub.
fn spawn_session(stub: &Arc<DebugStub>, stream: tokio::net::TcpStream) -> RunnerResult<()> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    let stub = stub.clone();
    thread::Builder::new()
        .name("debug-session".to_string())
        .spawn(move || match stub.serve(stream) {
            Ok(end) => info!(?end, "session finished"),
            Err(e) => warn!(error = %e, "session refused"),
        })
        .map_err(|e| RunnerError::Internal(format!("spawn session thread: {e}")))?;
    Ok(())
}
