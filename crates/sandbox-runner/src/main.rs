mod cmd;
mod config;
mod error;
mod host;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use sandbox_port::log::{self, Level};

#[derive(Parser)]
#[command(name = "sandbox-runner", version)]
struct Cli {
    /// Log debug-level events
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a config, build the sandbox and print its layout
    Check(cmd::CheckArgs),
    /// Load a program halted at its entry point and serve a remote debugger
    Debug(cmd::DebugArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    log::init(if cli.verbose { Level::DEBUG } else { Level::INFO });

    let result = match cli.command {
        Command::Check(args) => cmd::run_check(args).await,
        Command::Debug(args) => cmd::run_debug(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
