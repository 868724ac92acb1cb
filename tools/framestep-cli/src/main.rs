//! framestep - frame-accurate screen recording from a steppable emulator
//!
//! # Commands
//!
//! - `framestep init` - Write a default framestep.toml
//! - `framestep boot` - Build (optional) and boot the emulator with the clock shim
//! - `framestep record` - Build, boot and record one frame per clock step
//!
//! # Usage
//!
//! ```bash
//! # Record until Ctrl-C
//! framestep record
//!
//! # Record exactly 300 frames from an emulator that is already running
//! framestep record --attach --frames 300 --yes
//! ```
//!
//! Frames land in the capture directory as `0`, `1`, `2`, ... in the format
//! the emulator's frame dump produces.
//!
//! # Exit codes
//!
//! `0` clean finish, `2` connection error, `3` transport error, `4` emulator
//! not found, `5` protocol violation, `6` session already active, `1` other.

mod boot;
mod build;
mod init;
mod operator;
mod project;
mod record;

use anyhow::Result;
use clap::{Parser, Subcommand};
use framestep_core::RecorderError;
use std::process::ExitCode;

/// framestep - frame-accurate emulator screen recording
#[derive(Parser)]
#[command(name = "framestep")]
#[command(about = "Frame-accurate screen recording from a steppable emulator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default framestep.toml
    Init(init::InitArgs),

    /// Build the app and boot the emulator with the clock shim injected
    Boot(boot::BootArgs),

    /// Record one frame per clock step until interrupted
    Record(record::RecordArgs),
}

fn main() -> ExitCode {
    // Initialize logging. Stdout carries the frame counter and results.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init(args) => init::execute(args),
        Commands::Boot(args) => boot::execute(args),
        Commands::Record(args) => record::execute(args),
    }
}

/// Map an error chain to the documented exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<RecorderError>()
        .map(RecorderError::exit_code)
        .unwrap_or(1)
}
