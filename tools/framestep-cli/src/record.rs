//! Record command - build, boot and capture one frame per clock step
//!
//! Orchestrates: build → session lock → driver params → boot → capture loop.
//! With `--attach` the emulator is expected to be running already (booted
//! with `framestep boot`, or by hand with the clock shim preloaded).

use anyhow::{Context, Result};
use clap::Args;
use framestep_core::{
    CancelToken, CaptureLoop, CaptureOptions, ControlChannel, NotificationListener,
    RecorderConfig, Session, SignalClock, StepConfirmations, TimeStepSignaler, WaitPolicy,
};
use std::path::{Path, PathBuf};

use crate::boot;
use crate::build::{self, ScriptBuild};
use crate::operator::TerminalOperator;
use crate::project::ProjectArgs;

/// Arguments for the record command
#[derive(Args, Debug)]
pub struct RecordArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    /// Capture directory (overrides [capture] directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Stop after this many frames instead of waiting for Ctrl-C
    #[arg(short = 'n', long)]
    pub frames: Option<u64>,

    /// Don't rebuild before recording
    #[arg(long)]
    pub no_build: bool,

    /// Record from an emulator that is already running
    #[arg(long)]
    pub attach: bool,

    /// Start recording without waiting for enter
    #[arg(short, long)]
    pub yes: bool,

    /// Leave the emulator clock frozen after recording
    #[arg(long)]
    pub keep_frozen: bool,
}

impl RecordArgs {
    /// Fold command-line overrides into the loaded config.
    fn apply(&self, config: &mut RecorderConfig) {
        if let Some(output) = &self.output {
            config.capture.directory = output.clone();
        }
        if self.frames.is_some() {
            config.capture.frame_limit = self.frames;
        }
        if self.keep_frozen {
            config.capture.release_clock_on_finish = false;
        }
        if self.yes {
            config.capture.prompt = false;
        }
    }
}

/// Execute the record command
pub fn execute(args: RecordArgs) -> Result<()> {
    let project_dir = args.project.dir()?;
    let mut config = args.project.load_config(&project_dir)?;
    args.apply(&mut config);

    let capture_dir = resolve(&project_dir, &config.capture.directory);

    if !args.no_build && !args.attach {
        build::run_configured(&ScriptBuild, &config, &project_dir)?;
    }

    // Claim the emulator before touching anything another session might use
    let mut session = Session::begin(
        &config.emulator.control_socket,
        &capture_dir,
        &config.emulator.pid_file,
    )?;

    config
        .timing
        .driver_params()
        .write_to(&config.emulator.driver_params)
        .with_context(|| {
            format!(
                "Failed to write driver parameters: {}",
                config.emulator.driver_params.display()
            )
        })?;

    if args.attach || config.emulator.command.is_empty() {
        tracing::info!("Attaching to running emulator");
    } else {
        let child = boot::boot_emulator(&config.emulator, &config.timing, &project_dir)?;
        tracing::info!("Emulator booted (pid {})", child.id());
    }

    session.prepare()?;
    let emulator = session.locate_emulator()?;
    tracing::info!("Recording emulator {}", emulator);

    let (notifier, confirmations) = StepConfirmations::channel();
    let _listener = NotificationListener::install(notifier)?;

    let policy = WaitPolicy {
        timeout: config.timing.step_timeout(),
        poll_interval: config.timing.poll_interval(),
    };
    let resumed_frozen = session.clock_frozen();
    if resumed_frozen {
        tracing::info!("Emulator clock was left frozen by an earlier session");
    }
    let signaler = TimeStepSignaler::new(SignalClock::new(emulator), confirmations, policy)
        .assume_frozen(resumed_frozen);
    let channel = ControlChannel::connect(
        &config.emulator.control_socket,
        config.timing.ack_timeout(),
    )?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("Failed to install Ctrl-C handler")?;

    let options = CaptureOptions {
        capture_dir: capture_dir.clone(),
        frame_limit: config.capture.frame_limit,
        release_clock_on_finish: config.capture.release_clock_on_finish,
    };

    let mut operator = TerminalOperator::new(config.capture.prompt);
    let result =
        CaptureLoop::new(signaler, channel, options).run(&mut session, &mut operator, &cancel);
    operator.finish();

    let report = result.with_context(|| {
        format!("Recording failed; completed frames are in {}", capture_dir.display())
    })?;

    println!("Recorded {} frames", report.frames);
    if let Some(last) = report.last_index() {
        println!("  Frames: 0 .. {} in {}", last, capture_dir.display());
    }
    Ok(())
}

fn resolve(project_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    }
}
