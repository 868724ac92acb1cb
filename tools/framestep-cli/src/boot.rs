//! Boot command - start the emulator with the clock shim injected
//!
//! The emulator command comes from `[emulator] command` in framestep.toml.
//! `{control_socket}` and `{pid_file}` in its arguments are replaced with the
//! configured paths, and the shim is loaded through the dynamic linker's
//! preload variable so every clock read in the emulator goes through it.

use anyhow::{Context, Result};
use clap::Args;
use framestep_core::config::{EmulatorConfig, TimingConfig};
use framestep_core::session::clock_marker_path;
use framestep_shared::{ENV_DRIVER_PARAMS, ENV_TIMESTEP, ENV_TIMESTEP_IDLE};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use crate::build::{self, ScriptBuild};
use crate::project::ProjectArgs;

/// Interval between checks for the control socket while booting.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Arguments for the boot command
#[derive(Args, Debug)]
pub struct BootArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    /// Don't rebuild, boot with the existing artifact
    #[arg(long)]
    pub no_build: bool,
}

/// Execute the boot command
pub fn execute(args: BootArgs) -> Result<()> {
    let project_dir = args.project.dir()?;
    let config = args.project.load_config(&project_dir)?;

    if !args.no_build {
        build::run_configured(&ScriptBuild, &config, &project_dir)?;
    }

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

    let child = boot_emulator(&config.emulator, &config.timing, &project_dir)?;
    println!("Emulator booted (pid {})", child.id());
    println!("  Control socket: {}", config.emulator.control_socket.display());
    Ok(())
}

/// Start the emulator and wait for its control socket to appear.
///
/// The emulator runs in its own process group so a Ctrl-C aimed at the
/// recorder does not also kill it.
pub fn boot_emulator(
    emulator: &EmulatorConfig,
    timing: &TimingConfig,
    project_dir: &Path,
) -> Result<Child> {
    let Some((program, program_args)) = emulator.command.split_first() else {
        anyhow::bail!("No emulator command configured ([emulator] command is empty)");
    };

    let program = which::which(program)
        .with_context(|| format!("Emulator executable not found: {}", program))?;
    let preload = find_preload(emulator)?;

    // Leftovers from an earlier emulator would describe a process that is gone:
    // its socket looks like a booted one, its pid may since belong to anything,
    // and a fresh emulator's clock starts out running.
    remove_stale(&emulator.control_socket, "control socket")?;
    remove_stale(&emulator.pid_file, "pid file")?;
    remove_stale(&clock_marker_path(&emulator.control_socket), "clock marker")?;

    tracing::info!("Booting emulator: {}", program.display());
    tracing::debug!("Clock shim: {}", preload.display());

    let mut command = Command::new(&program);
    command
        .args(substitute_args(program_args, emulator))
        .current_dir(project_dir)
        .envs(shim_env(&preload, timing, &emulator.driver_params))
        .process_group(0);

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to launch emulator: {}", program.display()))?;

    wait_for_socket(&mut child, &emulator.control_socket, emulator.boot_timeout())?;

    if !emulator.pid_file.exists() {
        tracing::debug!(
            "Emulator did not write {}, recording launcher pid {}",
            emulator.pid_file.display(),
            child.id()
        );
        std::fs::write(&emulator.pid_file, child.id().to_string()).with_context(|| {
            format!("Failed to write pid file: {}", emulator.pid_file.display())
        })?;
    }

    Ok(child)
}

fn remove_stale(path: &Path, what: &str) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("Removed stale {}: {}", what, path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e)
            .with_context(|| format!("Failed to remove stale {}: {}", what, path.display())),
    }
}

/// Replace path placeholders in the emulator arguments.
fn substitute_args(args: &[String], emulator: &EmulatorConfig) -> Vec<String> {
    let socket = emulator.control_socket.display().to_string();
    let pid_file = emulator.pid_file.display().to_string();
    args.iter()
        .map(|arg| {
            arg.replace("{control_socket}", &socket)
                .replace("{pid_file}", &pid_file)
        })
        .collect()
}

/// Environment that loads the clock shim and hands it its parameters.
fn shim_env(preload: &Path, timing: &TimingConfig, driver_params: &Path) -> Vec<(String, String)> {
    let preload = preload.display().to_string();
    vec![
        ("LD_PRELOAD".to_string(), preload.clone()),
        ("DYLD_INSERT_LIBRARIES".to_string(), preload),
        ("DYLD_FORCE_FLAT_NAMESPACE".to_string(), "1".to_string()),
        (ENV_TIMESTEP.to_string(), timing.frame_interval_ns.to_string()),
        (ENV_TIMESTEP_IDLE.to_string(), timing.idle_ns.to_string()),
        (
            ENV_DRIVER_PARAMS.to_string(),
            driver_params.display().to_string(),
        ),
    ]
}

/// Locate the clock shim library.
///
/// Uses `[emulator] preload` when set, otherwise looks next to the framestep
/// executable where cargo puts the built shim.
fn find_preload(emulator: &EmulatorConfig) -> Result<PathBuf> {
    if let Some(path) = &emulator.preload {
        if !path.exists() {
            anyhow::bail!("Clock shim not found: {}", path.display());
        }
        return Ok(path.clone());
    }

    let exe = std::env::current_exe().context("Failed to locate framestep executable")?;
    let dir = exe
        .parent()
        .context("framestep executable has no parent directory")?;
    let candidate = dir.join(shim_file_name());
    if candidate.exists() {
        Ok(candidate)
    } else {
        anyhow::bail!(
            "Clock shim not found at {}. Build it with `cargo build -p framestep-timestep` \
             or set [emulator] preload",
            candidate.display()
        )
    }
}

fn shim_file_name() -> String {
    format!(
        "{}timestep{}",
        std::env::consts::DLL_PREFIX,
        std::env::consts::DLL_SUFFIX
    )
}

/// Poll until `socket` exists as a Unix socket.
///
/// A launcher that exits successfully may have daemonized the emulator, so
/// waiting continues; a failing exit ends the boot immediately.
fn wait_for_socket(child: &mut Child, socket: &Path, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut launcher_exited = false;

    loop {
        if is_socket(socket) {
            tracing::debug!("Control socket ready: {}", socket.display());
            return Ok(());
        }

        if !launcher_exited {
            if let Some(status) = child.try_wait().context("Failed to poll emulator")? {
                if !status.success() {
                    anyhow::bail!("Emulator exited during boot ({})", status);
                }
                tracing::debug!("Emulator launcher exited, waiting for the control socket");
                launcher_exited = true;
            }
        }

        if Instant::now() >= deadline {
            anyhow::bail!(
                "Emulator did not create its control socket within {:?}: {}",
                timeout,
                socket.display()
            );
        }
        std::thread::sleep(SOCKET_POLL_INTERVAL);
    }
}

fn is_socket(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false)
}
