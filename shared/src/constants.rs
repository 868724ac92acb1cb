//! Timing and signalling constants shared by the recorder and the clock shim.

/// Simulated time advanced by one explicit step: one frame at ~30 fps.
pub const DEFAULT_FRAME_INTERVAL_NS: u64 = 33_333 * 1000;

/// Simulated time advanced per clock read while frozen.
///
/// The emulated RTC misbehaves if time stops completely, so a frozen clock
/// still creeps forward by this tiny amount on every read.
pub const DEFAULT_IDLE_NS: u64 = 100;

/// Largest jump the shim applies to a single clock read while draining a step.
///
/// Real hardware sees roughly 10us between consecutive reads; handing the RTC a
/// whole frame interval at once makes it reject the time, so steps are spread
/// across many reads.
pub const MAX_INTERCALL_DELTA_NS: u64 = 20_000;

/// Environment variable carrying the frame interval (ns) into the emulator.
pub const ENV_TIMESTEP: &str = "TIMESTEP";
/// Environment variable carrying the idle quantum (ns) into the emulator.
pub const ENV_TIMESTEP_IDLE: &str = "TIMESTEP_IDLE";
/// Environment variable naming the driver-parameter file.
pub const ENV_DRIVER_PARAMS: &str = "DRIVER_PARAMS";

/// Sent to the emulator: toggle between free-running and frozen time.
#[cfg(unix)]
pub const SIG_FREEZE_TIME: libc::c_int = libc::SIGURG;
/// Sent to the emulator: advance the clock by one frame interval.
#[cfg(unix)]
pub const SIG_STEP_TIME: libc::c_int = libc::SIGUSR2;
/// Sent back to the recorder once a requested step has fully elapsed.
#[cfg(unix)]
pub const SIG_STEP_APPLIED: libc::c_int = libc::SIGUSR1;
