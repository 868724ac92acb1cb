//! Recorder configuration (framestep.toml)
//!
//! All paths that used to be process-wide (control socket, driver params,
//! pid file) are explicit settings here and get handed to each component at
//! construction. Every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use framestep_shared::{DEFAULT_FRAME_INTERVAL_NS, DEFAULT_IDLE_NS, DriverParams};

use crate::error::RecorderError;

/// Default configuration file name, looked up in the project directory.
pub const CONFIG_FILE_NAME: &str = "framestep.toml";

/// Recorder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RecorderConfig {
    /// Capture output settings
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Clock stepping and wait policy
    #[serde(default)]
    pub timing: TimingConfig,
    /// How to find, boot and talk to the emulator
    #[serde(default)]
    pub emulator: EmulatorConfig,
    /// Optional application build step
    #[serde(default)]
    pub build: BuildConfig,
}

/// Capture output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Directory receiving one file per frame (cleared each session)
    #[serde(default = "default_capture_dir")]
    pub directory: PathBuf,
    /// Stop after this many frames instead of waiting for Ctrl-C
    #[serde(default)]
    pub frame_limit: Option<u64>,
    /// Let the emulator clock run freely again once recording ends
    #[serde(default = "default_true")]
    pub release_clock_on_finish: bool,
    /// Ask the operator to press enter before recording starts
    #[serde(default = "default_true")]
    pub prompt: bool,
}

/// Clock stepping and wait policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Simulated nanoseconds per explicit step (default: 33333000)
    #[serde(default = "default_frame_interval_ns")]
    pub frame_interval_ns: u64,
    /// Simulated nanoseconds per clock read while frozen (default: 100)
    #[serde(default = "default_idle_ns")]
    pub idle_ns: u64,
    /// Give up on a step confirmation after this long (default: 5000)
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    /// Confirmation polling granularity (default: 10)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Give up on a command acknowledgement after this long (default: 5000)
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

/// Emulator location and boot settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmulatorConfig {
    /// Command that boots the emulator; empty means it is started externally
    #[serde(default)]
    pub command: Vec<String>,
    /// File holding the emulator's process id
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    /// Unix socket of the emulator's control endpoint
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
    /// Driver-parameter file read by the clock shim
    #[serde(default = "default_driver_params")]
    pub driver_params: PathBuf,
    /// Clock shim library injected into the emulator
    #[serde(default)]
    pub preload: Option<PathBuf>,
    /// How long to wait for the control socket after boot (default: 30000)
    #[serde(default = "default_boot_timeout_ms")]
    pub boot_timeout_ms: u64,
}

/// Application build step, run before booting the emulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BuildConfig {
    /// Build command line, run in the project directory
    #[serde(default)]
    pub command: Option<String>,
    /// Artifact the build must produce (relative to the project directory)
    #[serde(default)]
    pub artifact: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}
fn default_capture_dir() -> PathBuf {
    PathBuf::from(".framestep-captures")
}
fn default_frame_interval_ns() -> u64 {
    DEFAULT_FRAME_INTERVAL_NS
}
fn default_idle_ns() -> u64 {
    DEFAULT_IDLE_NS
}
fn default_step_timeout_ms() -> u64 {
    5000
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_ack_timeout_ms() -> u64 {
    5000
}
fn default_pid_file() -> PathBuf {
    std::env::temp_dir().join("framestep-emulator.pid")
}
fn default_control_socket() -> PathBuf {
    std::env::temp_dir().join("framestep-qmp")
}
fn default_driver_params() -> PathBuf {
    std::env::temp_dir().join("framestep-driver-params")
}
fn default_boot_timeout_ms() -> u64 {
    30_000
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            directory: default_capture_dir(),
            frame_limit: None,
            release_clock_on_finish: true,
            prompt: true,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            frame_interval_ns: default_frame_interval_ns(),
            idle_ns: default_idle_ns(),
            step_timeout_ms: default_step_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            pid_file: default_pid_file(),
            control_socket: default_control_socket(),
            driver_params: default_driver_params(),
            preload: None,
            boot_timeout_ms: default_boot_timeout_ms(),
        }
    }
}

impl TimingConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Driver parameters announcing this process as the step listener.
    pub fn driver_params(&self) -> DriverParams {
        DriverParams::for_current_process(self.frame_interval_ns, self.idle_ns)
    }
}

impl EmulatorConfig {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }
}

impl RecorderConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, RecorderError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RecorderError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
            .map_err(|e| RecorderError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load configuration, falling back to defaults if the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, RecorderError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text and validate it.
    pub fn from_toml(text: &str) -> Result<Self, RecorderError> {
        let config: Self =
            toml::from_str(text).map_err(|e| RecorderError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML (used by `framestep init`).
    pub fn to_toml(&self) -> Result<String, RecorderError> {
        toml::to_string_pretty(self).map_err(|e| RecorderError::Config(e.to_string()))
    }

    /// Reject settings that would make the wait policy meaningless.
    pub fn validate(&self) -> Result<(), RecorderError> {
        if self.timing.frame_interval_ns == 0 {
            return Err(RecorderError::Config(
                "timing.frame_interval_ns must be greater than zero".into(),
            ));
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(RecorderError::Config(
                "timing.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.timing.step_timeout_ms < self.timing.poll_interval_ms {
            return Err(RecorderError::Config(format!(
                "timing.step_timeout_ms ({}) must be at least poll_interval_ms ({})",
                self.timing.step_timeout_ms, self.timing.poll_interval_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = RecorderConfig::from_toml("").unwrap();
        assert_eq!(config, RecorderConfig::default());
        assert_eq!(config.timing.frame_interval_ns, 33_333_000);
        assert_eq!(config.timing.idle_ns, 100);
        assert!(config.capture.prompt);
        assert!(config.capture.release_clock_on_finish);
        assert!(config.emulator.command.is_empty());
    }

    #[test]
    fn test_partial_sections() {
        let config = RecorderConfig::from_toml(
            r#"
            [capture]
            directory = "out"
            frame_limit = 120

            [emulator]
            command = ["pebble", "install", "--emulator", "basalt"]
            control_socket = "/tmp/qmp"
            "#,
        )
        .unwrap();

        assert_eq!(config.capture.directory, PathBuf::from("out"));
        assert_eq!(config.capture.frame_limit, Some(120));
        assert!(config.capture.prompt);
        assert_eq!(config.emulator.command.len(), 4);
        assert_eq!(config.emulator.control_socket, PathBuf::from("/tmp/qmp"));
        assert_eq!(config.timing.step_timeout_ms, 5000);
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let err = RecorderConfig::from_toml("[timing]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_rejects_timeout_below_poll_interval() {
        let err = RecorderConfig::from_toml(
            "[timing]\npoll_interval_ms = 50\nstep_timeout_ms = 10\n",
        )
        .unwrap_err();
        assert!(matches!(err, RecorderError::Config(_)));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = RecorderConfig::default();
        config.capture.frame_limit = Some(3);
        config.build.command = Some("make".into());

        let text = config.to_toml().unwrap();
        assert_eq!(RecorderConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecorderConfig::load_or_default(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(config, RecorderConfig::default());
    }

    #[test]
    fn test_driver_params_use_own_pid() {
        let timing = TimingConfig {
            frame_interval_ns: 1_000,
            idle_ns: 7,
            ..TimingConfig::default()
        };
        let params = timing.driver_params();
        assert_eq!(params.frame_interval_ns, 1_000);
        assert_eq!(params.idle_ns, 7);
        assert_eq!(params.driver_pid, std::process::id());
    }
}
