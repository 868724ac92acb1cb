//! Driver-parameter side channel.
//!
//! The recorder writes a tiny text file before freezing the emulator clock:
//!
//! ```text
//! <frame_interval_ns> <idle_ns> <driver_pid>
//! ```
//!
//! The clock shim re-reads it every time time becomes frozen, which is how it
//! learns the quanta and which process to notify when a step completes.

use std::fs;
use std::io;
use std::path::Path;

use crate::constants::{DEFAULT_FRAME_INTERVAL_NS, DEFAULT_IDLE_NS};

/// Errors produced while reading driver parameters.
#[derive(Debug, thiserror::Error)]
pub enum DriverParamsError {
    #[error("driver params missing field `{0}`")]
    Missing(&'static str),

    #[error("driver params field `{field}` is not a valid number: {value:?}")]
    Invalid { field: &'static str, value: String },

    #[error("driver params contain unexpected trailing data: {0:?}")]
    Trailing(String),

    #[error("failed to access driver params: {0}")]
    Io(#[from] io::Error),
}

/// Parameters handed from the recorder to the clock shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverParams {
    /// Nanoseconds advanced by one explicit step.
    pub frame_interval_ns: u64,
    /// Nanoseconds advanced per clock read while frozen.
    pub idle_ns: u64,
    /// Process to signal when a step has been applied.
    pub driver_pid: u32,
}

impl DriverParams {
    /// Parameters with default quanta, addressed to `driver_pid`.
    pub fn new(driver_pid: u32) -> Self {
        Self {
            frame_interval_ns: DEFAULT_FRAME_INTERVAL_NS,
            idle_ns: DEFAULT_IDLE_NS,
            driver_pid,
        }
    }

    /// Parameters addressed to the calling process.
    pub fn for_current_process(frame_interval_ns: u64, idle_ns: u64) -> Self {
        Self {
            frame_interval_ns,
            idle_ns,
            driver_pid: std::process::id(),
        }
    }

    /// Render in the on-disk format.
    pub fn encode(&self) -> String {
        format!(
            "{} {} {}",
            self.frame_interval_ns, self.idle_ns, self.driver_pid
        )
    }

    /// Parse the on-disk format. Any whitespace separates fields.
    pub fn parse(text: &str) -> Result<Self, DriverParamsError> {
        let mut fields = text.split_whitespace();
        let frame_interval_ns = parse_field(fields.next(), "frame_interval_ns")?;
        let idle_ns = parse_field(fields.next(), "idle_ns")?;
        let driver_pid = parse_field(fields.next(), "driver_pid")?;

        let rest: Vec<&str> = fields.collect();
        if !rest.is_empty() {
            return Err(DriverParamsError::Trailing(rest.join(" ")));
        }

        Ok(Self {
            frame_interval_ns,
            idle_ns,
            driver_pid,
        })
    }

    /// Write the parameters to `path`, replacing any previous contents.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        fs::write(path, self.encode())
    }

    /// Read parameters from `path`.
    pub fn read_from(path: &Path) -> Result<Self, DriverParamsError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }
}

fn parse_field<T: std::str::FromStr>(
    raw: Option<&str>,
    field: &'static str,
) -> Result<T, DriverParamsError> {
    let raw = raw.ok_or(DriverParamsError::Missing(field))?;
    raw.parse().map_err(|_| DriverParamsError::Invalid {
        field,
        value: raw.to_string(),
    })
}
