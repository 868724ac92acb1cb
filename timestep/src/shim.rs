//! Shim state living inside the emulator process.
//!
//! Separated from the libc glue so the freeze/step bookkeeping can be tested
//! without interposing anything.

use std::path::PathBuf;

use framestep_shared::{DEFAULT_FRAME_INTERVAL_NS, DEFAULT_IDLE_NS, DriverParams};

use crate::filter::ClockFilter;

/// A `timeval` split into seconds and microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeVal {
    pub sec: i64,
    pub usec: i64,
}

/// Filtered time plus the process to notify about a finished step, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filtered {
    pub time: TimeVal,
    pub notify: Option<libc::pid_t>,
}

/// Clock state for one emulator process.
#[derive(Debug)]
pub struct ShimState {
    filter: ClockFilter,
    base: TimeVal,
    params_path: Option<PathBuf>,
    driver_pid: Option<libc::pid_t>,
}

impl ShimState {
    /// `base` is the first real reading; simulated time starts there.
    pub fn new(base: TimeVal, frame_interval_ns: u64, idle_ns: u64, params_path: Option<PathBuf>) -> Self {
        Self {
            filter: ClockFilter::new(frame_interval_ns, idle_ns),
            base,
            params_path,
            driver_pid: None,
        }
    }

    /// Build from the `TIMESTEP`, `TIMESTEP_IDLE` and `DRIVER_PARAMS` variables.
    pub fn from_env(base: TimeVal) -> Self {
        let quantum = |name: &str, default: u64| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let state = Self::new(
            base,
            quantum(framestep_shared::ENV_TIMESTEP, DEFAULT_FRAME_INTERVAL_NS),
            quantum(framestep_shared::ENV_TIMESTEP_IDLE, DEFAULT_IDLE_NS),
            std::env::var_os(framestep_shared::ENV_DRIVER_PARAMS).map(PathBuf::from),
        );
        eprintln!(
            "[timestep] ready, params file {:?}",
            state.params_path.as_deref()
        );
        state
    }

    pub fn is_frozen(&self) -> bool {
        self.filter.is_frozen()
    }

    pub fn driver_pid(&self) -> Option<libc::pid_t> {
        self.driver_pid
    }

    /// Apply signals received since the last read. Toggles go first so a
    /// freeze immediately followed by a step steps a frozen clock.
    pub fn apply_signals(&mut self, freeze_toggles: u32, step_requests: u32) {
        for _ in 0..freeze_toggles {
            self.toggle_freeze();
        }
        for _ in 0..step_requests {
            self.filter.request_step();
        }
    }

    fn toggle_freeze(&mut self) {
        if self.filter.is_frozen() {
            self.filter.set_frozen(false);
            self.driver_pid = None;
            eprintln!("[timestep] stopped freezing time");
            return;
        }

        self.filter.set_frozen(true);
        if let Some(path) = &self.params_path {
            match DriverParams::read_from(path) {
                Ok(params) => {
                    self.filter
                        .set_quanta(params.frame_interval_ns, params.idle_ns);
                    self.driver_pid = libc::pid_t::try_from(params.driver_pid).ok();
                }
                Err(e) => eprintln!("[timestep] ignoring driver params: {}", e),
            }
        }
        eprintln!("[timestep] started freezing time, driver={:?}", self.driver_pid);
    }

    /// Map a real reading to simulated time.
    pub fn filter(&mut self, real: TimeVal) -> Filtered {
        let elapsed_us = (real.sec - self.base.sec) * 1_000_000 + (real.usec - self.base.usec);
        let reading = self.filter.read(elapsed_us * 1000);

        let us = reading.nanos / 1000;
        let mut sec = self.base.sec + us / 1_000_000;
        let mut usec = self.base.usec + us % 1_000_000;
        if usec >= 1_000_000 {
            usec -= 1_000_000;
            sec += 1;
        }

        Filtered {
            time: TimeVal { sec, usec },
            notify: if reading.step_applied {
                self.driver_pid
            } else {
                None
            },
        }
    }
}
