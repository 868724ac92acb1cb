//! Clock shim for stepping an emulator's time from outside.
//!
//! Loaded into the emulator with `LD_PRELOAD` (or `DYLD_INSERT_LIBRARIES`), it
//! replaces `gettimeofday` so the emulator sees a clock that:
//!
//! - runs in real time until it receives `SIGURG`,
//! - once frozen, creeps forward by an idle quantum per read,
//! - advances by one frame interval for every `SIGUSR2`, spread over several
//!   reads, and sends `SIGUSR1` to the recorder once the whole step is visible.
//!
//! The signal handlers only bump atomic counters; all real work happens on the
//! next clock read.

pub mod filter;
#[cfg(unix)]
pub mod shim;

#[cfg(all(unix, not(test)))]
mod interpose;

pub use filter::{ClockFilter, Reading};
