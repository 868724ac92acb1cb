//! Shared types for the framestep recorder and the timestep clock shim.
//!
//! Both sides of the clock-stepping protocol live in different processes: the
//! recorder drives the emulator, and the shim runs inside it. Everything they
//! must agree on (quanta, signal numbers, environment variable names and the
//! driver-parameter file format) is defined here.

pub mod constants;
pub mod driver_params;

pub use constants::*;
pub use driver_params::{DriverParams, DriverParamsError};
