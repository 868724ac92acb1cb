//! framestep core
//!
//! Deterministic, frame-accurate capture from an emulator whose clock only
//! advances on demand. The engine freezes the emulator clock, steps it one
//! frame at a time, waits for each step to be confirmed and then asks the
//! emulator to dump its frame buffer.
//!
//! - [`control`] talks to the emulator's control socket
//! - [`signaler`] steps the clock and collects confirmations
//! - [`capture`] is the per-frame loop
//! - [`session`] covers everything around the loop

pub mod build;
pub mod capture;
pub mod config;
pub mod control;
pub mod error;
pub mod session;
pub mod signaler;

pub use build::{BuildCollaborator, BuildOptions};
pub use capture::{
    AutoStart, CancelToken, CaptureLoop, CaptureOptions, CaptureReport, LoopState, Operator,
};
pub use config::{CONFIG_FILE_NAME, RecorderConfig};
pub use control::{Command, ControlChannel};
pub use error::RecorderError;
pub use session::{EmulatorHandle, Session, SessionState};
pub use signaler::{
    ClockDriver, NotificationListener, SignalClock, StepConfirmations, StepNotifier,
    TimeStepSignaler, WaitPolicy,
};
