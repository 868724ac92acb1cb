//! Capture loop
//!
//! Per-frame orchestration: step the clock, wait for the step to land, dump the
//! frame buffer, bump the frame index. Cancellation is only observed between
//! iterations, so an iteration that has started always finishes its capture
//! and the last file on disk is always the last completed index.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::control::{Command, ControlChannel};
use crate::error::RecorderError;
use crate::session::{Session, SessionState};
use crate::signaler::{ClockDriver, TimeStepSignaler};

/// Cooperative cancellation flag, set from the interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The human (or script) running the session.
pub trait Operator {
    /// Block until the operator is ready for recording to start.
    fn confirm_start(&mut self) -> Result<(), RecorderError>;

    /// Called after every captured frame with the running total.
    fn frame_captured(&mut self, _frames: u64) {}
}

/// Operator that starts immediately and reports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoStart;

impl Operator for AutoStart {
    fn confirm_start(&mut self) -> Result<(), RecorderError> {
        Ok(())
    }
}

/// Where the capture loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    WaitingToStart,
    Stepping,
    AwaitingConfirmation,
    Capturing,
    Cancelled,
    Finalizing,
    Stopped,
}

/// Capture loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Directory the emulator writes frames into.
    pub capture_dir: PathBuf,
    /// Stop after this many frames even without cancellation.
    pub frame_limit: Option<u64>,
    /// Unfreeze the clock after re-freezing it during finalization, leaving
    /// the emulator running freely as it was before the session.
    pub release_clock_on_finish: bool,
}

impl CaptureOptions {
    pub fn new(capture_dir: impl Into<PathBuf>) -> Self {
        Self {
            capture_dir: capture_dir.into(),
            frame_limit: None,
            release_clock_on_finish: true,
        }
    }
}

/// Summary of a finished recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    /// Frames captured; files `0..frames` exist in the capture directory.
    pub frames: u64,
    pub capture_dir: PathBuf,
}

impl CaptureReport {
    /// Index of the last frame written, if any.
    pub fn last_index(&self) -> Option<u64> {
        self.frames.checked_sub(1)
    }
}

/// Drives one recording: owns the clock signaler and the control channel.
pub struct CaptureLoop<D: ClockDriver> {
    signaler: TimeStepSignaler<D>,
    channel: ControlChannel,
    options: CaptureOptions,
    state: LoopState,
    frame_index: u64,
    armed: bool,
}

impl<D: ClockDriver> CaptureLoop<D> {
    pub fn new(
        signaler: TimeStepSignaler<D>,
        channel: ControlChannel,
        options: CaptureOptions,
    ) -> Self {
        Self {
            signaler,
            channel,
            options,
            state: LoopState::WaitingToStart,
            frame_index: 0,
            armed: false,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Record until cancelled, the frame limit is hit, or something fails.
    ///
    /// Finalization (re-freeze, close) runs on every path; the clock is only
    /// touched if recording got as far as freezing it. On failure the
    /// session goes straight to `Stopped` and the original error is returned;
    /// frames already written are left untouched.
    pub fn run(
        mut self,
        session: &mut Session,
        operator: &mut dyn Operator,
        cancel: &CancelToken,
    ) -> Result<CaptureReport, RecorderError> {
        let recorded = self.record(session, operator, cancel);
        let finalized = self.finalize(session);

        match (recorded, finalized) {
            (Ok(()), Ok(())) => {
                session.transition(SessionState::Stopped)?;
                tracing::info!(
                    "Recording finished: {} frames in {}",
                    self.frame_index,
                    self.options.capture_dir.display()
                );
                Ok(self.report())
            }
            (Ok(()), Err(e)) => {
                session.abort();
                Err(e)
            }
            (Err(e), finalized) => {
                if let Err(cleanup) = finalized {
                    tracing::warn!("Cleanup after failed recording also failed: {}", cleanup);
                }
                tracing::error!(
                    "Recording aborted after {} frames: {}",
                    self.frame_index,
                    e
                );
                session.abort();
                Err(e)
            }
        }
    }

    fn record(
        &mut self,
        session: &mut Session,
        operator: &mut dyn Operator,
        cancel: &CancelToken,
    ) -> Result<(), RecorderError> {
        self.enter(LoopState::WaitingToStart);
        operator.confirm_start()?;

        tracing::info!("Freezing emulator clock");
        self.signaler.freeze()?;
        self.armed = true;
        session.transition(SessionState::Armed)?;
        session.transition(SessionState::Recording)?;
        tracing::info!("Recording (Ctrl-C to finish)");

        loop {
            if cancel.is_cancelled() {
                self.enter(LoopState::Cancelled);
                tracing::info!("Cancellation requested after {} frames", self.frame_index);
                break;
            }
            if self
                .options
                .frame_limit
                .is_some_and(|limit| self.frame_index >= limit)
            {
                tracing::info!("Frame limit of {} reached", self.frame_index);
                break;
            }

            self.enter(LoopState::Stepping);
            self.signaler.step()?;

            self.enter(LoopState::AwaitingConfirmation);
            self.signaler.wait_for_step()?;

            self.enter(LoopState::Capturing);
            self.capture_frame()?;

            self.frame_index += 1;
            operator.frame_captured(self.frame_index);
        }

        session.transition(SessionState::Draining)?;
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<(), RecorderError> {
        let path = frame_path(&self.options.capture_dir, self.frame_index);
        self.channel.execute(&Command::screendump(&path)?)?;
        tracing::debug!("Captured frame {}", self.frame_index);
        Ok(())
    }

    fn finalize(&mut self, session: &Session) -> Result<(), RecorderError> {
        self.enter(LoopState::Finalizing);

        let clock = if self.armed {
            self.settle_clock()
        } else {
            Ok(())
        };
        self.channel.close();
        let recorded = session.record_clock_state(self.signaler.is_frozen());

        self.enter(LoopState::Stopped);
        clock.and(recorded)
    }

    fn settle_clock(&mut self) -> Result<(), RecorderError> {
        self.signaler.freeze()?;
        if self.options.release_clock_on_finish {
            tracing::info!("Releasing emulator clock");
            self.signaler.release()?;
        } else {
            tracing::info!("Leaving emulator clock frozen");
        }
        Ok(())
    }

    fn enter(&mut self, next: LoopState) {
        tracing::trace!("Capture loop {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn report(&self) -> CaptureReport {
        CaptureReport {
            frames: self.frame_index,
            capture_dir: self.options.capture_dir.clone(),
        }
    }
}

/// File the frame with `index` is written to.
pub fn frame_path(capture_dir: &Path, index: u64) -> PathBuf {
    capture_dir.join(index.to_string())
}
