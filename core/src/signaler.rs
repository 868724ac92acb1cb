//! Time-step signaler
//!
//! Drives the emulator's simulated clock one frame at a time and learns when
//! each step has been applied.
//!
//! Outbound requests go through a [`ClockDriver`] (for a real emulator,
//! [`SignalClock`] delivers POSIX signals to its process). Step-applied
//! notifications come back asynchronously; [`NotificationListener`] turns each
//! one into exactly one message on a [`StepConfirmations`] channel, which the
//! capture loop drains with a bounded-latency poll.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use framestep_shared::{SIG_FREEZE_TIME, SIG_STEP_APPLIED, SIG_STEP_TIME};

use crate::error::RecorderError;
use crate::session::EmulatorHandle;

/// Outbound half of the clock-stepping protocol.
pub trait ClockDriver {
    /// Flip the emulator between free-running and frozen time.
    fn toggle_freeze(&mut self) -> Result<(), RecorderError>;

    /// Ask the emulator to advance its clock by one frame interval.
    fn step(&mut self) -> Result<(), RecorderError>;
}

/// Clock driver that signals the emulator process directly.
#[derive(Debug, Clone, Copy)]
pub struct SignalClock {
    handle: EmulatorHandle,
}

impl SignalClock {
    pub fn new(handle: EmulatorHandle) -> Self {
        Self { handle }
    }

    fn send(&self, signal: libc::c_int) -> Result<(), RecorderError> {
        let pid = self.handle.as_raw();
        // SAFETY: kill has no memory-safety preconditions; the pid came from a
        // validated EmulatorHandle.
        let result = unsafe { libc::kill(pid, signal) };
        if result == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Err(RecorderError::NotFound(format!(
                "emulator process {} has exited",
                pid
            )))
        } else {
            Err(RecorderError::Io(err))
        }
    }
}

impl ClockDriver for SignalClock {
    fn toggle_freeze(&mut self) -> Result<(), RecorderError> {
        self.send(SIG_FREEZE_TIME)
    }

    fn step(&mut self) -> Result<(), RecorderError> {
        self.send(SIG_STEP_TIME)
    }
}

/// Producer side of the confirmation channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StepNotifier {
    tx: Sender<()>,
}

impl StepNotifier {
    /// Record one applied step. Fails once the consumer is gone.
    pub fn notify(&self) -> Result<(), RecorderError> {
        self.tx.send(()).map_err(|_| {
            RecorderError::ProtocolViolation("step confirmation consumer has stopped".into())
        })
    }
}

/// Outcome of one bounded poll for a confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    Confirmed,
    Pending,
    Disconnected,
}

/// Consumer side of the confirmation channel.
///
/// Confirmations are queued, never coalesced: each `notify` is observed by
/// exactly one successful poll.
#[derive(Debug)]
pub struct StepConfirmations {
    rx: Receiver<()>,
}

impl StepConfirmations {
    /// Create a connected notifier/confirmations pair.
    pub fn channel() -> (StepNotifier, StepConfirmations) {
        let (tx, rx) = mpsc::channel();
        (StepNotifier { tx }, StepConfirmations { rx })
    }

    /// Wait at most `interval` for one confirmation.
    pub fn poll(&self, interval: Duration) -> Poll {
        match self.rx.recv_timeout(interval) {
            Ok(()) => Poll::Confirmed,
            Err(RecvTimeoutError::Timeout) => Poll::Pending,
            Err(RecvTimeoutError::Disconnected) => Poll::Disconnected,
        }
    }

    /// Take a confirmation only if one is already queued.
    pub fn try_take(&self) -> Poll {
        match self.rx.try_recv() {
            Ok(()) => Poll::Confirmed,
            Err(TryRecvError::Empty) => Poll::Pending,
            Err(TryRecvError::Disconnected) => Poll::Disconnected,
        }
    }
}

/// Write end of the self-pipe used by the signal handler (-1 when unset).
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_step_applied(_signo: libc::c_int) {
    let fd = NOTIFY_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }
    let byte = 1u8;
    // SAFETY: send(2) is async-signal-safe; the buffer outlives the call and the
    // fd is non-blocking, so a full pipe drops the byte instead of blocking.
    unsafe {
        libc::send(fd, (&byte as *const u8).cast(), 1, SEND_FLAGS);
    }
}

/// A handler racing a listener teardown may write to a shut-down socket.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Receives step-applied signals from the emulator and forwards each one to a
/// [`StepNotifier`].
///
/// The signal handler itself only writes a byte to a socket pair; a dedicated
/// thread reads those bytes and performs the channel send. Only one listener
/// may exist per process.
///
/// The write end is shut down but never closed on drop: a handler that loaded
/// the fd just before teardown may still write to it, and a closed fd number
/// could already belong to something else by then.
pub struct NotificationListener {
    writer: Option<UnixStream>,
    fd: RawFd,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for NotificationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationListener")
            .field("fd", &self.fd)
            .finish()
    }
}

impl NotificationListener {
    /// Install the step-applied handler and start forwarding to `notifier`.
    pub fn install(notifier: StepNotifier) -> Result<Self, RecorderError> {
        let (mut reader, writer) = UnixStream::pair()?;
        writer.set_nonblocking(true)?;

        if NOTIFY_FD
            .compare_exchange(-1, writer.as_raw_fd(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RecorderError::SessionActive(
                "a step notification listener is already installed in this process".into(),
            ));
        }

        if let Err(e) = set_handler(on_step_applied as extern "C" fn(libc::c_int) as libc::sighandler_t)
        {
            NOTIFY_FD.store(-1, Ordering::SeqCst);
            return Err(RecorderError::Io(e));
        }

        let thread = thread::Builder::new()
            .name("step-notifications".into())
            .spawn(move || {
                let mut buf = [0u8; 64];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            for _ in 0..n {
                                if notifier.notify().is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::warn!("Step notification pipe failed: {}", e);
                            break;
                        }
                    }
                }
            })?;

        tracing::debug!("Step notification listener installed");
        Ok(Self {
            fd: writer.as_raw_fd(),
            writer: Some(writer),
            thread: Some(thread),
        })
    }

    /// Write end of the self-pipe, as seen by the signal handler.
    pub fn notify_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        // Late notifications after the session are ignored rather than
        // falling back to the default action, which would kill us.
        if let Err(e) = set_handler(libc::SIG_IGN) {
            tracing::warn!("Failed to detach step notification handler: {}", e);
        }
        NOTIFY_FD.store(-1, Ordering::SeqCst);
        if let Some(writer) = self.writer.take() {
            let _ = writer.shutdown(std::net::Shutdown::Both);
            let _ = writer.into_raw_fd();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn set_handler(handler: libc::sighandler_t) -> io::Result<()> {
    // SAFETY: the sigaction struct is fully initialised before use, and the
    // handler only performs an async-signal-safe write.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(SIG_STEP_APPLIED, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Wait policy for step confirmations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Overall deadline for one confirmation.
    pub timeout: Duration,
    /// Granularity of each poll.
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Freezes, steps and waits on the emulator clock.
///
/// Tracks whether the clock is frozen so `freeze`/`release` are idempotent
/// even though the underlying request is a toggle, and tracks the outstanding
/// step so every step is paired with exactly one confirmation.
#[derive(Debug)]
pub struct TimeStepSignaler<D: ClockDriver> {
    driver: D,
    confirmations: StepConfirmations,
    policy: WaitPolicy,
    frozen: bool,
    outstanding: bool,
    steps_confirmed: u64,
}

impl<D: ClockDriver> TimeStepSignaler<D> {
    /// The clock is assumed to be free-running on construction.
    pub fn new(driver: D, confirmations: StepConfirmations, policy: WaitPolicy) -> Self {
        Self {
            driver,
            confirmations,
            policy,
            frozen: false,
            outstanding: false,
            steps_confirmed: 0,
        }
    }

    /// Start from a known clock state instead of assuming it runs freely.
    ///
    /// Freezing is a toggle on the emulator side, so a session attaching to an
    /// emulator that an earlier session left frozen must say so up front.
    pub fn assume_frozen(mut self, frozen: bool) -> Self {
        self.frozen = frozen;
        self
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn steps_confirmed(&self) -> u64 {
        self.steps_confirmed
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Stop the clock from advancing on its own. No-op if already frozen.
    pub fn freeze(&mut self) -> Result<(), RecorderError> {
        if self.frozen {
            tracing::debug!("Clock already frozen");
            return Ok(());
        }
        self.driver.toggle_freeze()?;
        self.frozen = true;
        Ok(())
    }

    /// Let the clock run freely again. No-op if not frozen.
    pub fn release(&mut self) -> Result<(), RecorderError> {
        if !self.frozen {
            return Ok(());
        }
        self.driver.toggle_freeze()?;
        self.frozen = false;
        Ok(())
    }

    /// Request one frame-interval advance.
    ///
    /// # Errors
    ///
    /// [`RecorderError::ProtocolViolation`] if the clock is not frozen, the
    /// previous step is still unconfirmed, or a confirmation arrived that no
    /// step asked for.
    pub fn step(&mut self) -> Result<(), RecorderError> {
        if !self.frozen {
            return Err(RecorderError::ProtocolViolation(
                "step requested while the clock is running".into(),
            ));
        }
        if self.outstanding {
            return Err(RecorderError::ProtocolViolation(
                "step requested before the previous step was confirmed".into(),
            ));
        }
        if self.confirmations.try_take() == Poll::Confirmed {
            return Err(RecorderError::ProtocolViolation(
                "received a step confirmation without a pending step".into(),
            ));
        }

        self.driver.step()?;
        self.outstanding = true;
        Ok(())
    }

    /// Block until the outstanding step is confirmed, consuming exactly one
    /// confirmation.
    ///
    /// Polls every `poll_interval` rather than sleeping for a frame, since the
    /// notification can land at any moment after the request.
    pub fn wait_for_step(&mut self) -> Result<(), RecorderError> {
        if !self.outstanding {
            return Err(RecorderError::ProtocolViolation(
                "waiting for a step that was never requested".into(),
            ));
        }

        let deadline = Instant::now() + self.policy.timeout;
        loop {
            match self.confirmations.poll(self.policy.poll_interval) {
                Poll::Confirmed => {
                    self.outstanding = false;
                    self.steps_confirmed += 1;
                    return Ok(());
                }
                Poll::Pending => {
                    if Instant::now() >= deadline {
                        return Err(RecorderError::ProtocolViolation(format!(
                            "no step confirmation within {:?}",
                            self.policy.timeout
                        )));
                    }
                }
                Poll::Disconnected => {
                    return Err(RecorderError::ProtocolViolation(
                        "step notification source disconnected".into(),
                    ));
                }
            }
        }
    }
}
