//! Session lifecycle
//!
//! Everything around the capture loop: clearing the capture directory,
//! resolving the emulator process, holding the per-emulator session lock and
//! tracking the linear session state.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::RecorderError;

/// Process id of a running emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmulatorHandle(libc::pid_t);

impl EmulatorHandle {
    pub fn from_raw(pid: libc::pid_t) -> Self {
        Self(pid)
    }

    pub fn as_raw(&self) -> libc::pid_t {
        self.0
    }

    /// Whether the process still exists.
    ///
    /// `EPERM` counts as alive: the process exists but belongs to someone else.
    pub fn is_alive(&self) -> bool {
        process_alive(self.0)
    }
}

impl std::fmt::Display for EmulatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

fn process_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for process existence.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Lifecycle of one recording session. Transitions are strictly linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing touched yet.
    Idle,
    /// Clock frozen, waiting for the first step.
    Armed,
    /// Stepping and capturing.
    Recording,
    /// Cancellation observed, finalizing.
    Draining,
    /// Finished, successfully or not.
    Stopped,
}

impl SessionState {
    fn successor(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::Armed),
            Self::Armed => Some(Self::Recording),
            Self::Recording => Some(Self::Draining),
            Self::Draining => Some(Self::Stopped),
            Self::Stopped => None,
        }
    }
}

/// Clear `dir` for a fresh session, creating it if needed.
///
/// Removes every entry (files and subdirectories). Calling it again on an
/// already-empty directory is a no-op.
pub fn prepare_capture_dir(dir: &Path) -> Result<(), RecorderError> {
    fs::create_dir_all(dir)?;

    let mut removed = 0usize;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        removed += 1;
    }

    if removed > 0 {
        tracing::info!("Cleared {} stale captures from {}", removed, dir.display());
    }
    Ok(())
}

/// Resolve the emulator process from its pid file.
///
/// # Errors
///
/// [`RecorderError::NotFound`] if the file is missing, unparsable, or names a
/// process that is not running.
pub fn locate_emulator(pid_file: &Path) -> Result<EmulatorHandle, RecorderError> {
    let text = fs::read_to_string(pid_file).map_err(|e| {
        RecorderError::NotFound(format!("cannot read {}: {}", pid_file.display(), e))
    })?;
    let pid: libc::pid_t = text.trim().parse().map_err(|_| {
        RecorderError::NotFound(format!(
            "{} does not contain a process id: {:?}",
            pid_file.display(),
            text.trim()
        ))
    })?;

    let handle = EmulatorHandle::from_raw(pid);
    if !handle.is_alive() {
        return Err(RecorderError::NotFound(format!(
            "emulator {} from {} is not running",
            handle,
            pid_file.display()
        )));
    }

    tracing::info!("Found emulator ({})", handle);
    Ok(handle)
}

/// Exclusive claim on one emulator instance, held as a lock file.
///
/// The file contains the owner's pid; a lock left behind by a dead process is
/// taken over. Removed on drop.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    /// Lock path used for a given control socket.
    pub fn path_for(control_socket: &Path) -> PathBuf {
        let mut name = control_socket.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn acquire(path: &Path) -> Result<Self, RecorderError> {
        // One retry after clearing a stale lock.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let owner = fs::read_to_string(path)
                        .ok()
                        .and_then(|s| s.trim().parse::<libc::pid_t>().ok());
                    match owner {
                        Some(pid) if process_alive(pid) => {
                            return Err(RecorderError::SessionActive(format!(
                                "pid {} holds {}",
                                pid,
                                path.display()
                            )));
                        }
                        _ => {
                            tracing::warn!("Removing stale session lock {}", path.display());
                            match fs::remove_file(path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RecorderError::SessionActive(format!(
            "lost the race for {}",
            path.display()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove session lock {}: {}", self.path.display(), e);
        }
    }
}

/// Marker left next to the control socket while a session has left the
/// emulator clock frozen.
pub fn clock_marker_path(control_socket: &Path) -> PathBuf {
    let mut name = control_socket.as_os_str().to_owned();
    name.push(".frozen");
    PathBuf::from(name)
}

/// One recording session against one emulator instance.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    capture_dir: PathBuf,
    pid_file: PathBuf,
    clock_marker: PathBuf,
    _lock: SessionLock,
}

impl Session {
    /// Claim the emulator behind `control_socket` for a new session.
    ///
    /// # Errors
    ///
    /// [`RecorderError::SessionActive`] if another live session holds it.
    pub fn begin(
        control_socket: &Path,
        capture_dir: impl Into<PathBuf>,
        pid_file: impl Into<PathBuf>,
    ) -> Result<Self, RecorderError> {
        let lock = SessionLock::acquire(&SessionLock::path_for(control_socket))?;
        Ok(Self {
            state: SessionState::Idle,
            capture_dir: capture_dir.into(),
            pid_file: pid_file.into(),
            clock_marker: clock_marker_path(control_socket),
            _lock: lock,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn capture_dir(&self) -> &Path {
        &self.capture_dir
    }

    /// Reset the capture directory.
    pub fn prepare(&self) -> Result<(), RecorderError> {
        prepare_capture_dir(&self.capture_dir)
    }

    /// Whether an earlier session left the emulator clock frozen.
    pub fn clock_frozen(&self) -> bool {
        self.clock_marker.exists()
    }

    /// Remember the clock state for whichever session attaches next.
    pub fn record_clock_state(&self, frozen: bool) -> Result<(), RecorderError> {
        if frozen {
            fs::write(&self.clock_marker, std::process::id().to_string())?;
            return Ok(());
        }
        match fs::remove_file(&self.clock_marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the emulator handle from the configured pid file.
    pub fn locate_emulator(&self) -> Result<EmulatorHandle, RecorderError> {
        locate_emulator(&self.pid_file)
    }

    /// Move to `next`, which must be the immediate successor state.
    pub fn transition(&mut self, next: SessionState) -> Result<(), RecorderError> {
        if self.state.successor() != Some(next) {
            return Err(RecorderError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Jump straight to `Stopped` after a fatal error.
    pub fn abort(&mut self) {
        if self.state != SessionState::Stopped {
            tracing::debug!("Session {:?} aborted", self.state);
            self.state = SessionState::Stopped;
        }
    }
}
