//! Error taxonomy for recording sessions.
//!
//! Every variant aborts the session; nothing is retried. The emulator failing
//! is treated as unrecoverable external state.

use std::io;

use crate::session::SessionState;

/// Errors surfaced by the recording engine.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// Control endpoint missing or refusing connections (emulator not listening yet).
    #[error("cannot connect to emulator control channel: {0}")]
    Connection(String),

    /// Write failure or lost connection mid-session.
    #[error("control channel transport failed: {0}")]
    Transport(String),

    /// Emulator process handle could not be resolved.
    #[error("emulator not found: {0}")]
    NotFound(String),

    /// Unexpected, missing or late message in the step or command protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Another session already owns this emulator instance.
    #[error("session already active: {0}")]
    SessionActive(String),

    /// Session lifecycle moved backwards or skipped a state.
    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Local filesystem or OS failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RecorderError {
    /// Process exit code reported by the CLI for this error.
    ///
    /// `0` is reserved for a cleanly finalized recording.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Connection(_) => 2,
            Self::Transport(_) => 3,
            Self::NotFound(_) => 4,
            Self::ProtocolViolation(_) => 5,
            Self::SessionActive(_) => 6,
            Self::InvalidTransition { .. } | Self::Config(_) | Self::Io(_) => 1,
        }
    }
}
