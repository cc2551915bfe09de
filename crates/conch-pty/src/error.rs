use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::session::{SessionId, SessionState};

/// The operating system refused to hand out a pseudo-terminal pair.
#[derive(Debug, Error)]
#[error("failed to allocate pseudo-terminal: {0}")]
pub struct AllocationError(pub String);

/// The shell could not be launched on the subordinate side.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("shell not found: {}", .0.display())]
    ShellNotFound(PathBuf),

    #[error("working directory {} is not accessible: {source}", .path.display())]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to launch shell: {0}")]
    Launch(String),
}

/// Why a `start` attempt did not produce a running session.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("cannot start a session that is {0}")]
    InvalidState(SessionState),

    #[error("failed to start output pump: {0}")]
    Pump(#[source] io::Error),
}

/// Errors returned synchronously by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("PTY I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error("session {0} not found")]
    NotFound(SessionId),
}

/// Terminal error carried by [`crate::OutputEvent::Error`].
///
/// Unlike the synchronous error types this one is `Clone`, since a single
/// failure is delivered to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("PTY I/O error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    #[error("subscriber fell behind and was disconnected")]
    Overflow,

    #[error("session failed to start: {0}")]
    StartFailed(String),
}

impl From<&io::Error> for StreamError {
    fn from(err: &io::Error) -> Self {
        StreamError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
