//! Serialized keystroke path into the PTY master.
//!
//! Bytes go to the shell exactly as submitted. There is no line editing and
//! no echo handling: the pseudo-terminal's line discipline echoes input
//! itself, and control bytes (`^C`, `^D`, ...) are the shell's to interpret.

use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard};

/// Exclusive writer over the PTY master.
///
/// Concurrent callers are serialized by the mutex; each submission is written
/// whole before the next one starts.
pub struct InputWriter {
    inner: Mutex<Option<Box<dyn Write + Send>>>,
}

/// Outcome of a write attempt.
#[derive(Debug)]
pub enum WriteOutcome {
    Written,
    /// The writer was already closed by session teardown.
    Closed,
    Failed(io::Error),
}

impl InputWriter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Mutex::new(Some(writer)),
        }
    }

    /// A writer that rejects everything, for sessions that never started.
    pub fn closed() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Install the PTY writer once the session is live.
    pub fn attach(&self, writer: Box<dyn Write + Send>) {
        *self.lock() = Some(writer);
    }

    pub fn write(&self, data: &[u8]) -> WriteOutcome {
        let mut guard = self.lock();
        let Some(writer) = guard.as_mut() else {
            return WriteOutcome::Closed;
        };
        if data.is_empty() {
            return WriteOutcome::Written;
        }
        match writer.write_all(data).and_then(|()| writer.flush()) {
            Ok(()) => WriteOutcome::Written,
            Err(e) => WriteOutcome::Failed(e),
        }
    }

    /// Drop the underlying writer. Later writes report [`WriteOutcome::Closed`].
    pub fn close(&self) {
        self.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn Write + Send>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
