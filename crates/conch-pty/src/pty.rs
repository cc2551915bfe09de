use std::fs::File;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::PathBuf;

use log::debug;
use portable_pty::{native_pty_system, MasterPty, PtySize, SlavePty};

use crate::config::TermSize;
use crate::error::AllocationError;

/// A freshly opened pseudo-terminal pair.
pub struct AllocatedPty {
    pub master: Box<dyn MasterPty + Send>,
    /// Subordinate side. Hand it to the shell, then drop it so the master
    /// observes EOF when the shell exits.
    pub slave: Box<dyn SlavePty + Send>,
    /// Device path of the subordinate side, when the OS reports one.
    pub tty_path: Option<PathBuf>,
}

impl std::fmt::Debug for AllocatedPty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatedPty")
            .field("tty_path", &self.tty_path)
            .finish_non_exhaustive()
    }
}

/// Open a new pseudo-terminal with the subordinate sized to `size`.
pub fn allocate(size: TermSize) -> Result<AllocatedPty, AllocationError> {
    let pty_system = native_pty_system();

    let pair = pty_system
        .openpty(pty_size(size))
        .map_err(|e| AllocationError(e.to_string()))?;

    let tty_path = pair.master.tty_name();
    debug!(
        "allocated PTY {} at {}x{}",
        tty_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<unnamed>".to_string()),
        size.cols,
        size.rows
    );

    Ok(AllocatedPty {
        master: pair.master,
        slave: pair.slave,
        tty_path,
    })
}

/// Duplicate the master descriptor into an independently owned, pollable reader.
///
/// The pump owns this copy outright, so it never borrows the master handle and
/// closing it does not affect the master's own descriptor.
pub fn open_reader(master: &(dyn MasterPty + Send)) -> std::io::Result<File> {
    let fd = master.as_raw_fd().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "PTY master has no file descriptor",
        )
    })?;
    // SAFETY: `fd` belongs to `master`, which outlives this call; we only
    // borrow it long enough to dup it.
    let owned: OwnedFd = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;
    Ok(File::from(owned))
}

/// Apply a new window size to the pseudo-terminal.
pub fn resize(master: &(dyn MasterPty + Send), size: TermSize) -> std::io::Result<()> {
    master
        .resize(pty_size(size))
        .map_err(|e| std::io::Error::other(format!("PTY resize failed: {e}")))
}

/// Current window size as reported by the pseudo-terminal.
pub fn current_size(master: &(dyn MasterPty + Send)) -> std::io::Result<TermSize> {
    let size = master
        .get_size()
        .map_err(|e| std::io::Error::other(format!("PTY size query failed: {e}")))?;
    Ok(TermSize::new(size.cols, size.rows))
}

fn pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
