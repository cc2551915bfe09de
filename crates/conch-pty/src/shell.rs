//! Launching the shell on the subordinate side, and signalling/reaping it.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use portable_pty::{Child, CommandBuilder, ExitStatus, SlavePty};

use crate::config::ResolvedConfig;
use crate::error::SpawnError;

/// How often a bounded wait re-checks the child.
const REAP_POLL: Duration = Duration::from_millis(10);

/// Extra time given to a child after `SIGKILL` before we stop waiting on it.
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Launch the configured shell with `slave` as its controlling terminal and
/// stdin/stdout/stderr.
pub fn spawn(
    slave: &(dyn SlavePty + Send),
    config: &ResolvedConfig,
) -> Result<Box<dyn Child + Send + Sync>, SpawnError> {
    check_shell(&config.shell)?;
    check_working_dir(&config.working_dir)?;

    let mut cmd = CommandBuilder::new(&config.shell);
    cmd.cwd(&config.working_dir);
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    let child = slave
        .spawn_command(cmd)
        .map_err(|e| SpawnError::Launch(e.to_string()))?;

    info!(
        "spawned {} (pid {:?}) in {}",
        config.shell.display(),
        child.process_id(),
        config.working_dir.display()
    );
    Ok(child)
}

fn check_shell(shell: &Path) -> Result<(), SpawnError> {
    let missing = if shell.as_os_str().is_empty() {
        true
    } else if shell.components().count() > 1 {
        !shell.is_file()
    } else {
        // Bare names are resolved through PATH by the spawner.
        false
    };
    if missing {
        return Err(SpawnError::ShellNotFound(shell.to_path_buf()));
    }
    Ok(())
}

fn check_working_dir(dir: &Path) -> Result<(), SpawnError> {
    // Existence only: search permission is the spawner's to report.
    let metadata = std::fs::metadata(dir).map_err(|source| SpawnError::WorkingDirectory {
        path: dir.to_path_buf(),
        source,
    })?;
    if !metadata.is_dir() {
        return Err(SpawnError::WorkingDirectory {
            path: dir.to_path_buf(),
            source: std::io::Error::from_raw_os_error(libc::ENOTDIR),
        });
    }
    Ok(())
}

/// Send `signal` to a single process.
pub fn signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Send `signal` to every process in a process group.
pub fn signal_group(pgid: libc::pid_t, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: killpg(2) has no memory-safety preconditions.
    if unsafe { libc::killpg(pgid, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Exit code of a finished child. A child ended by a signal has none.
pub fn exit_code(status: &ExitStatus) -> Option<u32> {
    match status.signal() {
        Some(signal) => {
            debug!("child terminated by {signal}");
            None
        }
        None => Some(status.exit_code()),
    }
}

/// Wait up to `timeout` for the child to exit on its own.
///
/// Returns `Some(code)` once it has exited, `None` if it is still running.
/// The inner code is `None` when the child was killed by a signal.
pub fn wait_timeout(child: &mut (dyn Child + Send + Sync), timeout: Duration) -> Option<Option<u32>> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(exit_code(&status)),
            Ok(None) => {}
            // The child can no longer be queried; treat it as gone.
            Err(e) => {
                warn!("failed to query child status: {e}");
                return Some(None);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(REAP_POLL);
    }
}

/// Terminate and reap the child.
///
/// Sends `SIGHUP` (what a closing terminal delivers), waits up to `grace`,
/// then escalates to `SIGKILL`. Returns the exit code if the child exited
/// normally; a signal death yields `None`. After escalation the child is considered ended whether or not it
/// acknowledged.
pub fn terminate(child: &mut (dyn Child + Send + Sync), grace: Duration) -> Option<u32> {
    if let Ok(Some(status)) = child.try_wait() {
        return exit_code(&status);
    }

    let pid = child.process_id();
    match pid {
        Some(pid) => {
            if let Err(e) = signal(pid, libc::SIGHUP) {
                debug!("SIGHUP to {pid} failed: {e}");
            }
        }
        None => {
            // No pid to signal; fall back to the spawner's own kill.
            if let Err(e) = child.kill() {
                warn!("failed to kill child: {e}");
            }
        }
    }

    if let Some(code) = wait_timeout(child, grace) {
        return code;
    }

    warn!("child {pid:?} ignored SIGHUP for {grace:?}, sending SIGKILL");
    match pid {
        Some(pid) => {
            if let Err(e) = signal(pid, libc::SIGKILL) {
                warn!("SIGKILL to {pid} failed: {e}");
            }
        }
        None => {
            let _ = child.kill();
        }
    }
    wait_timeout(child, KILL_WAIT).flatten()
}
