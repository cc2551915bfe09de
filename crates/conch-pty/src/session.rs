use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use portable_pty::{Child, MasterPty};
use tokio::sync::watch;

use crate::config::{ResolvedConfig, SessionConfig, TermSize};
use crate::error::{SessionError, StartError, StreamError};
use crate::hub::{OutputEvent, Subscription, SubscriptionHub};
use crate::pty::{self, AllocatedPty};
use crate::pump::{self, OutputSink, PumpEnd, PumpHandle};
use crate::shell;
use crate::writer::{InputWriter, WriteOutcome};

/// Unique identifier for a terminal session.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a session. Only the session itself moves between states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed(String),
}

impl SessionState {
    /// Whether the session has ended for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed(_))
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::NotStarted => write!(f, "not started"),
            SessionState::Starting => write!(f, "starting"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// The OS handles a running session owns. Nothing outside the session
/// touches these; the pump and writer get narrower capabilities.
struct PtyResources {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

/// State guarded by the session's single lock.
struct Core {
    state: SessionState,
    hub: SubscriptionHub,
    pty: Option<PtyResources>,
    pump: Option<PumpHandle>,
    child_pid: Option<u32>,
    size: TermSize,
    exit_code: Option<u32>,
}

/// What ended a running session.
enum Termination {
    Requested,
    ChildExited,
    Failed(io::Error),
}

struct Shared {
    id: SessionId,
    config: ResolvedConfig,
    core: Mutex<Core>,
    /// Signalled on every state transition.
    settled: Condvar,
    writer: InputWriter,
    state_tx: watch::Sender<SessionState>,
}

/// A shell running on a pseudo-terminal.
///
/// The caller that creates a `Session` owns the shell process: dropping the
/// handle stops it. Consumers that only render output should hold a
/// [`Subscription`] instead.
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Create a session in the `NotStarted` state.
    pub fn new(config: SessionConfig) -> Self {
        let config = config.resolve();
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let (state_tx, _) = watch::channel(SessionState::NotStarted);

        let core = Core {
            state: SessionState::NotStarted,
            hub: SubscriptionHub::new(
                config.history_capacity,
                config.encoding,
                config.subscriber_queue,
            ),
            pty: None,
            pump: None,
            child_pid: None,
            size: config.size,
            exit_code: None,
        };

        Self {
            shared: Arc::new(Shared {
                id,
                config,
                core: Mutex::new(core),
                settled: Condvar::new(),
                writer: InputWriter::closed(),
                state_tx,
            }),
        }
    }

    /// Create and start a session in one step.
    pub fn spawn(config: SessionConfig) -> Result<Self, StartError> {
        let session = Self::new(config);
        session.start()?;
        Ok(session)
    }

    /// Returns the session's unique identifier.
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// The configuration the session was created with, defaults applied.
    pub fn config(&self) -> &ResolvedConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock_core().state.clone()
    }

    /// Watch lifecycle transitions. `Running` is the "started" notification.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Pid of the shell, until it has been reaped.
    pub fn child_pid(&self) -> Option<u32> {
        self.shared.lock_core().child_pid
    }

    /// Current window size.
    pub fn size(&self) -> TermSize {
        self.shared.lock_core().size
    }

    /// The shell's exit code, once it has been reaped and one was reported.
    pub fn exit_code(&self) -> Option<u32> {
        self.shared.lock_core().exit_code
    }

    /// Allocate the PTY, spawn the shell and start pumping output.
    ///
    /// Only valid from `NotStarted`. On failure every partially acquired
    /// resource is released and the session ends in `Failed`.
    pub fn start(&self) -> Result<(), StartError> {
        let shared = &self.shared;
        {
            let mut core = shared.lock_core();
            if core.state != SessionState::NotStarted {
                return Err(StartError::InvalidState(core.state.clone()));
            }
            shared.transition(&mut core, SessionState::Starting);
        }

        match Shared::launch(shared) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("session {} failed to start: {e}", shared.id);
                let mut core = shared.lock_core();
                core.hub
                    .close(OutputEvent::Error(StreamError::StartFailed(e.to_string())));
                shared.transition(&mut core, SessionState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Write raw bytes to the shell's input.
    pub fn send_input(&self, data: &[u8]) -> Result<(), SessionError> {
        self.shared.require_running("write")?;

        match self.shared.writer.write(data) {
            WriteOutcome::Written => Ok(()),
            WriteOutcome::Closed => Err(SessionError::InvalidState {
                operation: "write",
                state: self.state(),
            }),
            WriteOutcome::Failed(e) => {
                // EIO means the shell already went away; the pump reports the exit.
                if e.raw_os_error() != Some(libc::EIO) {
                    let copy = io::Error::new(e.kind(), e.to_string());
                    self.shared.shut_down(Termination::Failed(copy), true);
                }
                Err(SessionError::Io(e))
            }
        }
    }

    /// Change the window size and notify the shell's foreground process group.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let mut core = self.shared.lock_core();
        if core.state != SessionState::Running {
            return Err(SessionError::InvalidState {
                operation: "resize",
                state: core.state.clone(),
            });
        }
        let size = TermSize::new(cols, rows);
        let Some(res) = core.pty.as_ref() else {
            return Err(SessionError::InvalidState {
                operation: "resize",
                state: core.state.clone(),
            });
        };

        pty::resize(res.master.as_ref(), size)?;
        if let Some(pgrp) = res.master.process_group_leader() {
            if let Err(e) = shell::signal_group(pgrp, libc::SIGWINCH) {
                debug!("SIGWINCH to group {pgrp} failed: {e}");
            }
        }
        core.size = size;
        debug!("session {} resized to {cols}x{rows}", self.shared.id);
        Ok(())
    }

    /// Subscribe to the output stream, starting with a replay of recent history.
    pub fn subscribe(&self) -> Subscription {
        self.shared.lock_core().hub.subscribe()
    }

    /// Stop the shell and release the PTY.
    ///
    /// Returns once the child has been reaped and the terminal event has been
    /// delivered; no output arrives after that. Calling it again, from any
    /// thread, waits for the same outcome and returns.
    pub fn stop(&self) {
        self.shared.shut_down(Termination::Requested, true);
    }

    /// Block until the session has ended or `timeout` elapses.
    ///
    /// Returns the final state, or `None` on timeout.
    pub fn wait(&self, timeout: Duration) -> Option<SessionState> {
        let deadline = Instant::now() + timeout;
        let mut core = self.shared.lock_core();
        while !core.state.is_terminal() {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            core = self
                .shared
                .settled
                .wait_timeout(core, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        Some(core.state.clone())
    }

    #[cfg(test)]
    pub(crate) fn replace_writer(&self, writer: Box<dyn std::io::Write + Send>) {
        self.shared.writer.attach(writer);
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: SessionState) {
        let mut core = self.shared.lock_core();
        self.shared.transition(&mut core, state);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait_settled<'a>(&self, core: MutexGuard<'a, Core>) -> MutexGuard<'a, Core> {
        self.settled
            .wait(core)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, core: &mut Core, next: SessionState) {
        info!("session {}: {} -> {}", self.id, core.state, next);
        core.state = next.clone();
        self.state_tx.send_replace(next);
        self.settled.notify_all();
    }

    fn require_running(&self, operation: &'static str) -> Result<(), SessionError> {
        let core = self.lock_core();
        if core.state == SessionState::Running {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: core.state.clone(),
            })
        }
    }

    fn launch(this: &Arc<Self>) -> Result<(), StartError> {
        let config = &this.config;
        let AllocatedPty { master, slave, .. } = pty::allocate(config.size)?;
        let mut child = shell::spawn(slave.as_ref(), config)?;
        // The shell holds its own copies; ours would keep EOF from arriving.
        drop(slave);

        let wiring = pty::open_reader(master.as_ref()).and_then(|reader| {
            let writer = master
                .take_writer()
                .map_err(|e| io::Error::other(format!("failed to take PTY writer: {e}")))?;
            Ok((reader, writer))
        });
        let (reader, writer) = match wiring {
            Ok(pair) => pair,
            Err(e) => {
                shell::terminate(child.as_mut(), config.shutdown_grace);
                return Err(StartError::Pump(e));
            }
        };
        this.writer.attach(writer);

        // Hold the lock across pump start so its first event sees `Running`.
        let mut core = this.lock_core();
        let sink: Arc<dyn OutputSink> = Arc::clone(this) as Arc<dyn OutputSink>;
        let pump = match pump::start_output_pump(this.id, reader, config.encoding, sink) {
            Ok(pump) => pump,
            Err(e) => {
                drop(core);
                this.writer.close();
                shell::terminate(child.as_mut(), config.shutdown_grace);
                return Err(StartError::Pump(e));
            }
        };

        core.child_pid = child.process_id();
        core.pty = Some(PtyResources { master, child });
        core.pump = Some(pump);
        this.transition(&mut core, SessionState::Running);
        Ok(())
    }

    /// Tear the session down. The first caller to move the session out of
    /// `Running` does the work; callers that `wait` block until it is done.
    fn shut_down(&self, why: Termination, wait: bool) {
        let (resources, pump) = {
            let mut core = self.lock_core();
            loop {
                match core.state {
                    SessionState::Running => break,
                    SessionState::NotStarted => {
                        if matches!(why, Termination::Requested) {
                            core.hub.close(OutputEvent::Exited(None));
                            self.transition(&mut core, SessionState::Stopped);
                        }
                        return;
                    }
                    SessionState::Starting | SessionState::Stopping if wait => {
                        core = self.wait_settled(core);
                    }
                    _ => return,
                }
            }
            self.transition(&mut core, SessionState::Stopping);
            (core.pty.take(), core.pump.take())
        };

        if let Some(pump) = pump {
            pump.cancel();
            pump.join();
        }

        let grace = self.config.shutdown_grace;
        let code = resources.and_then(|mut res| {
            let code = match why {
                // The shell closed its side; give it a moment to finish exiting.
                Termination::ChildExited => shell::wait_timeout(res.child.as_mut(), grace)
                    .unwrap_or_else(|| shell::terminate(res.child.as_mut(), grace)),
                _ => shell::terminate(res.child.as_mut(), grace),
            };
            drop(res.master);
            code
        });
        self.writer.close();

        let mut core = self.lock_core();
        core.child_pid = None;
        core.exit_code = code;
        match why {
            Termination::Requested | Termination::ChildExited => {
                info!("session {} exited with {code:?}", self.id);
                core.hub.close(OutputEvent::Exited(code));
                self.transition(&mut core, SessionState::Stopped);
            }
            Termination::Failed(e) => {
                warn!("session {} failed: {e}", self.id);
                core.hub.close(OutputEvent::Error(StreamError::from(&e)));
                self.transition(&mut core, SessionState::Failed(e.to_string()));
            }
        }
    }
}

impl OutputSink for Shared {
    fn publish(&self, event: OutputEvent) {
        self.lock_core().hub.publish(event);
    }

    fn pump_finished(&self, end: PumpEnd) {
        // Never wait here: a concurrent `stop` may be joining this thread.
        match end {
            PumpEnd::Cancelled => {}
            PumpEnd::Eof => self.shut_down(Termination::ChildExited, false),
            PumpEnd::Failed(e) => self.shut_down(Termination::Failed(e), false),
        }
    }
}
