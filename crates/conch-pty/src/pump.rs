//! Per-session output pump that drains the PTY master on a dedicated thread.
//!
//! PTY reads are blocking, so each session gets its own OS thread. The thread
//! owns a duplicated master descriptor and waits on it with `poll(2)` in short
//! slices, checking a cancel flag between slices. Stopping a session therefore
//! never depends on the shell producing more output or closing its side.

use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::config::OutputEncoding;
use crate::decoder::Utf8Chunker;
use crate::hub::OutputEvent;
use crate::session::SessionId;

/// Upper bound on how long a cancelled pump can stay blocked.
const POLL_SLICE: Duration = Duration::from_millis(50);

const READ_BUF_SIZE: usize = 64 * 1024;

/// Why the pump loop ended.
#[derive(Debug)]
pub enum PumpEnd {
    /// The shell side closed (read returned 0 or `EIO`).
    Eof,
    /// The session asked the pump to stop.
    Cancelled,
    /// Reading failed for another reason.
    Failed(io::Error),
}

/// Where the pump delivers what it reads.
pub trait OutputSink: Send + Sync + 'static {
    /// Called for every chunk, in read order.
    fn publish(&self, event: OutputEvent);

    /// Called exactly once, from the pump thread, after the last `publish`.
    fn pump_finished(&self, end: PumpEnd);
}

/// Owner's side of a running pump.
#[derive(Debug)]
pub struct PumpHandle {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl PumpHandle {
    /// Ask the pump to stop at its next poll slice.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Wait for the pump thread to return.
    ///
    /// Joining from the pump thread itself would deadlock; that case returns
    /// immediately and the thread finishes on its own.
    pub fn join(self) {
        if self.thread.thread().id() == thread::current().id() {
            return;
        }
        if self.thread.join().is_err() {
            warn!("output pump thread panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Start the output pump for a session on a dedicated OS thread.
pub fn start_output_pump(
    session_id: SessionId,
    reader: File,
    encoding: OutputEncoding,
    sink: Arc<dyn OutputSink>,
) -> io::Result<PumpHandle> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);

    let thread = thread::Builder::new()
        .name(format!("pty-io-{session_id}"))
        .spawn(move || {
            let mut chunker = Utf8Chunker::new(encoding);
            let end = pump_loop(&reader, &mut chunker, sink.as_ref(), &flag);

            // Closing: whatever is still held back goes out as raw bytes.
            if let Some(rest) = chunker.finish() {
                sink.publish(OutputEvent::Undecodable(rest));
            }
            drop(reader);
            debug!("output pump for session {session_id} ended: {end:?}");
            sink.pump_finished(end);
        })?;

    Ok(PumpHandle { cancel, thread })
}

fn pump_loop(
    mut reader: &File,
    chunker: &mut Utf8Chunker,
    sink: &dyn OutputSink,
    cancel: &AtomicBool,
) -> PumpEnd {
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        if cancel.load(Ordering::Acquire) {
            return PumpEnd::Cancelled;
        }

        match wait_readable(reader, POLL_SLICE) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return PumpEnd::Failed(e),
        }

        let n = match reader.read(&mut buf) {
            Ok(0) => return PumpEnd::Eof,
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                continue
            }
            // Linux reports a closed subordinate side as EIO rather than EOF.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => return PumpEnd::Eof,
            Err(e) => return PumpEnd::Failed(e),
        };

        let chunk = chunker.push(&buf[..n]);
        if !chunk.is_empty() {
            sink.publish(OutputEvent::Data(chunk));
        }
    }
}

/// Wait until `file` is readable (or hung up), for at most `timeout`.
fn wait_readable(file: &File, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

    // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if rc == 0 {
        return Ok(false);
    }
    if pfd.revents & libc::POLLNVAL != 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    // POLLIN, POLLHUP or POLLERR: the next read reports which.
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::{FromRawFd, OwnedFd};
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<OutputEvent>>,
        end: Mutex<Option<PumpEnd>>,
    }

    impl OutputSink for RecordingSink {
        fn publish(&self, event: OutputEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn pump_finished(&self, end: PumpEnd) {
            *self.end.lock().unwrap() = Some(end);
        }
    }

    fn pipe() -> (File, File) {
        let mut fds = [0; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        // SAFETY: both descriptors were just created and are owned by nobody else.
        let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        (File::from(r), File::from(w))
    }

    fn start(reader: File, encoding: OutputEncoding) -> (Arc<RecordingSink>, PumpHandle) {
        let sink = Arc::new(RecordingSink::default());
        let handle = start_output_pump(0, reader, encoding, sink.clone()).unwrap();
        (sink, handle)
    }

    #[test]
    fn test_eof_after_data() {
        let (reader, mut writer) = pipe();
        let (sink, handle) = start(reader, OutputEncoding::Utf8);

        writer.write_all(b"hello\r\n").unwrap();
        drop(writer);
        handle.join();

        let events = sink.events.lock().unwrap();
        let bytes: Vec<u8> = events.iter().filter_map(|e| e.bytes()).flatten().copied().collect();
        assert_eq!(bytes, b"hello\r\n");
        assert!(matches!(*sink.end.lock().unwrap(), Some(PumpEnd::Eof)));
    }

    #[test]
    fn test_split_character_across_writes() {
        let (reader, mut writer) = pipe();
        let (sink, handle) = start(reader, OutputEncoding::Utf8);

        let text = "na\u{ef}ve \u{1F980}".as_bytes();
        let cut = text.len() - 3;
        writer.write_all(&text[..cut]).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        writer.write_all(&text[cut..]).unwrap();
        drop(writer);
        handle.join();

        let events = sink.events.lock().unwrap();
        for event in events.iter() {
            match event {
                OutputEvent::Data(chunk) => {
                    assert!(std::str::from_utf8(chunk).is_ok(), "split chunk: {chunk:?}")
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        let bytes: Vec<u8> = events.iter().filter_map(|e| e.bytes()).flatten().copied().collect();
        assert_eq!(bytes, text);
    }

    #[test]
    fn test_incomplete_tail_flushed_as_undecodable() {
        let (reader, mut writer) = pipe();
        let (sink, handle) = start(reader, OutputEncoding::Utf8);

        writer.write_all(&[b'o', b'k', 0xF0, 0x9F]).unwrap();
        drop(writer);
        handle.join();

        let events = sink.events.lock().unwrap();
        assert_eq!(events.first(), Some(&OutputEvent::Data(b"ok".to_vec())));
        assert_eq!(events.last(), Some(&OutputEvent::Undecodable(vec![0xF0, 0x9F])));
    }

    #[test]
    fn test_cancel_unblocks_idle_pump() {
        let (reader, _writer) = pipe();
        let (sink, handle) = start(reader, OutputEncoding::Binary);

        std::thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        handle.cancel();
        handle.join();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(*sink.end.lock().unwrap(), Some(PumpEnd::Cancelled)));
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_read_error_ends_pump_as_failure() {
        // A directory polls readable but cannot be read.
        let dir = tempfile::tempdir().unwrap();
        let reader = File::open(dir.path()).unwrap();
        let (sink, handle) = start(reader, OutputEncoding::Utf8);
        handle.join();

        match &*sink.end.lock().unwrap() {
            Some(PumpEnd::Failed(e)) => assert_eq!(e.raw_os_error(), Some(libc::EISDIR)),
            other => panic!("expected a read failure, got {other:?}"),
        }
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_thread_is_named() {
        let (reader, writer) = pipe();
        let (_sink, handle) = start(reader, OutputEncoding::Utf8);
        assert_eq!(handle.thread.thread().name(), Some("pty-io-0"));
        drop(writer);
        handle.join();
    }
}
