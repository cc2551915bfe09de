//! Fan-out of session output to independent subscribers.
//!
//! Each subscriber owns a bounded queue. Publishing never blocks: a subscriber
//! whose queue is full is severed and its stream ends with
//! [`StreamError::Overflow`], leaving the producer and every other subscriber
//! untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

use crate::config::OutputEncoding;
use crate::error::StreamError;
use crate::history::HistoryBuffer;

/// One item of a session's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// Output bytes, ending on a complete character when text is declared.
    Data(Vec<u8>),
    /// Trailing bytes that never formed a complete character, flushed at close.
    Undecodable(Vec<u8>),
    /// The shell exited. `None` when the exit status could not be obtained.
    Exited(Option<u32>),
    /// The session failed, or this subscriber was severed.
    Error(StreamError),
}

impl OutputEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutputEvent::Exited(_) | OutputEvent::Error(_))
    }

    /// Output bytes carried by this event, if any.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            OutputEvent::Data(b) | OutputEvent::Undecodable(b) => Some(b),
            _ => None,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<OutputEvent>,
    overflowed: Arc<AtomicBool>,
}

/// Broadcast point for one session's output.
///
/// Not internally synchronized: the session keeps it behind the same lock as
/// its state, so a final event can never race a late publish.
pub struct SubscriptionHub {
    history: HistoryBuffer,
    subscribers: Vec<Subscriber>,
    queue_bound: usize,
    terminal: Option<OutputEvent>,
    next_id: u64,
}

impl SubscriptionHub {
    pub fn new(history_capacity: usize, encoding: OutputEncoding, queue_bound: usize) -> Self {
        Self {
            history: HistoryBuffer::new(history_capacity, encoding),
            subscribers: Vec::new(),
            queue_bound: queue_bound.max(1),
            terminal: None,
            next_id: 1,
        }
    }

    /// Register a new subscriber, primed with the current history.
    pub fn subscribe(&mut self) -> Subscription {
        let replay = (!self.history.is_empty()).then(|| self.history.snapshot());
        // The replay gets a slot of its own so it never counts against the bound.
        let capacity = self.queue_bound + usize::from(replay.is_some());
        let (tx, rx) = mpsc::channel(capacity);
        let overflowed = Arc::new(AtomicBool::new(false));
        let id = self.next_id;
        self.next_id += 1;

        if let Some(bytes) = replay {
            let _ = tx.try_send(OutputEvent::Data(bytes));
        }

        match &self.terminal {
            // Stream already ended: replay, then the stored terminal event.
            Some(event) => {
                let _ = tx.try_send(event.clone());
            }
            None => self.subscribers.push(Subscriber {
                id,
                tx,
                overflowed: Arc::clone(&overflowed),
            }),
        }

        debug!("subscriber {id} attached ({} live)", self.subscribers.len());
        Subscription {
            id,
            rx,
            overflowed,
            finished: false,
        }
    }

    /// Record output in history and deliver it to every live subscriber.
    pub fn publish(&mut self, event: OutputEvent) {
        if self.terminal.is_some() {
            return;
        }
        if let Some(bytes) = event.bytes() {
            if bytes.is_empty() {
                return;
            }
            self.history.append(bytes);
        }
        self.fan_out(&event);
    }

    /// Deliver the terminal event and disconnect everyone. Later calls are ignored.
    pub fn close(&mut self, event: OutputEvent) {
        if self.terminal.is_some() {
            return;
        }
        self.fan_out(&event);
        self.subscribers.clear();
        self.terminal = Some(event);
    }

    pub fn is_closed(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    fn fan_out(&mut self, event: &OutputEvent) {
        self.subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("subscriber {} overflowed its queue, disconnecting", sub.id);
                sub.overflowed.store(true, Ordering::Release);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("subscriber {} went away", sub.id);
                false
            }
        });
    }
}

/// A consumer's cursor into a session's output.
///
/// The sequence is finite: it ends after an [`OutputEvent::Exited`] or
/// [`OutputEvent::Error`], and cannot be restarted.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<OutputEvent>,
    overflowed: Arc<AtomicBool>,
    finished: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. Returns `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        if self.finished {
            return None;
        }
        let next = self.rx.recv().await;
        self.advance(next)
    }

    /// Blocking variant of [`recv`](Self::recv) for use outside an async runtime.
    ///
    /// # Panics
    ///
    /// Panics if called within an asynchronous execution context.
    pub fn blocking_recv(&mut self) -> Option<OutputEvent> {
        if self.finished {
            return None;
        }
        let next = self.rx.blocking_recv();
        self.advance(next)
    }

    /// Take the next event if one is queued, without waiting.
    pub fn try_recv(&mut self) -> Option<OutputEvent> {
        if self.finished {
            return None;
        }
        match self.rx.try_recv() {
            Ok(event) => self.advance(Some(event)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.advance(None),
        }
    }

    /// Whether the terminal event has already been handed out.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn advance(&mut self, next: Option<OutputEvent>) -> Option<OutputEvent> {
        match next {
            Some(event) => {
                if event.is_terminal() {
                    self.finished = true;
                    self.rx.close();
                }
                Some(event)
            }
            None => {
                self.finished = true;
                if self.overflowed.load(Ordering::Acquire) {
                    Some(OutputEvent::Error(StreamError::Overflow))
                } else {
                    None
                }
            }
        }
    }
}

/// Blocks on each item.
///
/// # Panics
///
/// Like [`blocking_recv`](Subscription::blocking_recv), this panics if called
/// within an asynchronous execution context.
impl Iterator for Subscription {
    type Item = OutputEvent;

    fn next(&mut self) -> Option<OutputEvent> {
        self.blocking_recv()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}
