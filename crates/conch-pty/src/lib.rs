//! conch-pty: shell sessions on pseudo-terminals.
//!
//! This crate spawns a shell attached to a PTY, streams its raw output to any
//! number of subscribers while accepting keystrokes, and owns the shell's
//! lifecycle from start to reap. Interpreting escape sequences is left to
//! whoever renders the output.
//!
//! # Architecture
//!
//! - [`pty`]: Allocating the master/subordinate pair, resizing.
//! - [`shell`]: Spawning the shell on the subordinate side; signalling and reaping it.
//! - [`pump`]: Dedicated reader thread that drains the master.
//! - [`InputWriter`]: Serialized write path for keystrokes.
//! - [`SubscriptionHub`]: Fan-out with bounded replay and per-subscriber queues.
//! - [`Session`]: The state machine tying the above together.
//! - [`SessionRegistry`]: Independent sessions addressed by ID.
//!
//! Unix only.

pub mod config;
pub mod decoder;
pub mod error;
pub mod history;
pub mod hub;
pub mod pty;
pub mod pump;
pub mod registry;
pub mod session;
pub mod shell;
pub mod writer;

pub use config::{OutputEncoding, SessionConfig, TermSize};
pub use error::{AllocationError, SessionError, SpawnError, StartError, StreamError};
pub use hub::{OutputEvent, Subscription, SubscriptionHub};
pub use registry::SessionRegistry;
pub use session::{Session, SessionId, SessionState};
pub use writer::InputWriter;
