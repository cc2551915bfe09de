//! Session configuration captured at start and immutable afterwards.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default history retained for late subscribers (64 KiB).
pub const DEFAULT_HISTORY_CAPACITY: usize = 64 * 1024;

/// Default number of events a subscriber may have queued before it is severed.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 1024;

/// Default time a shell gets to exit after `SIGHUP` before `SIGKILL`.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// How the output stream is chunked before delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputEncoding {
    /// Chunks always end on a complete UTF-8 character.
    #[default]
    Utf8,
    /// Bytes are delivered exactly as read.
    Binary,
}

/// Everything needed to start a session.
///
/// Deserializable so a front end can pass a session request straight through;
/// every field is optional on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell binary. `None` uses `$SHELL`, falling back to `/bin/sh`.
    pub shell: Option<PathBuf>,
    /// Directory the shell starts in. `None` uses the current directory.
    pub working_dir: Option<PathBuf>,
    /// Variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    pub size: TermSize,
    pub encoding: OutputEncoding,
    pub history_capacity: usize,
    pub subscriber_queue: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: None,
            working_dir: None,
            env: BTreeMap::new(),
            size: TermSize::default(),
            encoding: OutputEncoding::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl SessionConfig {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            size: TermSize::new(cols, rows),
            ..Self::default()
        }
    }

    pub fn shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn encoding(mut self, encoding: OutputEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn history_capacity(mut self, bytes: usize) -> Self {
        self.history_capacity = bytes;
        self
    }

    pub fn subscriber_queue(mut self, events: usize) -> Self {
        self.subscriber_queue = events;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Fill in the documented defaults for every unset field.
    pub fn resolve(&self) -> ResolvedConfig {
        let shell = self.shell.clone().unwrap_or_else(default_shell);
        let working_dir = self
            .working_dir
            .clone()
            .unwrap_or_else(default_working_dir);

        let mut env = self.env.clone();
        env.entry("TERM".to_string())
            .or_insert_with(|| "xterm-256color".to_string());

        ResolvedConfig {
            shell,
            working_dir,
            env,
            size: self.size,
            encoding: self.encoding,
            history_capacity: self.history_capacity,
            subscriber_queue: self.subscriber_queue.max(1),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

/// A [`SessionConfig`] with all defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub shell: PathBuf,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub size: TermSize,
    pub encoding: OutputEncoding,
    pub history_capacity: usize,
    pub subscriber_queue: usize,
    pub shutdown_grace: Duration,
}

/// Returns the user's default shell, falling back to `/bin/sh`.
pub fn default_shell() -> PathBuf {
    std::env::var_os("SHELL")
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/bin/sh"))
}

fn default_working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.size, TermSize::new(80, 24));
        assert_eq!(config.encoding, OutputEncoding::Utf8);
        assert_eq!(config.history_capacity, 64 * 1024);
        assert!(config.shell.is_none());
    }

    #[test]
    fn test_resolve_applies_defaults() {
        let resolved = SessionConfig::new(100, 30).resolve();
        assert!(!resolved.shell.as_os_str().is_empty());
        assert_eq!(resolved.size, TermSize::new(100, 30));
        assert_eq!(resolved.env.get("TERM").map(String::as_str), Some("xterm-256color"));
        assert_eq!(resolved.shutdown_grace, Duration::from_millis(2000));
    }

    #[test]
    fn test_explicit_term_is_kept() {
        let resolved = SessionConfig::default().env("TERM", "dumb").resolve();
        assert_eq!(resolved.env.get("TERM").map(String::as_str), Some("dumb"));
    }

    #[test]
    fn test_zero_queue_is_clamped() {
        let resolved = SessionConfig::default().subscriber_queue(0).resolve();
        assert_eq!(resolved.subscriber_queue, 1);
    }

    #[test]
    fn test_deserialize_partial_request() {
        let config: SessionConfig = serde_json::from_str(
            r#"{
                "shell": "/bin/sh",
                "working_dir": "/tmp",
                "size": { "cols": 132, "rows": 43 },
                "encoding": "binary",
                "env": { "LANG": "C.UTF-8" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.shell, Some(PathBuf::from("/bin/sh")));
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(config.size, TermSize::new(132, 43));
        assert_eq!(config.encoding, OutputEncoding::Binary);
        assert_eq!(config.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert_eq!(config.subscriber_queue, DEFAULT_SUBSCRIBER_QUEUE);
    }
}
