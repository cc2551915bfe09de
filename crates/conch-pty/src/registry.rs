use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::info;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::hub::Subscription;
use crate::session::{Session, SessionId};

/// Keeps independent sessions addressable by id for a front end.
///
/// The registry owns every session it starts; `stop_session` (or dropping the
/// registry) is what ends a shell. Front ends hold ids and subscriptions,
/// never the sessions themselves.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a new session and return its ID.
    pub fn start_session(&self, config: SessionConfig) -> Result<SessionId, SessionError> {
        let session = Session::spawn(config)?;
        let id = session.id();
        self.lock().insert(id, Arc::new(session));
        info!("registered session {id}");
        Ok(id)
    }

    /// Get a handle to a session by ID.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.lock().get(&id).cloned()
    }

    pub fn send_input(&self, id: SessionId, data: &[u8]) -> Result<(), SessionError> {
        self.require(id)?.send_input(data)
    }

    pub fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.require(id)?.resize(cols, rows)
    }

    pub fn subscribe(&self, id: SessionId) -> Result<Subscription, SessionError> {
        Ok(self.require(id)?.subscribe())
    }

    /// Stop a session and forget it. Unknown or already-stopped IDs are fine.
    pub fn stop_session(&self, id: SessionId) {
        // Take it out first so the map lock isn't held while the shell exits.
        let session = self.lock().remove(&id);
        if let Some(session) = session {
            session.stop();
        }
    }

    /// Stop every session.
    pub fn stop_all(&self) {
        let sessions: Vec<Arc<Session>> = self.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.stop();
        }
    }

    /// List all session IDs.
    pub fn list_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    fn require(&self, id: SessionId) -> Result<Arc<Session>, SessionError> {
        self.get(id).ok_or(SessionError::NotFound(id))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::OutputEvent;
    use crate::session::SessionState;
    use std::time::{Duration, Instant};

    fn sh() -> SessionConfig {
        SessionConfig::new(80, 24).shell("/bin/sh")
    }

    #[test]
    fn test_start_and_list_sessions() {
        let registry = SessionRegistry::new();

        let id1 = registry.start_session(sh()).unwrap();
        let id2 = registry.start_session(sh()).unwrap();

        assert_ne!(id1, id2);
        let mut expected = vec![id1, id2];
        expected.sort();
        assert_eq!(registry.list_sessions(), expected);
    }

    #[test]
    fn test_get_session() {
        let registry = SessionRegistry::new();
        let id = registry.start_session(sh()).unwrap();

        assert!(registry.get(id).is_some());
        assert!(registry.get(u64::MAX).is_none());
    }

    #[test]
    fn test_unknown_session() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.send_input(42_000, b"x"),
            Err(SessionError::NotFound(42_000))
        ));
        assert!(matches!(registry.resize(42_000, 80, 24), Err(SessionError::NotFound(_))));
        assert!(matches!(registry.subscribe(42_000), Err(SessionError::NotFound(_))));
        // Stopping a non-existent session should not panic.
        registry.stop_session(42_000);
    }

    #[test]
    fn test_stop_session() {
        let registry = SessionRegistry::new();
        let id = registry.start_session(sh()).unwrap();
        let session = registry.get(id).unwrap();
        let mut sub = registry.subscribe(id).unwrap();

        registry.stop_session(id);
        registry.stop_session(id);

        assert!(registry.get(id).is_none());
        assert!(registry.list_sessions().is_empty());
        assert_eq!(session.state(), SessionState::Stopped);

        let mut last = None;
        while let Some(event) = sub.try_recv() {
            last = Some(event);
        }
        assert!(matches!(last, Some(OutputEvent::Exited(_))));
    }

    #[test]
    fn test_round_trip_through_ids() {
        let registry = SessionRegistry::new();
        let id = registry.start_session(sh()).unwrap();
        let mut sub = registry.subscribe(id).unwrap();

        registry.resize(id, 100, 30).unwrap();
        registry.send_input(id, b"echo $((6 * 7))\n").unwrap();

        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match sub.try_recv() {
                Some(event) => {
                    if let Some(b) = event.bytes() {
                        seen.extend_from_slice(b);
                    }
                    if String::from_utf8_lossy(&seen).contains("42") {
                        break;
                    }
                }
                None => std::thread::sleep(Duration::from_millis(10)),
            }
        }
        assert!(String::from_utf8_lossy(&seen).contains("42"));
    }

    #[test]
    fn test_failed_start_is_not_registered() {
        let registry = SessionRegistry::new();
        let err = registry
            .start_session(sh().shell("/no/such/shell"))
            .unwrap_err();
        assert!(matches!(err, SessionError::Start(_)));
        assert!(registry.list_sessions().is_empty());
    }

    #[test]
    fn test_stop_all() {
        let registry = SessionRegistry::new();
        let a = registry.start_session(sh()).unwrap();
        let b = registry.start_session(sh()).unwrap();
        let sessions = [registry.get(a).unwrap(), registry.get(b).unwrap()];

        registry.stop_all();

        assert!(registry.list_sessions().is_empty());
        for session in &sessions {
            assert_eq!(session.state(), SessionState::Stopped);
        }
    }
}
