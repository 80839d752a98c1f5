//! Authenticated session table.
//!
//! Sessions are minted only after a successful authentication and are never
//! renewed; a client whose session expires must authenticate again. The
//! number of live sessions is capped, and the cap holds under concurrent
//! authentications because the count check and the insert happen under one
//! lock.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::DashMap;
use netpulse_common::auth::unix_now;
use rand::{rngs::OsRng, RngCore};

const SESSION_ID_BYTES: usize = 32;

/// An authenticated client session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Opaque random identifier (URL-safe base64)
    pub id:              String,
    pub client_pid:      u32,
    pub executable_path: String,
    pub created_at:      Instant,
    pub expires_at:      Instant,
    /// Expiry as Unix seconds, reported to the client
    pub expires_at_unix: u64,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Truncated id that is safe to put in logs
    pub fn log_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// First eight characters of a session id
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Thread-safe session table with a ceiling on live sessions
pub struct SessionManager {
    sessions:      DashMap<String, Session>,
    creation_lock: Mutex<()>,
    max_sessions:  usize,
    ttl:           Duration,
}

impl SessionManager {
    pub fn new(max_sessions: usize, ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            creation_lock: Mutex::new(()),
            max_sessions,
            ttl,
        }
    }

    /// Mints a session, or returns `None` when the ceiling is reached.
    ///
    /// Expired sessions are swept first so they do not count against the
    /// ceiling.
    pub fn create_session(&self, client_pid: u32, executable_path: &str) -> Option<Session> {
        self.sweep_expired();

        let _guard = self
            .creation_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if self.sessions.len() >= self.max_sessions {
            tracing::warn!(
                client_pid,
                max_sessions = self.max_sessions,
                "Session limit reached, rejecting new session"
            );
            return None;
        }

        let now = Instant::now();
        let session = Session {
            id: generate_session_id(),
            client_pid,
            executable_path: executable_path.to_string(),
            created_at: now,
            expires_at: now + self.ttl,
            expires_at_unix: unix_now() + self.ttl.as_secs(),
        };
        self.sessions.insert(session.id.clone(), session.clone());

        tracing::info!(
            session = session.log_id(),
            client_pid,
            active = self.sessions.len(),
            "Session created"
        );
        Some(session)
    }

    /// Returns the session if it exists and has not expired.
    /// An expired session is evicted on the spot.
    pub fn validate_session(&self, id: &str) -> Option<Session> {
        let session = self.sessions.get(id).map(|entry| entry.value().clone())?;
        if session.is_expired() {
            self.sessions.remove_if(id, |_, s| s.is_expired());
            tracing::debug!(session = session.log_id(), "Evicted expired session");
            return None;
        }
        Some(session)
    }

    pub fn remove_session(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            tracing::debug!(session = short_id(id), "Session removed");
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drops every expired session; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired());
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            tracing::debug!(removed, "Swept expired sessions");
        }
        removed
    }
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use super::*;

    #[test]
    fn test_created_session_validates() {
        let manager = SessionManager::new(4, Duration::from_secs(60));
        let session = manager.create_session(100, "/usr/bin/netpulse").unwrap();

        let found = manager.validate_session(&session.id).unwrap();
        assert_eq!(found.client_pid, 100);
        assert_eq!(found.executable_path, "/usr/bin/netpulse");
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_session_ids_are_unique_and_url_safe() {
        let manager = SessionManager::new(64, Duration::from_secs(60));
        let ids: HashSet<String> = (0..32)
            .map(|pid| manager.create_session(pid, "/bin/x").unwrap().id)
            .collect();
        assert_eq!(ids.len(), 32);
        for id in &ids {
            assert_eq!(id.len(), 43);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[test]
    fn test_ceiling_rejects_instead_of_queueing() {
        let manager = SessionManager::new(2, Duration::from_secs(60));
        assert!(manager.create_session(1, "/a").is_some());
        assert!(manager.create_session(2, "/b").is_some());
        assert!(manager.create_session(3, "/c").is_none());
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn test_concurrent_creation_never_exceeds_ceiling() {
        const CEILING: usize = 5;
        const ATTEMPTS: usize = 64;

        let manager = Arc::new(SessionManager::new(CEILING, Duration::from_secs(60)));
        let handles: Vec<_> = (0..ATTEMPTS)
            .map(|i| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || manager.create_session(i as u32, "/bin/ui").is_some())
            })
            .collect();

        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(created, CEILING);
        assert_eq!(manager.active_count(), CEILING);
    }

    #[test]
    fn test_expired_session_is_rejected_without_explicit_removal() {
        let manager = SessionManager::new(4, Duration::from_millis(20));
        let session = manager.create_session(7, "/bin/ui").unwrap();

        thread::sleep(Duration::from_millis(40));
        assert!(manager.validate_session(&session.id).is_none());
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_expired_sessions_do_not_count_against_ceiling() {
        let manager = SessionManager::new(1, Duration::from_millis(20));
        manager.create_session(1, "/bin/ui").unwrap();
        thread::sleep(Duration::from_millis(40));
        assert!(manager.create_session(2, "/bin/ui").is_some());
    }

    #[test]
    fn test_remove_and_unknown_ids() {
        let manager = SessionManager::new(4, Duration::from_secs(60));
        let session = manager.create_session(1, "/bin/ui").unwrap();

        manager.remove_session(&session.id);
        assert!(manager.validate_session(&session.id).is_none());
        assert!(manager.validate_session("no-such-session").is_none());
        manager.remove_session("no-such-session");
    }

    #[test]
    fn test_sweep_reports_removed_count() {
        let manager = SessionManager::new(8, Duration::from_millis(10));
        for pid in 0..3 {
            manager.create_session(pid, "/bin/ui").unwrap();
        }
        thread::sleep(Duration::from_millis(30));
        assert_eq!(manager.sweep_expired(), 3);
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_short_id_truncates() {
        assert_eq!(short_id("abcdefghijkl"), "abcdefgh");
        assert_eq!(short_id("abc"), "abc");
    }
}
