//! The server-side session pool (spec §5.2): a LIFO stack of previously-used session ids that
//! are reused instead of minted fresh, with idle ones evicted lazily at pop time.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use bson::{doc, Document};
use uuid::Uuid;

/// One server session identity, as sent in a command's `lsid` field.
#[derive(Debug, Clone)]
pub(crate) struct ServerSession {
    pub(crate) id: Document,
    last_used: Instant,
}

impl ServerSession {
    fn new() -> Self {
        Self {
            id: doc! { "id": bson::Binary {
                subtype: bson::spec::BinarySubtype::Uuid,
                bytes: Uuid::new_v4().as_bytes().to_vec(),
            }},
            last_used: Instant::now(),
        }
    }

    fn is_about_to_expire(&self, logical_session_timeout_minutes: i64) -> bool {
        // The driver spec's one-minute safety margin: a session is treated as expired slightly
        // before the server would actually time it out.
        let timeout = Duration::from_secs((logical_session_timeout_minutes.max(0) as u64) * 60);
        let margin = Duration::from_secs(60);
        timeout <= margin || self.last_used.elapsed() >= timeout - margin
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

/// A LIFO pool of idle server sessions. Most-recently-used sessions are popped first so that, in
/// a lightly loaded application, a small number of sessions absorb almost all the traffic and the
/// rest age out (spec §5.2).
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    sessions: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Self {
            sessions: Mutex::new(VecDeque::new()),
        }
    }

    /// Pops the most recently used non-expiring session, discarding (not returning) any expired
    /// ones found first, or mints a fresh one if the pool is empty.
    pub(crate) fn check_out(&self, logical_session_timeout_minutes: Option<i64>) -> ServerSession {
        let mut sessions = self.sessions.lock().unwrap();
        while let Some(session) = sessions.pop_back() {
            if let Some(timeout) = logical_session_timeout_minutes {
                if session.is_about_to_expire(timeout) {
                    continue;
                }
            }
            return session;
        }
        ServerSession::new()
    }

    /// Returns a session to the pool for reuse, unless `dirty` (the connection it last used ended
    /// uncleanly, per spec §5.2's dirty-session rule) in which case it's discarded instead.
    pub(crate) fn check_in(&self, mut session: ServerSession, dirty: bool) {
        if dirty {
            return;
        }
        session.touch();
        self.sessions.lock().unwrap().push_back(session);
    }

    /// Drops every pooled session id (spec §4.5 `reset`): required after fork/spawn so a child
    /// process never reuses an id its parent is also using.
    pub(crate) fn reset(&self) {
        self.sessions.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
