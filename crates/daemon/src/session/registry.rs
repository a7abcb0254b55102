//! Session registry.
//!
//! Maps session ids to live sessions. Ids come from [`SessionIdGenerator`],
//! which never hands out the same id twice in a process. A session that
//! closes for any reason is removed from the registry automatically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::pty::{CloseReason, Session, SessionError, SessionId, SessionInfo, SessionOptions};

/// Default maximum number of concurrent sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 64;

/// Produces session ids that are unique for the life of the process.
///
/// Each id combines a random per-process epoch with a monotonically
/// increasing counter, formatted as a UUID string.
#[derive(Debug)]
pub struct SessionIdGenerator {
    epoch: u64,
    next: AtomicU64,
}

impl SessionIdGenerator {
    /// Creates a generator with a fresh random epoch.
    pub fn new() -> Self {
        Self {
            epoch: rand::random(),
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next id.
    pub fn next_id(&self) -> SessionId {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        Uuid::from_u64_pair(self.epoch, seq).hyphenated().to_string()
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of live sessions.
///
/// The registry owns session lifetime: sessions are created here, found
/// here, and closed here or by their own shell exiting.
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    ids: SessionIdGenerator,
    capacity: Arc<Semaphore>,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Creates a registry holding at most `max_sessions` sessions.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ids: SessionIdGenerator::new(),
            capacity: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
        }
    }

    /// Spawns a shell under a fresh id and registers it.
    ///
    /// On failure nothing is registered and no process is left running.
    pub fn new_session(&self, options: SessionOptions) -> Result<Arc<Session>, SessionError> {
        let permit = Arc::clone(&self.capacity)
            .try_acquire_owned()
            .map_err(|_| SessionError::LimitReached(self.max_sessions))?;

        let id = self.ids.next_id();
        let session = Session::start(id.clone(), options).inspect_err(|e| {
            tracing::warn!(session_id = %id, error = %e, "Failed to create session");
        })?;
        self.sessions.insert(id.clone(), Arc::clone(&session));

        let sessions = Arc::clone(&self.sessions);
        let watched = Arc::clone(&session);
        tokio::spawn(async move {
            let _permit = permit;
            watched.wait_closed().await;
            let removed = sessions
                .remove_if(watched.id(), |_, current| Arc::ptr_eq(current, &watched))
                .is_some();
            if removed {
                tracing::debug!(session_id = %watched.id(), "Session deregistered");
            }
        });

        tracing::info!(session_id = %id, total = self.sessions.len(), "Session registered");
        Ok(session)
    }

    /// Looks up a running session.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|session| session.is_running())
    }

    /// Closes a session and waits for it to finish closing.
    ///
    /// The entry stays registered until the teardown completes, so an
    /// interrupted caller never hides a half-closed session from
    /// [`close_all`](Self::close_all). Returns `false` if no running session
    /// has this id.
    pub async fn close_session(&self, id: &str) -> bool {
        let Some(session) = self.sessions.get(id).map(|entry| Arc::clone(entry.value())) else {
            return false;
        };
        let started = session.begin_close(CloseReason::Requested);
        session.wait_closed().await;
        self.sessions
            .remove_if(id, |_, current| Arc::ptr_eq(current, &session));
        started
    }

    /// Closes every registered session concurrently.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "Closing all sessions");
        join_all(sessions.iter().map(|session| session.close())).await;

        for session in &sessions {
            self.sessions
                .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session));
        }
    }

    /// Returns descriptions of all registered sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        join_all(sessions.iter().map(|session| session.info())).await
    }

    /// Returns the number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Returns the total number of clients across all sessions.
    pub async fn client_count(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        join_all(sessions.iter().map(|session| session.client_count()))
            .await
            .into_iter()
            .sum()
    }

    /// Returns the session limit.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}
