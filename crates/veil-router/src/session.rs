//! Session table: one entry per negotiated session id.
//!
//! A reconnecting peer that presents a session id it previously held gets a
//! fresh id that inherits the old entry's client binding; the old id is
//! retired in the same critical section, so no two live ids ever share one
//! session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info};
use veil_shared::crypto::SessionCipher;
use veil_shared::{ClientId, RouterType, SessionId};

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub cipher: Arc<SessionCipher>,
    pub router_type: RouterType,
    pub client: Option<ClientId>,
    pub created: Instant,
    pub last_seen: Instant,
    /// False once the connection that negotiated this session is gone.
    pub connected: bool,
}

/// Result of [`SessionManager::allocate`].
#[derive(Debug, Clone)]
pub struct Allocated {
    pub id: SessionId,
    pub cipher: Arc<SessionCipher>,
    /// Client carried over from the migrated session.
    pub client: Option<ClientId>,
    pub migrated: bool,
}

#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<SessionId, Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session bound to `cipher`, migrating `previous` if it
    /// names a live entry.
    pub async fn allocate(
        &self,
        cipher: SessionCipher,
        router_type: RouterType,
        previous: Option<&SessionId>,
    ) -> Allocated {
        let mut sessions = self.sessions.lock().await;

        let mut id = SessionId::random();
        while sessions.contains_key(&id) {
            id = SessionId::random();
        }

        let now = Instant::now();
        let old = previous.and_then(|prev| sessions.remove(prev));
        let migrated = old.is_some();
        let (client, created) = match &old {
            Some(old) => (old.client, old.created),
            None => (None, now),
        };

        if let Some(old) = &old {
            info!(
                from = %old.id.short(),
                to = %id.short(),
                client = ?client,
                "Session migrated"
            );
        } else {
            debug!(session = %id.short(), %router_type, "Session allocated");
        }

        let cipher = Arc::new(cipher);
        sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                cipher: cipher.clone(),
                router_type,
                client,
                created,
                last_seen: now,
                connected: true,
            },
        );

        Allocated {
            id,
            cipher,
            client,
            migrated,
        }
    }

    /// Refresh activity. Returns false if the session was retired or migrated.
    pub async fn touch(&self, id: &SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(id) {
            Some(session) => {
                session.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn bind_client(&self, id: &SessionId, client: ClientId) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(id) {
            Some(session) => {
                session.client = Some(client);
                true
            }
            None => false,
        }
    }

    pub async fn client_of(&self, id: &SessionId) -> Option<ClientId> {
        self.sessions.lock().await.get(id).and_then(|s| s.client)
    }

    pub async fn cipher(&self, id: &SessionId) -> Option<Arc<SessionCipher>> {
        self.sessions.lock().await.get(id).map(|s| s.cipher.clone())
    }

    /// The connection closed; keep the entry around for migration.
    pub async fn disconnect(&self, id: &SessionId) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(id) {
            session.connected = false;
            session.last_seen = Instant::now();
        }
    }

    pub async fn retire(&self, id: &SessionId) -> Option<Session> {
        let removed = self.sessions.lock().await.remove(id);
        if removed.is_some() {
            debug!(session = %id.short(), "Session retired");
        }
        removed
    }

    /// Refresh every session bound to `client`.
    pub async fn touch_client(&self, client: &ClientId) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        for session in sessions.values_mut() {
            if session.client.as_ref() == Some(client) {
                session.last_seen = now;
            }
        }
    }

    /// Remove sessions idle for longer than `max_idle`, connected or not. A
    /// connection whose session is gone closes at its next idle check.
    pub async fn sweep(&self, max_idle: Duration) -> Vec<Session> {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        let expired: Vec<SessionId> = sessions
            .values()
            .filter(|s| now.duration_since(s.last_seen) >= max_idle)
            .map(|s| s.id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| sessions.remove(id))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.lock().await.contains_key(id)
    }
}
