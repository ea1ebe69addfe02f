//! In-memory session store for handshake state.
//!
//! The store owns every [`SessionRecord`]; callers read [`SessionView`]
//! snapshots and mutate records only through [`SessionStore::update`], which
//! runs the mutation under the store's write lock. Records never leave the
//! lock, so the challenge secret is never handed out.

use crate::error::SessionError;
use crate::modules::crypto;
use chrono::{DateTime, Utc};
use log::{debug, info};
use rsa::RsaPublicKey;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

/// Default session lifetime measured from creation (5 minutes).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

/// Server-side state of one client's handshake.
pub struct SessionRecord {
    peer_public_key: RsaPublicKey,
    created_at: DateTime<Utc>,
    challenge_secret: Option<SecretString>,
    validated: bool,
}

impl SessionRecord {
    fn new(peer_public_key: RsaPublicKey) -> Self {
        Self {
            peer_public_key,
            created_at: Utc::now(),
            challenge_secret: None,
            validated: false,
        }
    }

    pub fn peer_public_key(&self) -> &RsaPublicKey {
        &self.peer_public_key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub fn has_challenge(&self) -> bool {
        self.challenge_secret.is_some()
    }

    /// A record is expired once its age exceeds `ttl`, whatever its
    /// validation state. A creation time in the future counts as age zero.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match now.signed_duration_since(self.created_at).to_std() {
            Ok(age) => age > ttl,
            Err(_) => false,
        }
    }

    /// Replace the outstanding challenge. Any earlier challenge stops
    /// matching.
    pub(crate) fn set_challenge(&mut self, secret: String) {
        self.challenge_secret = Some(SecretString::new(secret));
    }

    /// Compare `presented` with the outstanding challenge in constant time
    /// and mark the session validated on a match.
    ///
    /// Returns `false` without touching `validated` when no challenge has
    /// been issued or the value differs.
    pub(crate) fn confirm_challenge(&mut self, presented: &[u8]) -> bool {
        let matches = match &self.challenge_secret {
            Some(secret) => crypto::constant_time_eq(secret.expose_secret().as_bytes(), presented),
            None => false,
        };
        if matches {
            self.validated = true;
        }
        matches
    }

    fn view(&self, session_id: &str) -> SessionView {
        SessionView {
            session_id: session_id.to_string(),
            peer_public_key: self.peer_public_key.clone(),
            created_at: self.created_at,
            challenge_issued: self.challenge_secret.is_some(),
            validated: self.validated,
        }
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("created_at", &self.created_at)
            .field("challenge_issued", &self.challenge_secret.is_some())
            .field("validated", &self.validated)
            .finish_non_exhaustive()
    }
}

/// Read-only copy of a session handed to callers outside the store.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session_id: String,
    pub peer_public_key: RsaPublicKey,
    pub created_at: DateTime<Utc>,
    pub challenge_issued: bool,
    pub validated: bool,
}

/// Concurrent map from session identifier to [`SessionRecord`].
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a fresh record for `peer_public_key` under a new unguessable
    /// identifier.
    ///
    /// Identifier generation and insertion happen under one write lock, so
    /// concurrent creates can never hand out the same identifier.
    pub fn create(&self, peer_public_key: RsaPublicKey) -> Result<String, SessionError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| SessionError::LockPoisoned)?;

        let mut session_id = crypto::generate_session_id();
        while sessions.contains_key(&session_id) {
            session_id = crypto::generate_session_id();
        }
        sessions.insert(session_id.clone(), SessionRecord::new(peer_public_key));

        debug!("Stored session {}", short_id(&session_id));
        Ok(session_id)
    }

    /// Snapshot of a session regardless of its age.
    pub fn get(&self, session_id: &str) -> Result<SessionView, SessionError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| SessionError::LockPoisoned)?;
        sessions
            .get(session_id)
            .map(|record| record.view(session_id))
            .ok_or(SessionError::NotFound)
    }

    /// Snapshot of a session that is still within its TTL.
    ///
    /// An expired record is purged on the way out and reported as
    /// [`SessionError::Expired`].
    pub fn get_live(&self, session_id: &str) -> Result<SessionView, SessionError> {
        {
            let sessions = self
                .sessions
                .read()
                .map_err(|_| SessionError::LockPoisoned)?;
            let record = sessions.get(session_id).ok_or(SessionError::NotFound)?;
            if !record.is_expired(Utc::now(), self.ttl) {
                return Ok(record.view(session_id));
            }
        }
        self.evict_if_expired(session_id)?;
        Err(SessionError::Expired)
    }

    /// True iff the session exists and is within its TTL.
    ///
    /// Liveness alone does not authorize anything; see
    /// [`crate::modules::gate::AuthorizationGate`].
    pub fn is_live(&self, session_id: &str) -> bool {
        self.get_live(session_id).is_ok()
    }

    /// Run `mutator` on a live record under the store's exclusive lock.
    ///
    /// The mutator must not block: it runs while every other session access
    /// waits.
    pub fn update<T, F>(&self, session_id: &str, mutator: F) -> Result<T, SessionError>
    where
        F: FnOnce(&mut SessionRecord) -> T,
    {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| SessionError::LockPoisoned)?;
        let record = sessions.get_mut(session_id).ok_or(SessionError::NotFound)?;
        if record.is_expired(Utc::now(), self.ttl) {
            sessions.remove(session_id);
            debug!("Evicted expired session {}", short_id(session_id));
            return Err(SessionError::Expired);
        }
        Ok(mutator(record))
    }

    /// Remove every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, SessionError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| SessionError::LockPoisoned)?;
        let now = Utc::now();
        let before = sessions.len();
        sessions.retain(|_, record| !record.is_expired(now, self.ttl));
        let purged = before - sessions.len();
        if purged > 0 {
            info!("Purged {} expired sessions", purged);
        }
        Ok(purged)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_if_expired(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| SessionError::LockPoisoned)?;
        // Re-check under the write lock; another caller may have removed it.
        let expired = sessions
            .get(session_id)
            .map(|record| record.is_expired(Utc::now(), self.ttl))
            .unwrap_or(false);
        if expired {
            sessions.remove(session_id);
            debug!("Evicted expired session {}", short_id(session_id));
        }
        Ok(())
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

/// Leading characters of a session identifier, safe for log lines.
pub fn short_id(session_id: &str) -> &str {
    let end = session_id
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(session_id.len());
    &session_id[..end]
}
