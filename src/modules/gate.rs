//! Authorization gate in front of protected operations.

use crate::error::{AuthorizationError, SessionError};
use crate::modules::session_store::{short_id, SessionStore, SessionView};
use log::warn;
use std::sync::Arc;

/// Admits a caller only when its session is both live and validated.
///
/// Any lookup failure, including a poisoned store lock, is a rejection.
pub struct AuthorizationGate {
    sessions: Arc<SessionStore>,
}

impl AuthorizationGate {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }

    /// Admit a session that completed the handshake and has not expired.
    pub fn authorize(&self, session_id: Option<&str>) -> Result<SessionView, AuthorizationError> {
        let session = self.require_live(session_id)?;
        if !session.validated {
            warn!(
                "Rejected session {}: handshake not completed",
                short_id(&session.session_id)
            );
            return Err(AuthorizationError::Unauthorized("not validated"));
        }
        Ok(session)
    }

    /// Admit any live session, validated or not.
    ///
    /// Used by the later handshake steps, which by definition run before
    /// validation.
    pub fn require_live(&self, session_id: Option<&str>) -> Result<SessionView, AuthorizationError> {
        let session_id = match session_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                warn!("Rejected request without session identifier");
                return Err(AuthorizationError::Unauthorized("missing session id"));
            }
        };

        self.sessions.get_live(session_id).map_err(|e| {
            warn!("Rejected session {}: {}", short_id(session_id), e);
            AuthorizationError::Unauthorized(match e {
                SessionError::NotFound => "unknown session",
                SessionError::Expired => "session expired",
                SessionError::LockPoisoned => "session store unavailable",
            })
        })
    }
}
