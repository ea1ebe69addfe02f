//! Three-step mutual key-possession handshake.
//!
//! ```text
//! NoSession --exchange--> Exchanged --verify--> Challenged --finalize--> Validated
//!                                       ^  |
//!                                       +--+  (verify may be repeated)
//! ```
//!
//! Cryptography always runs outside the session store lock: each step reads a
//! snapshot, computes, then writes its result back through
//! [`SessionStore::update`].

use crate::error::HandshakeError;
use crate::modules::crypto;
use crate::modules::secure_keys::KeyStore;
use crate::modules::session_store::{short_id, SessionStore};
use log::{info, warn};
use std::sync::Arc;

/// Length of the server-issued challenge secret.
pub const CHALLENGE_LENGTH: usize = 64;

/// Result of [`Handshake::exchange`].
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub session_id: String,
    pub server_public_key_pem: String,
}

/// Result of [`Handshake::verify`].
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    /// The client's probe, re-encrypted under the client's public key.
    pub re_encrypted_probe: Vec<u8>,
    /// A fresh challenge secret encrypted under the client's public key.
    pub encrypted_challenge: Vec<u8>,
}

/// Server side of the handshake.
pub struct Handshake {
    keys: Arc<KeyStore>,
    sessions: Arc<SessionStore>,
}

impl Handshake {
    pub fn new(keys: Arc<KeyStore>, sessions: Arc<SessionStore>) -> Self {
        Self { keys, sessions }
    }

    /// Register a client public key and open a session.
    ///
    /// No session is created when the key cannot be parsed.
    pub fn exchange(&self, peer_public_key_pem: &str) -> Result<ExchangeOutcome, HandshakeError> {
        let peer_public_key = crypto::parse_pem_public_key(peer_public_key_pem)?;
        let session_id = self.sessions.create(peer_public_key)?;

        info!("Key exchange completed for session {}", short_id(&session_id));
        Ok(ExchangeOutcome {
            session_id,
            server_public_key_pem: self.keys.public_key_pem().to_string(),
        })
    }

    /// Prove the server identity and issue a challenge.
    ///
    /// `encrypted_probe` was encrypted by the client under the server's public
    /// key. The decrypted probe is sent back encrypted under the client's
    /// key, together with a new challenge secret. Calling this again replaces
    /// the outstanding challenge.
    pub fn verify(
        &self,
        session_id: &str,
        encrypted_probe: &[u8],
    ) -> Result<VerifyOutcome, HandshakeError> {
        let session = self.sessions.get_live(session_id)?;

        let probe = self.keys.decrypt(encrypted_probe).map_err(|_| {
            warn!("Probe decryption failed for session {}", short_id(session_id));
            HandshakeError::DecryptionFailed
        })?;
        let re_encrypted_probe =
            crypto::encrypt_with_public_key(&probe, &session.peer_public_key)?;

        let challenge = crypto::generate_random_string(CHALLENGE_LENGTH);
        let encrypted_challenge =
            crypto::encrypt_with_public_key(challenge.as_bytes(), &session.peer_public_key)?;

        // Only store the challenge once both ciphertexts exist, so a failed
        // step leaves the session as it was.
        self.sessions
            .update(session_id, move |record| record.set_challenge(challenge))?;

        info!("Issued challenge for session {}", short_id(session_id));
        Ok(VerifyOutcome {
            re_encrypted_probe,
            encrypted_challenge,
        })
    }

    /// Check the client's answer to the latest challenge.
    ///
    /// `encrypted_secret` is the challenge secret re-encrypted by the client
    /// under the server's public key. Repeating a correct answer after the
    /// session is validated succeeds without further effect.
    pub fn finalize(&self, session_id: &str, encrypted_secret: &[u8]) -> Result<(), HandshakeError> {
        // Fail fast on unknown or expired sessions before spending a decrypt.
        self.sessions.get_live(session_id)?;

        let presented = self.keys.decrypt(encrypted_secret).map_err(|_| {
            warn!("Secret decryption failed for session {}", short_id(session_id));
            HandshakeError::DecryptionFailed
        })?;

        let confirmed = self
            .sessions
            .update(session_id, |record| record.confirm_challenge(&presented))?;
        if !confirmed {
            warn!("Challenge mismatch for session {}", short_id(session_id));
            return Err(HandshakeError::ChallengeMismatch);
        }

        info!("Session {} validated", short_id(session_id));
        Ok(())
    }
}
