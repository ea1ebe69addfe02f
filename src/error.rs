//! Error types for the handshake service.

use thiserror::Error;

/// Errors raised while loading the server key pair.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Failed to read key file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Invalid key format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Public key does not match private key")]
    KeyMismatch,

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),
}

/// Errors from asymmetric operations on request data.
///
/// `DecryptionFailed` deliberately carries no detail: padding errors and
/// wrong-key errors must look identical to the caller.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Bad public key: {0}")]
    BadPublicKey(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Errors surfaced by the session store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("Session expired")]
    Expired,

    #[error("Session store lock poisoned")]
    LockPoisoned,
}

/// Errors from the three handshake steps.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Bad public key: {0}")]
    BadPublicKey(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Session expired")]
    SessionExpired,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Challenge mismatch")]
    ChallengeMismatch,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<SessionError> for HandshakeError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound => HandshakeError::SessionNotFound,
            SessionError::Expired => HandshakeError::SessionExpired,
            SessionError::LockPoisoned => HandshakeError::Internal(e.to_string()),
        }
    }
}

impl From<CryptoError> for HandshakeError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::BadPublicKey(reason) => HandshakeError::BadPublicKey(reason),
            CryptoError::DecryptionFailed => HandshakeError::DecryptionFailed,
            CryptoError::EncryptionFailed(reason) => HandshakeError::EncryptionFailed(reason),
            CryptoError::Encoding(reason) => HandshakeError::Internal(reason),
        }
    }
}

/// Rejection from the authorization gate.
///
/// The reason is for server-side logs only; clients always see the same
/// response.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("Unauthorized: {0}")]
    Unauthorized(&'static str),
}

/// Errors from the command authority.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to decrypt command")]
    DecryptionFailed,

    #[error("Command '{0}' is not allowed")]
    CommandNotAllowed(String),

    #[error("Failed to spawn command: {0}")]
    SpawnFailed(String),

    #[error("Command timed out after {0} seconds")]
    TimedOut(u64),
}
