//! Authenticated command gateway.
//!
//! A client proves possession of an RSA key pair through a three-step
//! handshake (`/key-exchange`, `/verify-message`, `/handshake-success`).
//! Only a session that completed the handshake and has not expired may run
//! whitelisted commands through `/exec`.

pub mod config;
pub mod error;
pub mod modules;

pub use config::ServerSettings;
pub use error::{
    AuthorizationError, CommandError, CryptoError, HandshakeError, KeyError, SessionError,
};
pub use modules::command::{CommandAuthority, CommandOutcome};
pub use modules::gate::AuthorizationGate;
pub use modules::handshake::Handshake;
pub use modules::http_api::{router, AppState};
pub use modules::peer::PeerHandshake;
pub use modules::secure_keys::KeyStore;
pub use modules::session_store::{SessionStore, SessionView};
