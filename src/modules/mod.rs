pub mod command;
pub mod crypto;
pub mod gate;
pub mod handshake;
pub mod http_api;
pub mod peer;
pub mod secure_keys;
pub mod session_store;
