//! Client half of the handshake.
//!
//! Transport-agnostic: callers move the base64 strings produced here over
//! whatever HTTP client they use.

use crate::error::CryptoError;
use crate::modules::crypto;
use rand_core::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fmt;

/// Length of the random probe sent during verification.
pub const PROBE_LENGTH: usize = 32;

/// Client key pair plus the state needed to check the server's answers.
pub struct PeerHandshake {
    private_key: RsaPrivateKey,
    server_public_key: Option<RsaPublicKey>,
    probe: Option<Vec<u8>>,
}

impl PeerHandshake {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self {
            private_key,
            server_public_key: None,
            probe: None,
        }
    }

    /// Generate a fresh client key pair of `bits` bits.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        Ok(Self::new(private_key))
    }

    /// PEM of the client public key, for the key exchange request.
    pub fn public_key_pem(&self) -> Result<String, CryptoError> {
        crypto::public_key_to_pem(&RsaPublicKey::from(&self.private_key))
    }

    /// Record the server key returned by the key exchange.
    pub fn accept_server_key(&mut self, server_public_key_pem: &str) -> Result<(), CryptoError> {
        self.server_public_key = Some(crypto::parse_pem_public_key(server_public_key_pem)?);
        Ok(())
    }

    /// New random probe encrypted to the server, base64-encoded.
    pub fn encrypted_probe(&mut self) -> Result<String, CryptoError> {
        let probe = crypto::generate_random_string(PROBE_LENGTH).into_bytes();
        let ciphertext = crypto::encrypt_with_public_key(&probe, self.server_key()?)?;
        self.probe = Some(probe);
        Ok(crypto::base64_encode(&ciphertext))
    }

    /// True when the server echoed the last probe, proving it holds the
    /// private key matching the advertised public key.
    pub fn check_probe_echo(&self, re_encrypted_probe_b64: &str) -> Result<bool, CryptoError> {
        let expected = self
            .probe
            .as_deref()
            .ok_or_else(|| CryptoError::Encoding("no probe sent".to_string()))?;
        let ciphertext = crypto::base64_decode(re_encrypted_probe_b64)?;
        let echoed = crypto::decrypt_with_private_key(&ciphertext, &self.private_key)?;
        Ok(crypto::constant_time_eq(&echoed, expected))
    }

    /// Decrypt the server's challenge and re-encrypt it to the server for
    /// the finalization request.
    pub fn answer_challenge(&self, own_challenge_b64: &str) -> Result<String, CryptoError> {
        let ciphertext = crypto::base64_decode(own_challenge_b64)?;
        let secret = crypto::decrypt_with_private_key(&ciphertext, &self.private_key)?;
        let answer = crypto::encrypt_with_public_key(&secret, self.server_key()?)?;
        Ok(crypto::base64_encode(&answer))
    }

    /// Encrypt a command line for a server that requires encrypted payloads.
    pub fn encrypt_command(&self, command_line: &str) -> Result<String, CryptoError> {
        let ciphertext =
            crypto::encrypt_with_public_key(command_line.as_bytes(), self.server_key()?)?;
        Ok(crypto::base64_encode(&ciphertext))
    }

    fn server_key(&self) -> Result<&RsaPublicKey, CryptoError> {
        self.server_public_key
            .as_ref()
            .ok_or_else(|| CryptoError::BadPublicKey("server key not received".to_string()))
    }
}

impl fmt::Debug for PeerHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandshake")
            .field("server_key_received", &self.server_public_key.is_some())
            .field("probe_sent", &self.probe.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::handshake::Handshake;
    use crate::modules::secure_keys::KeyStore;
    use crate::modules::session_store::SessionStore;
    use std::sync::Arc;

    #[test]
    fn test_peer_drives_full_handshake() {
        let keys = Arc::new(
            KeyStore::from_private_key(RsaPrivateKey::new(&mut OsRng, 1024).unwrap()).unwrap(),
        );
        let sessions = Arc::new(SessionStore::default());
        let handshake = Handshake::new(keys, sessions.clone());
        let mut peer = PeerHandshake::generate(1024).unwrap();

        let exchange = handshake.exchange(&peer.public_key_pem().unwrap()).unwrap();
        peer.accept_server_key(&exchange.server_public_key_pem).unwrap();

        let probe = crypto::base64_decode(&peer.encrypted_probe().unwrap()).unwrap();
        let verify = handshake.verify(&exchange.session_id, &probe).unwrap();
        assert!(peer
            .check_probe_echo(&crypto::base64_encode(&verify.re_encrypted_probe))
            .unwrap());

        let answer = peer
            .answer_challenge(&crypto::base64_encode(&verify.encrypted_challenge))
            .unwrap();
        handshake
            .finalize(&exchange.session_id, &crypto::base64_decode(&answer).unwrap())
            .unwrap();
        assert!(sessions.get(&exchange.session_id).unwrap().validated);
    }

    #[test]
    fn test_peer_requires_server_key() {
        let mut peer = PeerHandshake::generate(1024).unwrap();
        assert!(matches!(
            peer.encrypted_probe(),
            Err(CryptoError::BadPublicKey(_))
        ));
        assert!(peer.check_probe_echo("AAAA").is_err());
    }
}
