//! Server key pair handling.
//!
//! The key pair is loaded once at process start and is read-only afterwards,
//! so a [`KeyStore`] can be shared behind an `Arc` without locking.

use crate::error::{CryptoError, KeyError};
use crate::modules::crypto;
use log::info;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fmt;
use std::path::{Path, PathBuf};

/// The service's own RSA key pair.
pub struct KeyStore {
    /// The RSA private key (boxed for size).
    private_key: Box<RsaPrivateKey>,
    public_key: RsaPublicKey,
    /// SubjectPublicKeyInfo PEM advertised to clients, computed once.
    public_key_pem: String,
}

impl KeyStore {
    /// Load the key pair from disk.
    ///
    /// `public_path` is optional; when given, the file must contain the public
    /// half of the private key. When absent the public key is derived.
    pub fn load(private_path: &Path, public_path: Option<&Path>) -> Result<Self, KeyError> {
        let private_path = resolve_path(private_path)?;
        info!("Reading private key from {}", private_path.display());
        let private_pem = read_key_file(&private_path)?;
        let store = Self::from_private_pem(&private_pem)?;

        if let Some(public_path) = public_path {
            let public_path = resolve_path(public_path)?;
            info!("Reading public key from {}", public_path.display());
            let public_pem = read_key_file(&public_path)?;
            let public_key = crypto::parse_pem_public_key(&public_pem).map_err(|e| match e {
                CryptoError::BadPublicKey(reason) => KeyError::InvalidFormat(reason),
                other => KeyError::Crypto(other.to_string()),
            })?;
            if public_key != store.public_key {
                return Err(KeyError::KeyMismatch);
            }
        }

        info!("Loaded server key pair");
        Ok(store)
    }

    /// Build a key store from a PEM private key.
    ///
    /// Accepts PKCS#8 (`PRIVATE KEY`) and PKCS#1 (`RSA PRIVATE KEY`).
    pub fn from_private_pem(pem_content: &str) -> Result<Self, KeyError> {
        let parsed =
            pem::parse(pem_content.trim()).map_err(|e| KeyError::InvalidFormat(e.to_string()))?;

        let private_key = match parsed.tag() {
            "PRIVATE KEY" => RsaPrivateKey::from_pkcs8_der(parsed.contents())
                .map_err(|e| KeyError::UnsupportedKeyType(format!("expected RSA key: {}", e)))?,
            "RSA PRIVATE KEY" => RsaPrivateKey::from_pkcs1_der(parsed.contents())
                .map_err(|e| KeyError::InvalidFormat(e.to_string()))?,
            other => {
                return Err(KeyError::UnsupportedKeyType(format!(
                    "expected PRIVATE KEY or RSA PRIVATE KEY, got {}",
                    other
                )))
            }
        };

        Self::from_private_key(private_key)
    }

    /// Wrap an already parsed private key.
    pub fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, KeyError> {
        private_key
            .validate()
            .map_err(|e| KeyError::Crypto(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        let public_key_pem =
            crypto::public_key_to_pem(&public_key).map_err(|e| KeyError::Crypto(e.to_string()))?;

        Ok(Self {
            private_key: Box::new(private_key),
            public_key,
            public_key_pem,
        })
    }

    /// The public key in SubjectPublicKeyInfo PEM form.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// Decrypt a ciphertext addressed to this server.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::decrypt_with_private_key(ciphertext, &self.private_key)
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyStore([REDACTED])")
    }
}

fn resolve_path(path: &Path) -> Result<PathBuf, KeyError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let current_dir = std::env::current_dir().map_err(|e| KeyError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(current_dir.join(path))
}

fn read_key_file(path: &Path) -> Result<String, KeyError> {
    std::fs::read_to_string(path).map_err(|e| KeyError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}
