use crate::error::CryptoError;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use rand_core::{OsRng, RngCore};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

/// Smallest peer modulus accepted at key exchange, in bits.
pub const MIN_PEER_KEY_BITS: usize = 1024;

/// PKCS#1 v1.5 encryption padding overhead in bytes.
pub const PKCS1V15_OVERHEAD: usize = 11;

/// Length of a session identifier before encoding (192 bits).
pub const SESSION_ID_BYTES: usize = 24;

/// Alphabet for challenge secrets.
const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Encrypt `plaintext` to `public_key` with RSA PKCS#1 v1.5 padding.
pub fn encrypt_with_public_key(
    plaintext: &[u8],
    public_key: &RsaPublicKey,
) -> Result<Vec<u8>, CryptoError> {
    let limit = max_plaintext_len(public_key);
    if plaintext.len() > limit {
        return Err(CryptoError::EncryptionFailed(format!(
            "message of {} bytes exceeds key limit of {} bytes",
            plaintext.len(),
            limit
        )));
    }
    public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// Decrypt an RSA PKCS#1 v1.5 ciphertext.
///
/// Every failure collapses into [`CryptoError::DecryptionFailed`] so callers
/// cannot act as a padding oracle.
pub fn decrypt_with_private_key(
    ciphertext: &[u8],
    private_key: &RsaPrivateKey,
) -> Result<Vec<u8>, CryptoError> {
    private_key
        .decrypt(Pkcs1v15Encrypt, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Largest plaintext a single PKCS#1 v1.5 block can carry for this key.
pub fn max_plaintext_len(public_key: &RsaPublicKey) -> usize {
    public_key.size().saturating_sub(PKCS1V15_OVERHEAD)
}

/// Parse a PEM-encoded RSA public key supplied by a client.
///
/// Accepts SubjectPublicKeyInfo (`PUBLIC KEY`) and PKCS#1
/// (`RSA PUBLIC KEY`) containers. Keys of any other family, or RSA keys
/// below [`MIN_PEER_KEY_BITS`], are rejected.
pub fn parse_pem_public_key(pem_str: &str) -> Result<RsaPublicKey, CryptoError> {
    let parsed = pem::parse(pem_str.trim())
        .map_err(|e| CryptoError::BadPublicKey(format!("failed to decode PEM block: {}", e)))?;

    let public_key = match parsed.tag() {
        "PUBLIC KEY" => RsaPublicKey::from_public_key_der(parsed.contents())
            .map_err(|e| CryptoError::BadPublicKey(format!("expected RSA public key: {}", e)))?,
        "RSA PUBLIC KEY" => RsaPublicKey::from_pkcs1_der(parsed.contents())
            .map_err(|e| CryptoError::BadPublicKey(e.to_string()))?,
        other => {
            return Err(CryptoError::BadPublicKey(format!(
                "unexpected PEM tag {}",
                other
            )))
        }
    };

    let bits = public_key.size() * 8;
    if bits < MIN_PEER_KEY_BITS {
        return Err(CryptoError::BadPublicKey(format!(
            "key size {} bits below minimum {}",
            bits, MIN_PEER_KEY_BITS
        )));
    }
    Ok(public_key)
}

/// Serialize an RSA public key as SubjectPublicKeyInfo PEM.
pub fn public_key_to_pem(public_key: &RsaPublicKey) -> Result<String, CryptoError> {
    public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Encoding(e.to_string()))
}

/// Fresh session identifier from the OS CSPRNG, URL-safe base64.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Random alphanumeric string of length `len` drawn from the OS CSPRNG.
///
/// Uses rejection sampling so every character of the alphabet is equally
/// likely.
pub fn generate_random_string(len: usize) -> String {
    // Largest multiple of the alphabet size that fits in a byte.
    let zone = (256 / CHARSET.len()) * CHARSET.len();
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 64];
    while out.len() < len {
        OsRng.fill_bytes(&mut buf);
        for &b in buf.iter() {
            if (b as usize) < zone {
                out.push(CHARSET[b as usize % CHARSET.len()] as char);
                if out.len() == len {
                    break;
                }
            }
        }
    }
    out
}

/// Constant-time byte comparison to prevent timing attacks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Base64 encode data using standard encoding
pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Base64 decode data using standard encoding
pub fn base64_decode(data: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| CryptoError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPublicKey;

    fn test_key(bits: usize) -> RsaPrivateKey {
        RsaPrivateKey::new(&mut OsRng, bits).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let private_key = test_key(1024);
        let public_key = RsaPublicKey::from(&private_key);

        let message = b"This is a test message.";
        let ciphertext = encrypt_with_public_key(message, &public_key).unwrap();
        assert_ne!(ciphertext.as_slice(), message.as_slice());

        let plaintext = decrypt_with_private_key(&ciphertext, &private_key).unwrap();
        assert_eq!(plaintext, message);
    }

    #[test]
    fn test_round_trip_at_max_payload() {
        let private_key = test_key(1024);
        let public_key = RsaPublicKey::from(&private_key);

        let message = vec![0x5au8; max_plaintext_len(&public_key)];
        let ciphertext = encrypt_with_public_key(&message, &public_key).unwrap();
        assert_eq!(
            decrypt_with_private_key(&ciphertext, &private_key).unwrap(),
            message
        );

        let too_long = vec![0x5au8; max_plaintext_len(&public_key) + 1];
        assert!(matches!(
            encrypt_with_public_key(&too_long, &public_key),
            Err(CryptoError::EncryptionFailed(_))
        ));
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let alice = test_key(1024);
        let mallory = test_key(1024);

        let ciphertext =
            encrypt_with_public_key(b"for alice only", &RsaPublicKey::from(&alice)).unwrap();
        let result = decrypt_with_private_key(&ciphertext, &mallory);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_decrypt_garbage_fails() {
        let key = test_key(1024);
        assert!(matches!(
            decrypt_with_private_key(b"not a ciphertext", &key),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_parse_pem_public_key_formats() {
        let key = test_key(1024);
        let public_key = RsaPublicKey::from(&key);

        let spki = public_key_to_pem(&public_key).unwrap();
        assert!(spki.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert_eq!(parse_pem_public_key(&spki).unwrap(), public_key);

        let pkcs1 = public_key.to_pkcs1_pem(LineEnding::LF).unwrap();
        assert_eq!(parse_pem_public_key(&pkcs1).unwrap(), public_key);
    }

    #[test]
    fn test_parse_pem_public_key_rejects_bad_input() {
        assert!(matches!(
            parse_pem_public_key("not a pem"),
            Err(CryptoError::BadPublicKey(_))
        ));

        let wrong_tag = pem::encode(&pem::Pem::new("CERTIFICATE", vec![1, 2, 3]));
        assert!(matches!(
            parse_pem_public_key(&wrong_tag),
            Err(CryptoError::BadPublicKey(_))
        ));

        let garbage_body = pem::encode(&pem::Pem::new("PUBLIC KEY", vec![0u8; 40]));
        assert!(matches!(
            parse_pem_public_key(&garbage_body),
            Err(CryptoError::BadPublicKey(_))
        ));
    }

    #[test]
    fn test_parse_pem_public_key_rejects_small_keys() {
        let small = test_key(512);
        let pem_str = public_key_to_pem(&RsaPublicKey::from(&small)).unwrap();
        assert!(matches!(
            parse_pem_public_key(&pem_str),
            Err(CryptoError::BadPublicKey(_))
        ));
    }

    #[test]
    fn test_session_id_shape() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        // 24 bytes -> 32 base64 characters without padding
        assert_eq!(a.len(), 32);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_random_string() {
        let s = generate_random_string(64);
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(s, generate_random_string(64));
        assert_eq!(generate_random_string(0), "");
    }

    #[test]
    fn test_constant_time_eq() {
        let a = [1u8, 2, 3, 4];
        let b = [1u8, 2, 3, 4];
        let c = [1u8, 2, 3, 5];

        assert!(constant_time_eq(&a, &b));
        assert!(!constant_time_eq(&a, &c));
        assert!(!constant_time_eq(&a, &[1u8, 2, 3]));
    }

    #[test]
    fn test_base64_helpers() {
        let encoded = base64_encode(b"probe");
        assert_eq!(base64_decode(&encoded).unwrap(), b"probe");
        assert!(matches!(
            base64_decode("***"),
            Err(CryptoError::Encoding(_))
        ));
    }
}
