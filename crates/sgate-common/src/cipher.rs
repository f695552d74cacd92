use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as base64_std;
use rand::RngCore;
use serde::{Deserialize, Serialize};

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("crypto_secret_key must decode to 32 bytes, got {0}")]
    BadKeyLength(usize),
    #[error("crypto_secret_key is not valid base64: {0}")]
    BadKeyEncoding(#[from] base64::DecodeError),
    #[error("ciphertext is malformed or too short")]
    MalformedCiphertext,
    #[error("decryption failed (wrong key or corrupted ciphertext)")]
    DecryptFailed,
}

/// How a mismatched or corrupt ciphertext at rest is handled.
///
/// See the Open Question in the credential-encryption design: legacy rows written
/// before encryption was enforced, or rows written by a different key, either fail
/// loudly (`Strict`) or are returned as opaque bytes so the caller can decide what
/// to do with them (`PassthroughOnFailure`). Decided in favor of `Strict` as the
/// default: a provider credential that silently "decrypts" to garbage bytes and is
/// used to sign upstream requests fails far from its cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherMode {
    Strict,
    PassthroughOnFailure,
}

/// Symmetric encryption for provider credential blobs at rest.
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
}

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
    mode: CipherMode,
}

impl AesGcmCipher {
    pub fn new(base64_key: &str, mode: CipherMode) -> Result<Self, CipherError> {
        let key_bytes = base64_std.decode(base64_key)?;
        if key_bytes.len() != 32 {
            return Err(CipherError::BadKeyLength(key_bytes.len()));
        }
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
            mode,
        })
    }
}

impl CredentialCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CipherError::DecryptFailed)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < NONCE_LEN {
            return match self.mode {
                CipherMode::Strict => Err(CipherError::MalformedCiphertext),
                CipherMode::PassthroughOnFailure => Ok(ciphertext.to_vec()),
            };
        }
        let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        match self.cipher.decrypt(nonce, body) {
            Ok(plaintext) => Ok(plaintext),
            Err(_) => match self.mode {
                CipherMode::Strict => Err(CipherError::DecryptFailed),
                CipherMode::PassthroughOnFailure => Ok(ciphertext.to_vec()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> String {
        base64_std.encode([7u8; 32])
    }

    #[test]
    fn round_trips_arbitrary_bytes() {
        let cipher = AesGcmCipher::new(&test_key(), CipherMode::Strict).unwrap();
        let plaintext = b"csesidx/abc123:cookie-bag-goes-here";
        let ciphertext = cipher.encrypt(plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        let decrypted = cipher.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn strict_mode_rejects_corrupt_ciphertext() {
        let cipher = AesGcmCipher::new(&test_key(), CipherMode::Strict).unwrap();
        let err = cipher.decrypt(b"not encrypted").unwrap_err();
        assert!(matches!(err, CipherError::DecryptFailed));
    }

    #[test]
    fn passthrough_mode_returns_legacy_bytes_unchanged() {
        let cipher = AesGcmCipher::new(&test_key(), CipherMode::PassthroughOnFailure).unwrap();
        let legacy = b"legacy-plaintext-credential";
        let result = cipher.decrypt(legacy).unwrap();
        assert_eq!(result, legacy);
    }

    #[test]
    fn rejects_key_of_wrong_length() {
        let short_key = base64_std.encode([1u8; 16]);
        let err = AesGcmCipher::new(&short_key, CipherMode::Strict).unwrap_err();
        assert!(matches!(err, CipherError::BadKeyLength(16)));
    }
}
