use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ciphertext is not valid base64")]
    Encoding,
    #[error("ciphertext is truncated")]
    Truncated,
    #[error("decryption failed")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}

const NONCE_LEN: usize = 12;

/// AES-256-GCM over individual column values. The key is derived from the
/// deployment secret, so the same secret must be configured on every
/// instance that shares a database.
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;
        let mut packed = Vec::with_capacity(NONCE_LEN + sealed.len());
        packed.extend_from_slice(&nonce);
        packed.extend_from_slice(&sealed);
        Ok(BASE64.encode(packed))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let packed = BASE64.decode(encoded).map_err(|_| CryptoError::Encoding)?;
        if packed.len() < NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce, sealed) = packed.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plain).map_err(|_| CryptoError::Decrypt)
    }

    pub fn encrypt_opt(&self, plaintext: Option<&str>) -> Result<Option<String>, CryptoError> {
        plaintext.map(|value| self.encrypt(value)).transpose()
    }

    pub fn decrypt_opt(&self, encoded: Option<&str>) -> Result<Option<String>, CryptoError> {
        encoded.map(|value| self.decrypt(value)).transpose()
    }
}

/// Proxy keys are stored and looked up only as SHA-256 hex digests.
pub fn hash_api_key(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let cipher = FieldCipher::from_secret("test-secret");
        let sealed = cipher.encrypt("sk-token-value").unwrap();
        assert_ne!(sealed, "sk-token-value");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "sk-token-value");
    }

    #[test]
    fn nonces_differ_between_calls() {
        let cipher = FieldCipher::from_secret("test-secret");
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_secret_fails_closed() {
        let sealed = FieldCipher::from_secret("one").encrypt("value").unwrap();
        assert!(FieldCipher::from_secret("two").decrypt(&sealed).is_err());
    }

    #[test]
    fn api_key_hash_is_stable_hex() {
        let hash = hash_api_key("pk-abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_api_key("pk-abc"));
    }
}
