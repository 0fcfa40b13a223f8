//! Per-field encryption for stored credentials
//!
//! Each sensitive value is encrypted on its own with AES-256-GCM under a
//! process-wide key derived from the configured passphrase. The nonce is
//! prepended to the ciphertext and the whole payload base64-encoded, so
//! every encrypted value is a self-contained string column.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use anyhow::{Result, anyhow};
use base64::{Engine as _, engine::general_purpose};
use sha2::{Digest, Sha256};

/// Returned in place of a field whose ciphertext cannot be decrypted.
///
/// A corrupted single field must not make the whole account unreadable,
/// so reads substitute this marker instead of failing.
pub const DECRYPT_SENTINEL: &str = "<decrypt-failed>";

/// Process-wide field cipher
///
/// Constructed once at startup and shared read-only afterwards.
#[derive(Clone)]
pub struct FieldCipher {
    key: Key<Aes256Gcm>,
}

impl FieldCipher {
    /// Derive the cipher key from a passphrase
    pub fn new(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        let digest = hasher.finalize();

        let mut key = Key::<Aes256Gcm>::default();
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Build from the loaded store-key configuration
    pub fn from_config(config: &crate::config::StoreKeyConfig) -> Self {
        Self::new(&config.passphrase)
    }

    /// Encrypt one field value; empty input stays empty
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("encryption failed: {e}"))?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);

        Ok(general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypt one field value; empty input stays empty
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        if encrypted.is_empty() {
            return Ok(String::new());
        }

        let combined = general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| anyhow!("base64 decode failed: {e}"))?;

        if combined.len() < 12 {
            return Err(anyhow!("ciphertext shorter than its nonce"));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow!("decryption failed: {e}"))?;

        String::from_utf8(plaintext).map_err(|e| anyhow!("decrypted bytes not UTF-8: {e}"))
    }

    /// Best-effort decrypt, substituting [`DECRYPT_SENTINEL`] on failure
    pub fn decrypt_or_sentinel(&self, encrypted: &str) -> String {
        match self.decrypt(encrypted) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                log::warn!("field unreadable, substituting sentinel: {e}");
                DECRYPT_SENTINEL.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let cipher = FieldCipher::new("test-passphrase");
        let encrypted = cipher.encrypt("eyJsome.token.value").unwrap();
        assert_ne!(encrypted, "eyJsome.token.value");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "eyJsome.token.value");
    }

    #[test]
    fn test_empty_passthrough() {
        let cipher = FieldCipher::new("k");
        assert_eq!(cipher.encrypt("").unwrap(), "");
        assert_eq!(cipher.decrypt("").unwrap(), "");
    }

    #[test]
    fn test_nonce_makes_ciphertexts_differ() {
        let cipher = FieldCipher::new("k");
        let a = cipher.encrypt("same input").unwrap();
        let b = cipher.encrypt("same input").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), cipher.decrypt(&b).unwrap());
    }

    #[test]
    fn test_corrupted_ciphertext_yields_sentinel() {
        let cipher = FieldCipher::new("k");
        assert_eq!(cipher.decrypt_or_sentinel("not-base64!"), DECRYPT_SENTINEL);

        let truncated = general_purpose::STANDARD.encode(b"short");
        assert_eq!(cipher.decrypt_or_sentinel(&truncated), DECRYPT_SENTINEL);

        let mut valid = cipher.encrypt("value").unwrap();
        valid.replace_range(..4, "AAAA");
        assert_eq!(cipher.decrypt_or_sentinel(&valid), DECRYPT_SENTINEL);
    }

    #[test]
    fn test_wrong_key_yields_sentinel() {
        let encrypted = FieldCipher::new("right").encrypt("value").unwrap();
        assert_eq!(
            FieldCipher::new("wrong").decrypt_or_sentinel(&encrypted),
            DECRYPT_SENTINEL
        );
    }

    #[test]
    fn test_same_passphrase_same_key() {
        let encrypted = FieldCipher::new("shared").encrypt("value").unwrap();
        assert_eq!(
            FieldCipher::new("shared").decrypt(&encrypted).unwrap(),
            "value"
        );
    }
}
