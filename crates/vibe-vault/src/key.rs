//! The process-wide sealing key and AES-256-GCM sealing.
//!
//! Sealed values are `base64(nonce(12) || ciphertext || tag)`.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;

use vibe_core::config::EncryptionConfig;

use crate::error::VaultError;

const NONCE_LEN: usize = 12;

/// A 256-bit symmetric key, loaded once at startup and shared read-only.
#[derive(Clone)]
pub struct EncryptionKey([u8; 32]);

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(***)")
    }
}

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Decode a base64 key of exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::InvalidKey(format!("base64 decode: {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            VaultError::InvalidKey(format!("expected 32 bytes, got {}", b.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Load the key named by the encryption configuration.
    pub fn from_config(config: &EncryptionConfig) -> Result<Self, VaultError> {
        let material = config
            .key_material()
            .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
        Self::from_base64(&material)
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rng, &mut bytes);
        Self(bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn seal(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encryption)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    /// Decrypt a value produced by [`seal`](Self::seal).
    ///
    /// Any failure (bad base64, short payload, tag mismatch, non-UTF-8
    /// plaintext) is [`VaultError::Decryption`].
    pub fn open(&self, sealed: &str) -> Result<String, VaultError> {
        let combined = STANDARD
            .decode(sealed.trim())
            .map_err(|_| VaultError::Decryption)?;
        if combined.len() <= NONCE_LEN {
            return Err(VaultError::Decryption);
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::Decryption)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::Decryption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = EncryptionKey::generate();
        let sealed = key.seal("postgresql://u:p@h/db").unwrap();
        assert_ne!(sealed, "postgresql://u:p@h/db");
        assert_eq!(key.open(&sealed).unwrap(), "postgresql://u:p@h/db");
    }

    #[test]
    fn nonces_differ_between_seals() {
        let key = EncryptionKey::generate();
        assert_ne!(key.seal("same").unwrap(), key.seal("same").unwrap());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = EncryptionKey::generate().seal("secret").unwrap();
        let err = EncryptionKey::generate().open(&sealed).unwrap_err();
        assert!(matches!(err, VaultError::Decryption));
    }

    #[test]
    fn corrupted_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let sealed = key.seal("secret").unwrap();
        let mut bytes = STANDARD.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let corrupted = STANDARD.encode(bytes);

        assert!(matches!(key.open(&corrupted), Err(VaultError::Decryption)));
        assert!(matches!(key.open("not base64!"), Err(VaultError::Decryption)));
        assert!(matches!(key.open("AAAA"), Err(VaultError::Decryption)));
    }

    #[test]
    fn key_encoding() {
        let key = EncryptionKey::generate();
        let decoded = EncryptionKey::from_base64(&key.to_base64()).unwrap();
        let sealed = key.seal("x").unwrap();
        assert_eq!(decoded.open(&sealed).unwrap(), "x");

        assert!(EncryptionKey::from_base64("c2hvcnQ=").is_err());
        assert_eq!(format!("{key:?}"), "EncryptionKey(***)");
    }
}
