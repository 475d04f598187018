//! Encryption at rest for sensitive state values.
//!
//! A 256-bit key is derived from a passphrase with Argon2id and a per-document
//! random salt; values are sealed with AES-256-GCM. Only the salt and a check
//! value are persisted, never the key or the passphrase.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use argon2::Argon2;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, StateError};

/// Nonce size for AES-256-GCM (96 bits).
const NONCE_SIZE: usize = 12;

/// Key size for AES-256 (256 bits).
const KEY_SIZE: usize = 32;

/// Salt size for key derivation.
const SALT_SIZE: usize = 16;

/// Plaintext sealed into every document to detect a wrong passphrase early.
const CHECK_PLAINTEXT: &str = "stackwarden";

/// A sealed value as stored in the document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedValue {
    /// Base64-encoded ciphertext.
    pub ciphertext: String,
    /// Base64-encoded nonce.
    pub nonce: String,
}

/// Passphrase supplied out of band. Never serialized.
#[derive(Clone)]
pub struct Passphrase(String);

impl Passphrase {
    /// Wraps a passphrase.
    ///
    /// # Errors
    ///
    /// Returns an encryption error if the passphrase is empty.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(StateError::encryption("Passphrase cannot be empty").into());
        }
        Ok(Self(value))
    }

    /// Derives the cipher for a document salt.
    ///
    /// # Errors
    ///
    /// Returns an encryption error if the salt is malformed.
    pub fn cipher(&self, salt_b64: &str) -> Result<StateCipher> {
        let salt = BASE64
            .decode(salt_b64)
            .map_err(|e| StateError::encryption(format!("Invalid salt base64: {e}")))?;

        let mut key = [0u8; KEY_SIZE];
        Argon2::default()
            .hash_password_into(self.0.as_bytes(), &salt, &mut key)
            .map_err(|e| StateError::encryption(format!("Key derivation failed: {e}")))?;

        Ok(StateCipher {
            key,
            salt: salt_b64.to_string(),
        })
    }

    /// Derives a cipher with a fresh random salt.
    ///
    /// # Errors
    ///
    /// Returns an encryption error if key derivation fails.
    pub fn fresh_cipher(&self) -> Result<StateCipher> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        self.cipher(&BASE64.encode(salt))
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// A derived key bound to its salt.
pub struct StateCipher {
    key: [u8; KEY_SIZE],
    salt: String,
}

impl StateCipher {
    /// Base64 salt the key was derived with.
    #[must_use]
    pub fn salt(&self) -> &str {
        &self.salt
    }

    /// Encrypts a plaintext value.
    ///
    /// # Errors
    ///
    /// Returns an encryption error if the cipher fails.
    pub fn seal(&self, plaintext: &str) -> Result<SealedValue> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| StateError::encryption(format!("Failed to create cipher: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| StateError::encryption(format!("Encryption failed: {e}")))?;

        Ok(SealedValue {
            ciphertext: BASE64.encode(&ciphertext),
            nonce: BASE64.encode(nonce_bytes),
        })
    }

    /// Decrypts a sealed value.
    ///
    /// # Errors
    ///
    /// Returns an encryption error for a wrong key or tampered data.
    pub fn open(&self, sealed: &SealedValue) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| StateError::encryption(format!("Failed to create cipher: {e}")))?;

        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .map_err(|e| StateError::encryption(format!("Invalid ciphertext base64: {e}")))?;
        let nonce_bytes = BASE64
            .decode(&sealed.nonce)
            .map_err(|e| StateError::encryption(format!("Invalid nonce base64: {e}")))?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(StateError::encryption("Invalid nonce size").into());
        }

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| StateError::encryption("Decryption failed (wrong passphrase?)"))?;

        String::from_utf8(plaintext)
            .map_err(|e| StateError::encryption(format!("Invalid UTF-8 in decrypted value: {e}")).into())
    }

    /// Seals the fixed check value.
    ///
    /// # Errors
    ///
    /// Returns an encryption error if the cipher fails.
    pub fn check_value(&self) -> Result<SealedValue> {
        self.seal(CHECK_PLAINTEXT)
    }

    /// Verifies a stored check value against this key.
    ///
    /// # Errors
    ///
    /// Returns an encryption error if the passphrase does not match.
    pub fn verify(&self, check: &SealedValue) -> Result<()> {
        match self.open(check) {
            Ok(text) if text == CHECK_PLAINTEXT => Ok(()),
            _ => Err(StateError::encryption("Incorrect state passphrase").into()),
        }
    }
}

impl fmt::Debug for StateCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCipher")
            .field("key", &"<redacted>")
            .field("salt", &self.salt)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let cipher = Passphrase::new("correct horse").unwrap().fresh_cipher().unwrap();
        let sealed = cipher.seal("my-secret-password").unwrap();
        assert_ne!(sealed.ciphertext, "my-secret-password");
        assert_eq!(cipher.open(&sealed).unwrap(), "my-secret-password");
    }

    #[test]
    fn test_same_salt_same_key() {
        let pass = Passphrase::new("correct horse").unwrap();
        let first = pass.fresh_cipher().unwrap();
        let second = pass.cipher(first.salt()).unwrap();

        let sealed = first.seal("value").unwrap();
        assert_eq!(second.open(&sealed).unwrap(), "value");
    }

    #[test]
    fn test_wrong_passphrase_fails_check() {
        let right = Passphrase::new("right").unwrap().fresh_cipher().unwrap();
        let wrong = Passphrase::new("wrong").unwrap().cipher(right.salt()).unwrap();

        let check = right.check_value().unwrap();
        assert!(right.verify(&check).is_ok());
        assert!(wrong.verify(&check).is_err());
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(Passphrase::new("").is_err());
    }

    #[test]
    fn test_debug_redacts() {
        let pass = Passphrase::new("hunter2").unwrap();
        assert!(!format!("{pass:?}").contains("hunter2"));
    }
}
