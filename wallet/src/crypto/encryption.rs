//! # AES-256-GCM Sealing
//!
//! Authenticated encryption for secrets at rest: the master seed and the
//! persisted nonce pool. Both go through [`seal`] / [`open`] with an AAD
//! label naming what is sealed, so a nonce-pool blob can never be opened as
//! a seed blob even under the same key.
//!
//! ## Nonce management
//!
//! Random 96-bit nonces from `OsRng`. The birthday bound (~2^48 messages
//! per key) is unreachable for a wallet that seals on every nonce-slot
//! allocation.
//!
//! ## Wire format
//!
//! `seal()` returns `nonce || ciphertext`: 12 bytes of nonce followed by the
//! ciphertext with its 16-byte GCM tag appended.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;

use super::hash::sha256_array;
use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH};

/// Errors that can occur during sealing/opening.
///
/// Kept vague on purpose: "wrong key" and "corrupted ciphertext" look the
/// same from the outside.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    DecryptFailed,

    #[error("ciphertext too short: must be at least {AES_NONCE_LENGTH} bytes")]
    CiphertextTooShort,
}

/// Encrypt `plaintext`, authenticating `aad` alongside it.
pub fn seal(
    key: &[u8; AES_KEY_LENGTH],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::EncryptFailed)?;

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::EncryptFailed)?;

    let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt data produced by [`seal`] with the same key and AAD.
pub fn open(key: &[u8; AES_KEY_LENGTH], data: &[u8], aad: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if data.len() < AES_NONCE_LENGTH {
        return Err(EncryptionError::CiphertextTooShort);
    }

    let (nonce_bytes, ciphertext) = data.split_at(AES_NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::DecryptFailed)?;
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::DecryptFailed)
}

/// Derive a sealing key from a password and a per-wallet salt.
pub fn password_key(password: &[u8], salt: &[u8]) -> [u8; AES_KEY_LENGTH] {
    let mut material = Vec::with_capacity(password.len() + salt.len() + 16);
    material.extend_from_slice(password);
    material.extend_from_slice(salt);
    material.extend_from_slice(b"umbra.seed.key");
    sha256_array(&material)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        key
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = test_key();
        let sealed = seal(&key, b"nonce pool", b"umbra.test").unwrap();
        assert_eq!(open(&key, &sealed, b"umbra.test").unwrap(), b"nonce pool");
    }

    #[test]
    fn wrong_aad_fails() {
        let key = test_key();
        let sealed = seal(&key, b"seed", b"umbra.seed").unwrap();
        assert_eq!(
            open(&key, &sealed, b"umbra.nonces"),
            Err(EncryptionError::DecryptFailed)
        );
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&test_key(), b"seed", b"aad").unwrap();
        assert!(open(&[0xAA; 32], &sealed, b"aad").is_err());
    }

    #[test]
    fn truncated_blob_is_rejected() {
        assert_eq!(
            open(&test_key(), &[0u8; 4], b""),
            Err(EncryptionError::CiphertextTooShort)
        );
    }

    #[test]
    fn same_plaintext_seals_differently() {
        let key = test_key();
        let a = seal(&key, b"x", b"").unwrap();
        let b = seal(&key, b"x", b"").unwrap();
        assert_ne!(a, b, "random nonces must differ");
    }

    #[test]
    fn password_key_depends_on_salt() {
        assert_ne!(password_key(b"pw", b"salt-a"), password_key(b"pw", b"salt-b"));
        assert_eq!(password_key(b"pw", b"salt-a"), password_key(b"pw", b"salt-a"));
    }
}
