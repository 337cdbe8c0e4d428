//! # Key Management
//!
//! Deterministic key derivation for the wallet. One 32-byte master seed
//! yields every secret the wallet will ever use: coin blinding factors,
//! address keys, asset owner keys, storage sealing keys.
//!
//! ## Derivation tree
//!
//! ```text
//! seed ── master Kdf ─┬─ derive_key(KeyId { idx, type, sub_idx: 0 })
//!                     ├─ child(sub_idx) ── derive_key(...)
//!                     ├─ named_child("sbbs") ── address keys
//!                     └─ derive_bytes("purpose") ── symmetric keys
//! ```
//!
//! Key bytes are never logged and never serialized. `Debug` impls print
//! placeholders. If you add logging to this module, you will be asked to
//! leave.

use std::fmt;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::commitment::blinding_generator;
use super::hash::DomainHasher;
use crate::config::{MAX_SUBKEY_INDEX, SEED_LENGTH};

/// Errors that can occur during key derivation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("sub-key index {0} is outside the derivation tree")]
    SubKeyOutOfRange(u32),

    #[error("key type {0:?} cannot own a coin")]
    NotACoinKey(KeyType),
}

/// What a derived key is used for. Part of every derivation input, so keys
/// of different types never coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyType {
    Regular,
    Change,
    Coinbase,
    Comission,
    Treasury,
    /// Secure-messaging (address) keys.
    Bbs,
    AssetOwner,
}

impl KeyType {
    /// Only these types may back a [`CoinId`](crate::transaction::types::CoinId).
    pub fn is_coin(self) -> bool {
        matches!(
            self,
            KeyType::Regular
                | KeyType::Change
                | KeyType::Coinbase
                | KeyType::Comission
                | KeyType::Treasury
        )
    }

    fn tag(self) -> u8 {
        match self {
            KeyType::Regular => 0,
            KeyType::Change => 1,
            KeyType::Coinbase => 2,
            KeyType::Comission => 3,
            KeyType::Treasury => 4,
            KeyType::Bbs => 5,
            KeyType::AssetOwner => 6,
        }
    }
}

/// Path to one leaf of the derivation tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId {
    pub idx: u64,
    pub key_type: KeyType,
    pub sub_idx: u32,
}

impl KeyId {
    pub fn new(idx: u64, key_type: KeyType) -> Self {
        Self {
            idx,
            key_type,
            sub_idx: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// KeyPair
// ---------------------------------------------------------------------------

/// A secret scalar together with its public point `secret·G`.
///
/// Equality compares public points only. `KeyPair` deliberately does not
/// implement `Serialize`: writing a secret somewhere should be a conscious
/// act, not a side effect of shoving a struct into bincode.
#[derive(Clone)]
pub struct KeyPair {
    secret: Scalar,
    public: RistrettoPoint,
}

impl KeyPair {
    pub fn from_secret(secret: Scalar) -> Self {
        Self {
            public: secret * blinding_generator(),
            secret,
        }
    }

    pub fn secret(&self) -> &Scalar {
        &self.secret
    }

    pub fn public(&self) -> RistrettoPoint {
        self.public
    }

    pub fn public_compressed(&self) -> CompressedRistretto {
        self.public.compress()
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for KeyPair {}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.compress().as_bytes()))
            .field("secret", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Kdf
// ---------------------------------------------------------------------------

/// Hierarchical key-derivation function.
pub struct Kdf {
    secret: [u8; 32],
}

impl Kdf {
    /// Master KDF for a wallet seed.
    pub fn from_seed(seed: &[u8; SEED_LENGTH]) -> Self {
        Self {
            secret: DomainHasher::new("umbra.kdf.master").chain(seed).finalize(),
        }
    }

    /// Numbered child, selected by a coin's `sub_idx`.
    pub fn child(&self, index: u32) -> Kdf {
        Self {
            secret: DomainHasher::new("umbra.kdf.child")
                .chain(&self.secret)
                .chain(&index.to_le_bytes())
                .finalize(),
        }
    }

    /// Named child for a whole subsystem (e.g. secure messaging).
    pub fn named_child(&self, name: &str) -> Kdf {
        Self {
            secret: DomainHasher::new("umbra.kdf.named")
                .chain(&self.secret)
                .chain(name.as_bytes())
                .finalize(),
        }
    }

    /// Secret scalar at `id`. Fails for sub-key indices outside 24 bits.
    pub fn derive_key(&self, id: &KeyId) -> Result<Scalar, KeyError> {
        if id.sub_idx >= MAX_SUBKEY_INDEX {
            return Err(KeyError::SubKeyOutOfRange(id.sub_idx));
        }
        let scalar = |kdf: &Kdf| {
            DomainHasher::new("umbra.kdf.key")
                .chain(&kdf.secret)
                .chain_u64(id.idx)
                .chain(&[id.key_type.tag()])
                .to_scalar()
        };
        if id.sub_idx == 0 {
            Ok(scalar(self))
        } else {
            Ok(scalar(&self.child(id.sub_idx)))
        }
    }

    pub fn derive_keypair(&self, id: &KeyId) -> Result<KeyPair, KeyError> {
        Ok(KeyPair::from_secret(self.derive_key(id)?))
    }

    /// Public point at `id`, without handing the secret to the caller.
    pub fn derive_public(&self, id: &KeyId) -> Result<RistrettoPoint, KeyError> {
        Ok(self.derive_key(id)? * blinding_generator())
    }

    /// 32 secret bytes for a purpose string, e.g. a symmetric storage key.
    pub fn derive_bytes(&self, purpose: &str) -> [u8; 32] {
        DomainHasher::new("umbra.kdf.bytes")
            .chain(&self.secret)
            .chain(purpose.as_bytes())
            .finalize()
    }
}

impl fmt::Debug for Kdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Kdf(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn kdf() -> Kdf {
        Kdf::from_seed(&[7u8; SEED_LENGTH])
    }

    #[test]
    fn derivation_is_deterministic() {
        let id = KeyId::new(5, KeyType::Regular);
        assert_eq!(kdf().derive_key(&id), kdf().derive_key(&id));
    }

    #[test]
    fn key_type_separates_keys() {
        let a = kdf().derive_key(&KeyId::new(5, KeyType::Regular)).unwrap();
        let b = kdf().derive_key(&KeyId::new(5, KeyType::Change)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn sub_index_selects_child_tree() {
        let mut id = KeyId::new(1, KeyType::Regular);
        let root = kdf().derive_key(&id).unwrap();
        id.sub_idx = 3;
        let child = kdf().derive_key(&id).unwrap();
        assert_ne!(root, child);
    }

    #[test]
    fn sub_index_out_of_range_is_rejected() {
        let mut id = KeyId::new(1, KeyType::Regular);
        id.sub_idx = MAX_SUBKEY_INDEX;
        assert_eq!(
            kdf().derive_key(&id),
            Err(KeyError::SubKeyOutOfRange(MAX_SUBKEY_INDEX))
        );
    }

    #[test]
    fn keypair_public_matches_derive_public() {
        let id = KeyId::new(9, KeyType::Bbs);
        let kp = kdf().derive_keypair(&id).unwrap();
        assert_eq!(kp.public(), kdf().derive_public(&id).unwrap());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let kp = kdf().derive_keypair(&KeyId::new(1, KeyType::Regular)).unwrap();
        let rendered = format!("{kp:?} {:?}", kdf());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains(&hex::encode(kp.secret().as_bytes())));
    }

    #[test]
    fn only_coin_types_back_coins() {
        assert!(KeyType::Regular.is_coin());
        assert!(KeyType::Change.is_coin());
        assert!(!KeyType::Bbs.is_coin());
        assert!(!KeyType::AssetOwner.is_coin());
    }
}
