//! # Hashing Utilities
//!
//! Domain-separated hashing for the wallet core. BLAKE3 is the default for
//! everything wallet-native: kernel messages, key derivation, Schnorr
//! challenges, hash-to-curve. SHA-256 only shows up in the password-based
//! key derivation for the sealed seed, where compatibility with other
//! tooling matters more than speed.
//!
//! ## Domain separation
//!
//! Every hash in the protocol goes through [`DomainHasher`], which runs BLAKE3
//! in key-derivation mode with a context string. Two hashes with different
//! contexts can never collide, even on identical input. Each input part is
//! length-prefixed so `("ab", "c")` and `("a", "bc")` hash differently.

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use sha2::{Digest, Sha256};

use crate::config::HASH_OUTPUT_LENGTH;

/// Compute the BLAKE3 hash of the input data.
pub fn blake3_hash(data: &[u8]) -> [u8; HASH_OUTPUT_LENGTH] {
    *blake3::hash(data).as_bytes()
}

/// Compute the SHA-256 hash and return a fixed-size array.
pub fn sha256_array(data: &[u8]) -> [u8; HASH_OUTPUT_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; HASH_OUTPUT_LENGTH];
    output.copy_from_slice(&result);
    output
}

/// Incremental, domain-separated BLAKE3 hasher.
///
/// ```
/// use umbra_wallet::crypto::hash::DomainHasher;
///
/// let a = DomainHasher::new("umbra.example").chain(b"ab").chain(b"c").finalize();
/// let b = DomainHasher::new("umbra.example").chain(b"a").chain(b"bc").finalize();
/// assert_ne!(a, b);
/// ```
#[derive(Clone)]
pub struct DomainHasher {
    inner: blake3::Hasher,
}

impl DomainHasher {
    /// Start a hash under the given context string.
    pub fn new(context: &str) -> Self {
        Self {
            inner: blake3::Hasher::new_derive_key(context),
        }
    }

    /// Append a length-prefixed byte string.
    pub fn chain(mut self, bytes: &[u8]) -> Self {
        self.update(bytes);
        self
    }

    /// Append a `u64` in little-endian form.
    pub fn chain_u64(self, value: u64) -> Self {
        self.chain(&value.to_le_bytes())
    }

    /// In-place variant of [`DomainHasher::chain`] for loops.
    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(&(bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
    }

    /// 32-byte digest.
    pub fn finalize(&self) -> [u8; HASH_OUTPUT_LENGTH] {
        *self.inner.finalize().as_bytes()
    }

    /// Uniformly distributed scalar: 64 bytes of XOF output reduced mod ℓ.
    pub fn to_scalar(&self) -> Scalar {
        let mut wide = [0u8; 64];
        self.inner.finalize_xof().fill(&mut wide);
        Scalar::from_bytes_mod_order_wide(&wide)
    }

    /// Hash-to-group via the Ristretto elligator map. Nobody knows the
    /// discrete log of the result relative to any other generator.
    pub fn to_point(&self) -> RistrettoPoint {
        let mut wide = [0u8; 64];
        self.inner.finalize_xof().fill(&mut wide);
        RistrettoPoint::from_uniform_bytes(&wide)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_known_empty_digest() {
        assert_eq!(
            hex::encode(blake3_hash(b"")),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256_array(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn contexts_separate_identical_input() {
        let a = DomainHasher::new("umbra.test.a").chain(b"data").finalize();
        let b = DomainHasher::new("umbra.test.b").chain(b"data").finalize();
        assert_ne!(a, b, "different contexts must not collide");
    }

    #[test]
    fn length_prefix_prevents_concatenation_ambiguity() {
        let a = DomainHasher::new("umbra.test").chain(b"ab").chain(b"c").finalize();
        let b = DomainHasher::new("umbra.test").chain(b"a").chain(b"bc").finalize();
        assert_ne!(a, b);
    }

    #[test]
    fn scalar_and_point_are_deterministic() {
        let h = DomainHasher::new("umbra.test").chain_u64(42);
        assert_eq!(h.to_scalar(), h.clone().to_scalar());
        assert_eq!(h.to_point().compress(), h.to_point().compress());
    }
}
