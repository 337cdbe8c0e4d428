//! # Schnorr Signatures
//!
//! Two-party Schnorr over Ristretto, as used for transaction kernels.
//!
//! ```text
//! R = R_1 + R_2              aggregate public nonce
//! X = X_1 + X_2              aggregate public excess
//! e = H(R ‖ X ‖ m)           challenge, identical for both parties
//! s_i = k_i + e·x_i          partial signature
//! s = s_1 + s_2              valid iff s·G == R + e·X
//! ```
//!
//! A partial signature can be checked on its own against the signer's
//! public nonce and excess: `s_i·G == R_i + e·X_i`. The sender does exactly
//! that with the receiver's contribution before finalizing.

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use serde::{Deserialize, Serialize};

use super::commitment::blinding_generator;
use super::hash::DomainHasher;

/// Aggregate (or single-party) Schnorr signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Public nonce `R`.
    pub nonce_pub: CompressedRistretto,
    /// Scalar part `s`.
    pub k: Scalar,
}

/// Challenge `e = H(R ‖ X ‖ m)`.
pub fn challenge(
    nonce_pub: &CompressedRistretto,
    public_key: &CompressedRistretto,
    message: &[u8; 32],
) -> Scalar {
    DomainHasher::new("umbra.schnorr.challenge")
        .chain(nonce_pub.as_bytes())
        .chain(public_key.as_bytes())
        .chain(message)
        .to_scalar()
}

/// `s_i = k_i + e·x_i`.
pub fn sign_partial(secret: &Scalar, nonce: &Scalar, challenge: &Scalar) -> Scalar {
    nonce + challenge * secret
}

/// `s_i·G == R_i + e·X_i`.
pub fn verify_partial(
    partial: &Scalar,
    nonce_pub: &RistrettoPoint,
    public_key: &RistrettoPoint,
    challenge: &Scalar,
) -> bool {
    partial * blinding_generator() == nonce_pub + challenge * public_key
}

impl Signature {
    /// Single-party signature, used for payment confirmations and
    /// self-transaction kernels.
    pub fn sign(secret: &Scalar, nonce: &Scalar, message: &[u8; 32]) -> Self {
        let nonce_pub = (nonce * blinding_generator()).compress();
        let public_key = (secret * blinding_generator()).compress();
        let e = challenge(&nonce_pub, &public_key, message);
        Self {
            nonce_pub,
            k: sign_partial(secret, nonce, &e),
        }
    }

    /// Combine partial signatures under an already aggregated nonce.
    pub fn aggregate(nonce_pub: CompressedRistretto, partials: &[Scalar]) -> Self {
        Self {
            nonce_pub,
            k: partials.iter().sum(),
        }
    }

    pub fn verify(&self, public_key: &CompressedRistretto, message: &[u8; 32]) -> bool {
        let (Some(r), Some(x)) = (self.nonce_pub.decompress(), public_key.decompress()) else {
            return false;
        };
        let e = challenge(&self.nonce_pub, public_key, message);
        verify_partial(&self.k, &r, &x, &e)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MSG: [u8; 32] = [9u8; 32];

    #[test]
    fn single_party_roundtrip() {
        let x = Scalar::from(1234u64);
        let k = Scalar::from(5678u64);
        let sig = Signature::sign(&x, &k, &MSG);
        let pk = (x * blinding_generator()).compress();
        assert!(sig.verify(&pk, &MSG));
        assert!(!sig.verify(&pk, &[0u8; 32]), "wrong message must fail");
    }

    #[test]
    fn two_party_aggregate_verifies_and_partials_check() {
        let g = blinding_generator();
        let (x1, k1) = (Scalar::from(3u64), Scalar::from(17u64));
        let (x2, k2) = (Scalar::from(5u64), Scalar::from(19u64));
        let r = (k1 * g + k2 * g).compress();
        let x = (x1 * g + x2 * g).compress();
        let e = challenge(&r, &x, &MSG);

        let s1 = sign_partial(&x1, &k1, &e);
        let s2 = sign_partial(&x2, &k2, &e);
        assert!(verify_partial(&s2, &(k2 * g), &(x2 * g), &e));

        let sig = Signature::aggregate(r, &[s1, s2]);
        assert!(sig.verify(&x, &MSG));

        let tampered = Signature::aggregate(r, &[s1, s2 + Scalar::ONE]);
        assert!(!tampered.verify(&x, &MSG));
        assert!(!verify_partial(&(s2 + Scalar::ONE), &(k2 * g), &(x2 * g), &e));
    }
}
