//! # Cryptographic Primitives
//!
//! Everything secret-adjacent in the wallet flows through here:
//!
//! - **Ristretto** (curve25519-dalek) for keys, commitments and Schnorr
//!   signatures.
//! - **Bulletproofs** for 64-bit range proofs on outputs.
//! - **BLAKE3** for domain-separated hashing and key derivation.
//! - **AES-256-GCM** for sealing secrets at rest.
//!
//! Nothing here is novel. Each module is a thin, typed layer over audited
//! implementations so the rest of the crate never touches raw curve bytes.

pub mod commitment;
pub mod encryption;
pub mod hash;
pub mod keys;
pub mod schnorr;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use thiserror::Error;

pub use commitment::{blinding_generator, commit, value_generator, RangeProofScheme};
pub use hash::{blake3_hash, DomainHasher};
pub use keys::{Kdf, KeyError, KeyId, KeyPair, KeyType};
pub use schnorr::Signature;

/// Opaque cryptographic failure. Callers propagate it; nothing here is
/// recoverable by retrying with the same input.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("point is not a valid Ristretto encoding")]
    InvalidPoint,

    #[error("range proof failure: {0}")]
    RangeProof(String),

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Decompress a wire point, rejecting non-canonical encodings.
pub fn decompress(point: &CompressedRistretto) -> Result<RistrettoPoint, CryptoError> {
    point.decompress().ok_or(CryptoError::InvalidPoint)
}
