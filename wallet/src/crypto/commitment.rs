//! # Pedersen Commitments & Range Proofs
//!
//! An output commits to its value `v` with blinding factor `r` as
//! `C = r·G + v·H_a`, where `G` is the Ristretto basepoint and `H_a` the value
//! generator of asset `a`. The native asset uses `H`; every other asset gets
//! its own hash-to-curve generator so values of different assets never mix
//! in the balance equation.
//!
//! Range proofs are single-value Bulletproofs over 64 bits. The transcript
//! domain depends on the output scheme: v2 outputs bind the asset id into
//! the transcript, v1 outputs do not and are rejected past
//! [`RANGEPROOF_V2_HEIGHT`].

use std::sync::OnceLock;

use bulletproofs::{BulletproofGens, PedersenGens, RangeProof};
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use merlin::Transcript;
use serde::{Deserialize, Serialize};

use super::hash::DomainHasher;
use super::CryptoError;
use crate::config::{RANGEPROOF_BITS, RANGEPROOF_V2_HEIGHT};
use crate::transaction::types::{AssetId, Height, NATIVE_ASSET};

/// Range-proof transcript scheme, chosen by the height an output is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeProofScheme {
    V1,
    V2,
}

impl RangeProofScheme {
    pub fn for_height(height: Height) -> Self {
        if height >= RANGEPROOF_V2_HEIGHT {
            RangeProofScheme::V2
        } else {
            RangeProofScheme::V1
        }
    }

    fn transcript(self, asset_id: AssetId) -> Transcript {
        match self {
            RangeProofScheme::V1 => Transcript::new(b"umbra.rangeproof.v1"),
            RangeProofScheme::V2 => {
                let mut t = Transcript::new(b"umbra.rangeproof.v2");
                t.append_u64(b"asset", u64::from(asset_id));
                t
            }
        }
    }
}

/// The blinding generator `G`. Also the generator for every public key and
/// Schnorr nonce in the wallet.
pub fn blinding_generator() -> RistrettoPoint {
    RISTRETTO_BASEPOINT_POINT
}

/// Value generator for `asset_id`.
pub fn value_generator(asset_id: AssetId) -> RistrettoPoint {
    static NATIVE: OnceLock<RistrettoPoint> = OnceLock::new();
    if asset_id == NATIVE_ASSET {
        return *NATIVE.get_or_init(|| DomainHasher::new("umbra.generator.value").to_point());
    }
    DomainHasher::new("umbra.generator.asset")
        .chain(&asset_id.to_le_bytes())
        .to_point()
}

fn pedersen_gens(asset_id: AssetId) -> PedersenGens {
    PedersenGens {
        B: value_generator(asset_id),
        B_blinding: blinding_generator(),
    }
}

fn bulletproof_gens() -> &'static BulletproofGens {
    static GENS: OnceLock<BulletproofGens> = OnceLock::new();
    GENS.get_or_init(|| BulletproofGens::new(RANGEPROOF_BITS, 1))
}

/// `r·G + v·H_a`.
pub fn commit(value: u64, blinding: &Scalar, asset_id: AssetId) -> RistrettoPoint {
    pedersen_gens(asset_id).commit(Scalar::from(value), *blinding)
}

/// Prove that the commitment to `(value, blinding)` opens to a 64-bit value.
///
/// Returns the serialized proof and the commitment it was made for.
pub fn prove_range(
    value: u64,
    blinding: &Scalar,
    asset_id: AssetId,
    scheme: RangeProofScheme,
) -> Result<(Vec<u8>, CompressedRistretto), CryptoError> {
    let mut transcript = scheme.transcript(asset_id);
    let (proof, commitment) = RangeProof::prove_single(
        bulletproof_gens(),
        &pedersen_gens(asset_id),
        &mut transcript,
        value,
        blinding,
        RANGEPROOF_BITS,
    )
    .map_err(|e| CryptoError::RangeProof(format!("{e:?}")))?;
    Ok((proof.to_bytes(), commitment))
}

/// Check a serialized range proof against a commitment.
pub fn verify_range(
    proof: &[u8],
    commitment: &CompressedRistretto,
    asset_id: AssetId,
    scheme: RangeProofScheme,
) -> bool {
    let Ok(proof) = RangeProof::from_bytes(proof) else {
        return false;
    };
    let mut transcript = scheme.transcript(asset_id);
    proof
        .verify_single(
            bulletproof_gens(),
            &pedersen_gens(asset_id),
            &mut transcript,
            commitment,
            RANGEPROOF_BITS,
        )
        .is_ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commitment_is_homomorphic() {
        let r1 = Scalar::from(11u64);
        let r2 = Scalar::from(31u64);
        let sum = commit(5, &r1, NATIVE_ASSET) + commit(7, &r2, NATIVE_ASSET);
        assert_eq!(sum, commit(12, &(r1 + r2), NATIVE_ASSET));
    }

    #[test]
    fn asset_generators_are_distinct() {
        assert_ne!(value_generator(NATIVE_ASSET), value_generator(1));
        assert_ne!(value_generator(1), value_generator(2));
        assert_ne!(value_generator(NATIVE_ASSET), blinding_generator());
    }

    #[test]
    fn range_proof_verifies_for_matching_commitment() {
        let r = Scalar::from(99u64);
        let (proof, c) = prove_range(1_000, &r, NATIVE_ASSET, RangeProofScheme::V2).unwrap();
        assert_eq!(c, commit(1_000, &r, NATIVE_ASSET).compress());
        assert!(verify_range(&proof, &c, NATIVE_ASSET, RangeProofScheme::V2));
    }

    #[test]
    fn range_proof_rejects_other_value_commitment() {
        let r = Scalar::from(99u64);
        let (proof, _) = prove_range(1_000, &r, NATIVE_ASSET, RangeProofScheme::V2).unwrap();
        let other = commit(1_001, &r, NATIVE_ASSET).compress();
        assert!(!verify_range(&proof, &other, NATIVE_ASSET, RangeProofScheme::V2));
    }

    #[test]
    fn range_proof_is_bound_to_scheme() {
        let r = Scalar::from(5u64);
        let (proof, c) = prove_range(42, &r, NATIVE_ASSET, RangeProofScheme::V1).unwrap();
        assert!(verify_range(&proof, &c, NATIVE_ASSET, RangeProofScheme::V1));
        assert!(!verify_range(&proof, &c, NATIVE_ASSET, RangeProofScheme::V2));
    }

    #[test]
    fn garbage_proof_bytes_fail_cleanly() {
        let c = commit(1, &Scalar::ONE, NATIVE_ASSET).compress();
        assert!(!verify_range(&[1, 2, 3], &c, NATIVE_ASSET, RangeProofScheme::V2));
    }

    #[test]
    fn scheme_switches_at_fork_height() {
        assert_eq!(
            RangeProofScheme::for_height(RANGEPROOF_V2_HEIGHT - 1),
            RangeProofScheme::V1
        );
        assert_eq!(
            RangeProofScheme::for_height(RANGEPROOF_V2_HEIGHT),
            RangeProofScheme::V2
        );
    }
}
