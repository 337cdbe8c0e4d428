//! Transaction verification: structural checks and cryptographic validation.
//!
//! Every transaction the wallet assembles passes [`verify_transaction`]
//! before it reaches the chain gateway, and the in-process chain runs the
//! same check on submission. Checks are ordered from cheapest to most
//! expensive: structure, heights, kernel signatures, range proofs, and
//! finally the value-balance equation
//!
//! ```text
//! Σinputs − Σoutputs − fee·H + Σ(emission·H_a) == Σexcess + offset·G
//! ```

use std::collections::HashSet;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use thiserror::Error;

use super::tx::Transaction;
use super::types::{Height, NATIVE_ASSET};
use crate::config::RANGEPROOF_V2_HEIGHT;
use crate::crypto::commitment::{blinding_generator, value_generator, verify_range, RangeProofScheme};
use crate::crypto::decompress;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during transaction verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction has no kernels")]
    NoKernels,

    #[error("input {index} appears more than once")]
    DuplicateInput { index: usize },

    #[error("output {index} appears more than once")]
    DuplicateOutput { index: usize },

    #[error("height {height} is outside kernel window [{min}, {max}]")]
    HeightOutOfRange { height: Height, min: Height, max: Height },

    #[error("kernel {index} signature does not verify")]
    InvalidKernelSignature { index: usize },

    #[error("output {index} range proof does not verify")]
    InvalidRangeProof { index: usize },

    #[error("output {index} uses an obsolete range proof scheme")]
    ObsoleteRangeProof { index: usize },

    #[error("commitment is not a valid curve point")]
    InvalidPoint,

    #[error("value balance does not hold")]
    ValueImbalance,
}

/// Chain context a transaction is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationContext {
    /// Height of the block the transaction would be included in.
    pub height: Height,
}

impl ValidationContext {
    pub fn at_height(height: Height) -> Self {
        Self { height }
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Full validation of an assembled transaction.
pub fn verify_transaction(tx: &Transaction, ctx: &ValidationContext) -> Result<(), TransactionError> {
    if tx.kernels.is_empty() {
        return Err(TransactionError::NoKernels);
    }

    let mut seen = HashSet::new();
    for (index, input) in tx.inputs.iter().enumerate() {
        if !seen.insert(input.commitment.to_bytes()) {
            return Err(TransactionError::DuplicateInput { index });
        }
    }
    seen.clear();
    for (index, output) in tx.outputs.iter().enumerate() {
        if !seen.insert(output.commitment.to_bytes()) {
            return Err(TransactionError::DuplicateOutput { index });
        }
    }

    for (index, kernel) in tx.kernels.iter().enumerate() {
        if ctx.height < kernel.min_height || ctx.height > kernel.max_height {
            return Err(TransactionError::HeightOutOfRange {
                height: ctx.height,
                min: kernel.min_height,
                max: kernel.max_height,
            });
        }
        if !kernel.verify_signature() {
            return Err(TransactionError::InvalidKernelSignature { index });
        }
    }

    for (index, output) in tx.outputs.iter().enumerate() {
        if output.scheme == RangeProofScheme::V1 && ctx.height >= RANGEPROOF_V2_HEIGHT {
            return Err(TransactionError::ObsoleteRangeProof { index });
        }
        if !verify_range(&output.range_proof, &output.commitment, output.asset_id, output.scheme) {
            return Err(TransactionError::InvalidRangeProof { index });
        }
    }

    if !is_balanced(tx)? {
        return Err(TransactionError::ValueImbalance);
    }
    Ok(())
}

/// Evaluate the value-balance equation alone.
pub fn is_balanced(tx: &Transaction) -> Result<bool, TransactionError> {
    let point = |c: &CompressedRistretto| decompress(c).map_err(|_| TransactionError::InvalidPoint);

    let mut lhs = RistrettoPoint::identity();
    for input in &tx.inputs {
        lhs += point(&input.commitment)?;
    }
    for output in &tx.outputs {
        lhs -= point(&output.commitment)?;
    }
    lhs -= Scalar::from(tx.total_fee()) * value_generator(NATIVE_ASSET);

    let mut rhs = tx.offset * blinding_generator();
    for kernel in &tx.kernels {
        rhs += point(&kernel.excess)?;
        if let Some(emission) = &kernel.asset_emission {
            lhs += signed_scalar(emission.value) * value_generator(emission.asset_id);
        }
    }
    Ok(lhs == rhs)
}

/// `i64` as a scalar, negatives mapping to `ℓ - |v|`.
pub fn signed_scalar(value: i64) -> Scalar {
    let magnitude = Scalar::from(value.unsigned_abs());
    if value < 0 {
        -magnitude
    } else {
        magnitude
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::commitment::{commit, prove_range};
    use crate::crypto::schnorr::Signature;
    use crate::transaction::kernel::{kernel_message, TxKernel};
    use crate::transaction::tx::{Input, Output};

    const HEIGHT: Height = 134;

    /// 1000 in, 900 out, fee 100, all blinding factors known.
    fn balanced_tx() -> Transaction {
        let r_in = Scalar::from(1111u64);
        let r_out = Scalar::from(2222u64);
        let offset = Scalar::from(33u64);
        let x = r_in - r_out - offset;

        let (range_proof, commitment) =
            prove_range(900, &r_out, NATIVE_ASSET, RangeProofScheme::V2).unwrap();
        let excess = (x * blinding_generator()).compress();
        let msg = kernel_message(100, 120, 240, &excess, None);

        Transaction {
            inputs: vec![Input {
                commitment: commit(1000, &r_in, NATIVE_ASSET).compress(),
            }],
            outputs: vec![Output {
                commitment,
                range_proof,
                scheme: RangeProofScheme::V2,
                asset_id: NATIVE_ASSET,
            }],
            kernels: vec![TxKernel {
                excess,
                fee: 100,
                min_height: 120,
                max_height: 240,
                signature: Signature::sign(&x, &Scalar::from(5u64), &msg),
                asset_emission: None,
            }],
            offset,
        }
    }

    #[test]
    fn balanced_transaction_verifies() {
        let tx = balanced_tx();
        assert_eq!(verify_transaction(&tx, &ValidationContext::at_height(HEIGHT)), Ok(()));
    }

    #[test]
    fn output_off_by_one_unit_breaks_balance() {
        let mut tx = balanced_tx();
        let bumped = decompress(&tx.outputs[0].commitment).unwrap() + value_generator(NATIVE_ASSET);
        tx.outputs[0].commitment = bumped.compress();
        assert_eq!(is_balanced(&tx), Ok(false));
        assert!(verify_transaction(&tx, &ValidationContext::at_height(HEIGHT)).is_err());
    }

    #[test]
    fn wrong_offset_breaks_balance() {
        let mut tx = balanced_tx();
        tx.offset += Scalar::ONE;
        assert_eq!(
            verify_transaction(&tx, &ValidationContext::at_height(HEIGHT)),
            Err(TransactionError::ValueImbalance)
        );
    }

    #[test]
    fn height_outside_window_is_rejected() {
        let tx = balanced_tx();
        assert!(matches!(
            verify_transaction(&tx, &ValidationContext::at_height(241)),
            Err(TransactionError::HeightOutOfRange { .. })
        ));
    }

    #[test]
    fn tampered_kernel_signature_is_rejected() {
        let mut tx = balanced_tx();
        tx.kernels[0].signature.k += Scalar::ONE;
        assert_eq!(
            verify_transaction(&tx, &ValidationContext::at_height(HEIGHT)),
            Err(TransactionError::InvalidKernelSignature { index: 0 })
        );
    }

    #[test]
    fn duplicate_input_is_rejected() {
        let mut tx = balanced_tx();
        tx.inputs.push(tx.inputs[0]);
        assert_eq!(
            verify_transaction(&tx, &ValidationContext::at_height(HEIGHT)),
            Err(TransactionError::DuplicateInput { index: 1 })
        );
    }

    #[test]
    fn empty_kernel_list_is_rejected() {
        let mut tx = balanced_tx();
        tx.kernels.clear();
        assert_eq!(
            verify_transaction(&tx, &ValidationContext::at_height(HEIGHT)),
            Err(TransactionError::NoKernels)
        );
    }

    #[test]
    fn signed_scalar_negates() {
        assert_eq!(signed_scalar(-5) + signed_scalar(5), Scalar::ZERO);
    }
}
