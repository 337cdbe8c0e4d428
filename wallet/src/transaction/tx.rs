//! The assembled transaction: what the chain gateway receives.

use curve25519_dalek::ristretto::CompressedRistretto;
use curve25519_dalek::scalar::Scalar;
use serde::{Deserialize, Serialize};

use super::kernel::TxKernel;
use super::types::{Amount, AssetId};
use crate::crypto::commitment::RangeProofScheme;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub commitment: CompressedRistretto,
}

/// A blinded output. `asset_id` and `scheme` are public metadata: they select
/// the value generator and the range-proof transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub commitment: CompressedRistretto,
    pub range_proof: Vec<u8>,
    pub scheme: RangeProofScheme,
    pub asset_id: AssetId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kernels: Vec<TxKernel>,
    pub offset: Scalar,
}

impl Transaction {
    /// Canonical order: inputs and outputs sorted by commitment bytes. Both
    /// parties end up with byte-identical transactions regardless of who
    /// contributed what.
    pub fn normalize(&mut self) {
        self.inputs.sort_by(|a, b| a.commitment.as_bytes().cmp(b.commitment.as_bytes()));
        self.outputs.sort_by(|a, b| a.commitment.as_bytes().cmp(b.commitment.as_bytes()));
        self.kernels.sort_by_key(|k| k.id().0);
    }

    pub fn total_fee(&self) -> Amount {
        self.kernels.iter().map(|k| k.fee).sum()
    }
}
