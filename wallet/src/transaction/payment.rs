//! Payment proofs.
//!
//! The receiver signs `(kernel id, amount, asset, sender)` with the key
//! behind its address. Once the kernel is on chain, the sender can show the
//! signature to a third party as proof that this receiver was paid this
//! amount by this sender.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{Amount, AssetId, KernelId, WalletId};
use crate::crypto::hash::DomainHasher;
use crate::crypto::schnorr::Signature;

/// Message the receiver signs.
pub fn payment_confirmation_message(
    kernel_id: &KernelId,
    amount: Amount,
    asset_id: AssetId,
    sender: &WalletId,
) -> [u8; 32] {
    DomainHasher::new("umbra.payment-confirmation")
        .chain(&kernel_id.0)
        .chain_u64(amount)
        .chain(&asset_id.to_le_bytes())
        .chain(&sender.0)
        .finalize()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaymentProofError {
    #[error("payment proof is not valid hex")]
    Hex,

    #[error("payment proof is malformed")]
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentProof {
    pub sender: WalletId,
    pub receiver: WalletId,
    pub amount: Amount,
    pub asset_id: AssetId,
    pub kernel_id: KernelId,
    pub signature: Signature,
}

impl PaymentProof {
    pub fn is_valid(&self) -> bool {
        let message =
            payment_confirmation_message(&self.kernel_id, self.amount, self.asset_id, &self.sender);
        self.signature.verify(&self.receiver.public_key(), &message)
    }
}

/// Hex of the bincode encoding, for copy-paste between users.
impl fmt::Display for PaymentProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = bincode::serialize(self).map_err(|_| fmt::Error)?;
        f.write_str(&hex::encode(bytes))
    }
}

impl FromStr for PaymentProof {
    type Err = PaymentProofError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| PaymentProofError::Hex)?;
        bincode::deserialize(&bytes).map_err(|_| PaymentProofError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::commitment::blinding_generator;
    use curve25519_dalek::scalar::Scalar;

    fn proof() -> PaymentProof {
        let receiver_key = Scalar::from(42u64);
        let sender = WalletId::from(Scalar::from(7u64) * blinding_generator());
        let kernel_id = KernelId([3u8; 32]);
        let message = payment_confirmation_message(&kernel_id, 1_000, 0, &sender);
        PaymentProof {
            sender,
            receiver: WalletId::from(receiver_key * blinding_generator()),
            amount: 1_000,
            asset_id: 0,
            kernel_id,
            signature: Signature::sign(&receiver_key, &Scalar::from(99u64), &message),
        }
    }

    #[test]
    fn valid_proof_verifies() {
        assert!(proof().is_valid());
    }

    #[test]
    fn amount_is_bound_by_the_signature() {
        let mut p = proof();
        p.amount += 1;
        assert!(!p.is_valid());
    }

    #[test]
    fn text_form_parses_back() {
        let p = proof();
        let parsed: PaymentProof = p.to_string().parse().unwrap();
        assert_eq!(parsed, p);
        assert_eq!("zz".parse::<PaymentProof>(), Err(PaymentProofError::Hex));
    }
}
