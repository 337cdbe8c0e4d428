//! Transaction kernels.
//!
//! A kernel carries the fee, the validity height window and the aggregate
//! Schnorr signature proving that its excess commits to zero value. Asset
//! emission kernels additionally name an asset, its owner key and the signed
//! amount minted (positive) or burned (negative); they are signed under
//! `excess + owner` so only the owner can emit.

use curve25519_dalek::ristretto::CompressedRistretto;
use serde::{Deserialize, Serialize};

use super::types::{Amount, AssetId, Height, KernelId, WalletId};
use crate::crypto::hash::DomainHasher;
use crate::crypto::schnorr::Signature;
use crate::crypto::{decompress, CryptoError};

/// Issue or burn of an asset, bound to the owner's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEmission {
    pub asset_id: AssetId,
    pub owner: CompressedRistretto,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxKernel {
    pub excess: CompressedRistretto,
    pub fee: Amount,
    pub min_height: Height,
    pub max_height: Height,
    pub signature: Signature,
    pub asset_emission: Option<AssetEmission>,
}

/// The message both parties sign. Everything but the signature.
pub fn kernel_message(
    fee: Amount,
    min_height: Height,
    max_height: Height,
    excess: &CompressedRistretto,
    emission: Option<&AssetEmission>,
) -> [u8; 32] {
    let mut h = DomainHasher::new("umbra.kernel")
        .chain_u64(fee)
        .chain_u64(min_height)
        .chain_u64(max_height)
        .chain(excess.as_bytes());
    if let Some(e) = emission {
        h.update(&e.asset_id.to_le_bytes());
        h.update(e.owner.as_bytes());
        h.update(&e.value.to_le_bytes());
    }
    h.finalize()
}

/// Key the kernel signature verifies against.
pub fn kernel_signing_key(
    excess: &CompressedRistretto,
    emission: Option<&AssetEmission>,
) -> Result<CompressedRistretto, CryptoError> {
    match emission {
        None => Ok(*excess),
        Some(e) => Ok((decompress(excess)? + decompress(&e.owner)?).compress()),
    }
}

impl TxKernel {
    pub fn message(&self) -> [u8; 32] {
        kernel_message(
            self.fee,
            self.min_height,
            self.max_height,
            &self.excess,
            self.asset_emission.as_ref(),
        )
    }

    pub fn id(&self) -> KernelId {
        KernelId(self.message())
    }

    pub fn verify_signature(&self) -> bool {
        match kernel_signing_key(&self.excess, self.asset_emission.as_ref()) {
            Ok(key) => self.signature.verify(&key, &self.message()),
            Err(_) => false,
        }
    }
}

/// Kernel fields a keeper needs to produce a partial signature.
///
/// The peer's public excess and nonce are absent on the sender's initial
/// pass and present everywhere else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelParameters {
    pub fee: Amount,
    pub min_height: Height,
    pub max_height: Height,
    pub peer_public_excess: Option<CompressedRistretto>,
    pub peer_public_nonce: Option<CompressedRistretto>,
    pub my_id: Option<WalletId>,
    pub peer_id: Option<WalletId>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::blinding_generator;
    use curve25519_dalek::scalar::Scalar;

    fn signed_kernel() -> TxKernel {
        let x = Scalar::from(77u64);
        let excess = (x * blinding_generator()).compress();
        let msg = kernel_message(100, 10, 130, &excess, None);
        TxKernel {
            excess,
            fee: 100,
            min_height: 10,
            max_height: 130,
            signature: Signature::sign(&x, &Scalar::from(3u64), &msg),
            asset_emission: None,
        }
    }

    #[test]
    fn signed_kernel_verifies() {
        assert!(signed_kernel().verify_signature());
    }

    #[test]
    fn changing_fee_breaks_signature_and_id() {
        let kernel = signed_kernel();
        let mut tampered = kernel.clone();
        tampered.fee += 1;
        assert!(!tampered.verify_signature());
        assert_ne!(tampered.id(), kernel.id());
    }

    #[test]
    fn emission_kernel_needs_owner_key() {
        let g = blinding_generator();
        let (x, o) = (Scalar::from(5u64), Scalar::from(9u64));
        let emission = AssetEmission {
            asset_id: 1,
            owner: (o * g).compress(),
            value: 500,
        };
        let excess = (x * g).compress();
        let msg = kernel_message(0, 0, 10, &excess, Some(&emission));
        let mut kernel = TxKernel {
            excess,
            fee: 0,
            min_height: 0,
            max_height: 10,
            signature: Signature::sign(&(x + o), &Scalar::from(4u64), &msg),
            asset_emission: Some(emission),
        };
        assert!(kernel.verify_signature());

        kernel.signature = Signature::sign(&x, &Scalar::from(4u64), &msg);
        assert!(!kernel.verify_signature(), "excess alone must not authorize emission");
    }
}
