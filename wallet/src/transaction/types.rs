//! Core type definitions for wallet transactions.
//!
//! These types form the vocabulary of the negotiation: identifiers, coin
//! descriptors, statuses and failure reasons. They are small, `Copy` where
//! possible, and all serializable so they can travel inside a parameter bag.

use std::fmt;
use std::str::FromStr;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use serde::{Deserialize, Serialize};

use crate::crypto::keys::{KeyId, KeyType};

/// Block height.
pub type Height = u64;

/// Value in the smallest unit of an asset.
pub type Amount = u64;

/// Asset identifier; `0` is the native coin.
pub type AssetId = u32;

pub const NATIVE_ASSET: AssetId = 0;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// 16-byte transaction id, random per negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub [u8; 16]);

impl TxId {
    pub fn generate() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A wallet address: the public key of a secure-messaging key.
///
/// Displayed in base58, like every other user-facing identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalletId(pub [u8; 32]);

impl From<RistrettoPoint> for WalletId {
    fn from(point: RistrettoPoint) -> Self {
        Self(point.compress().to_bytes())
    }
}

impl WalletId {
    pub fn public_key(&self) -> CompressedRistretto {
        CompressedRistretto(self.0)
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WalletId({self})")
    }
}

impl FromStr for WalletId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| format!("invalid base58: {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "wallet id must be 32 bytes".to_string())?;
        Ok(Self(arr))
    }
}

/// Kernel identifier: the hash of the kernel message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelId(pub [u8; 32]);

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KernelId({})", hex::encode(&self.0[..8]))
    }
}

// ---------------------------------------------------------------------------
// CoinId
// ---------------------------------------------------------------------------

/// Identifies one output. The same `CoinId` always yields the same blinding
/// factor, so it doubles as the coin's derivation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoinId {
    pub idx: u64,
    pub key_type: KeyType,
    pub sub_idx: u32,
    pub amount: Amount,
    pub asset_id: AssetId,
}

impl CoinId {
    pub fn new(idx: u64, key_type: KeyType, amount: Amount) -> Self {
        Self {
            idx,
            key_type,
            sub_idx: 0,
            amount,
            asset_id: NATIVE_ASSET,
        }
    }

    pub fn with_asset(mut self, asset_id: AssetId) -> Self {
        self.asset_id = asset_id;
        self
    }

    pub fn key_id(&self) -> KeyId {
        KeyId {
            idx: self.idx,
            key_type: self.key_type,
            sub_idx: self.sub_idx,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction type / status / state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxType {
    /// Two-party (or self) payment.
    Simple,
}

/// User-facing lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    InProgress,
    Registering,
    Completed,
    Failed,
    Cancelled,
}

impl TxStatus {
    /// Terminal statuses ignore every further trigger.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Completed | TxStatus::Failed | TxStatus::Cancelled)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in progress",
            Self::Registering => "registering",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Persisted negotiation step. Failure is never a state; see [`TxStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegotiationState {
    Initial,
    Invitation,
    InvitationConfirmation,
    Registration,
    KernelConfirmation,
    Completed,
}

/// Verdict of the chain gateway on a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Ok,
    /// Not valid in the current chain context. Usually the kernel is already
    /// known to the chain.
    InvalidContext,
    InvalidTransaction,
    LowFee,
    Conflicting,
}

// ---------------------------------------------------------------------------
// TxFailureReason
// ---------------------------------------------------------------------------

/// Typed, human-inspectable reason attached to every failed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxFailureReason {
    Unknown,
    Cancelled,
    InvalidPeerSignature,
    FailedToRegister,
    InvalidTransaction,
    InvalidKernelProof,
    FailedToSendParameters,
    NoInputs,
    TransactionExpired,
    MaxHeightIsUnacceptable,
    InvalidPeerData,
    InvalidParameters,
    FeeIsTooSmall,
    AddressExpired,
    KeyKeeperError,
    NonceUnavailable,
    InvalidState,
}

impl fmt::Display for TxFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unexpected reason, please send wallet logs",
            Self::Cancelled => "transaction was cancelled",
            Self::InvalidPeerSignature => "peer's signature is not valid",
            Self::FailedToRegister => "failed to register transaction with the chain",
            Self::InvalidTransaction => "assembled transaction is not valid",
            Self::InvalidKernelProof => "invalid kernel proof provided",
            Self::FailedToSendParameters => "failed to send transaction parameters",
            Self::NoInputs => "not enough inputs to cover amount and fee",
            Self::TransactionExpired => "kernel max height expired",
            Self::MaxHeightIsUnacceptable => "kernel height window is unacceptable",
            Self::InvalidPeerData => "peer sent malformed or contradicting data",
            Self::InvalidParameters => "transaction parameters are invalid",
            Self::FeeIsTooSmall => "fee is below the minimum",
            Self::AddressExpired => "address has expired",
            Self::KeyKeeperError => "key keeper failed to serve the request",
            Self::NonceUnavailable => "signing nonce is no longer available",
            Self::InvalidState => "transaction is in an invalid state",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
