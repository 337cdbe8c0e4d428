//! # Wallet Configuration & Constants
//!
//! Every magic number in the wallet core lives here. If you're hardcoding a
//! height or a fee somewhere else, move it here first.
//!
//! Protocol constants are shared by both negotiating peers and must not
//! drift between wallet versions. Per-wallet tunables live in
//! [`WalletConfig`].

use crate::transaction::types::{Amount, Height};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Negotiation protocol version advertised through `PeerProtoVersion`.
///
/// A peer that omits the parameter is treated as a legacy peer: the receiver
/// then waits for an explicit `TransactionRegistered` notification instead of
/// assuming the sender registered the transaction.
pub const TX_PROTOCOL_VERSION: u32 = 2;

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. 96 bits, always.
pub const AES_NONCE_LENGTH: usize = 12;

/// Length of the master seed every key in the wallet is derived from.
pub const SEED_LENGTH: usize = 32;

/// Hash output length in bytes. BLAKE3 and SHA-256 both produce 32 bytes.
pub const HASH_OUTPUT_LENGTH: usize = 32;

/// Range proofs cover the full `u64` value space.
pub const RANGEPROOF_BITS: usize = 64;

/// Height from which outputs must carry the asset-bound (v2) range proof
/// transcript. Older outputs are rejected by validation past this height.
pub const RANGEPROOF_V2_HEIGHT: Height = 100;

/// Child KDF selectors must fit in 24 bits. Anything above is an unknown
/// derivation path.
pub const MAX_SUBKEY_INDEX: u32 = 1 << 24;

// ---------------------------------------------------------------------------
// Nonce Pool
// ---------------------------------------------------------------------------

/// Number of ring positions in the persisted nonce pool.
///
/// Slot ids keep growing forever; a slot whose ring position has been
/// re-allocated becomes unavailable. 256 concurrent negotiations per wallet is
/// far beyond what a person keeps in flight.
pub const NONCE_POOL_SIZE: usize = 256;

// ---------------------------------------------------------------------------
// Heights & Fees
// ---------------------------------------------------------------------------

/// Default kernel lifetime in blocks, counted from the min height.
pub const DEFAULT_TX_LIFETIME: Height = 120;

/// Default number of blocks the sender waits for the receiver's answer.
pub const DEFAULT_TX_RESPONSE_TIME: Height = 720;

/// Largest acceptable distance between a kernel's min and max height.
pub const MAX_TX_LIFETIME: Height = 1440;

/// Minimum fee accepted when creating a transaction.
pub const MIN_TX_FEE: Amount = 100;

// ---------------------------------------------------------------------------
// Per-wallet configuration
// ---------------------------------------------------------------------------

/// Tunables for one wallet instance.
///
/// The defaults match the protocol constants above; tests shrink the
/// lifetimes to exercise expiry without mining hundreds of blocks.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Kernel lifetime applied when a transaction does not carry `Lifetime`.
    pub default_lifetime: Height,

    /// Blocks the sender waits for the receiver before expiring.
    pub response_time: Height,

    /// Largest acceptable kernel height window.
    pub max_lifetime: Height,

    /// Lowest fee this wallet will create a transaction with.
    pub min_fee: Amount,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            default_lifetime: DEFAULT_TX_LIFETIME,
            response_time: DEFAULT_TX_RESPONSE_TIME,
            max_lifetime: MAX_TX_LIFETIME,
            min_fee: MIN_TX_FEE,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lifetime_fits_in_max_window() {
        assert!(DEFAULT_TX_LIFETIME <= MAX_TX_LIFETIME);
    }

    #[test]
    fn wallet_config_defaults_match_constants() {
        let config = WalletConfig::default();
        assert_eq!(config.default_lifetime, DEFAULT_TX_LIFETIME);
        assert_eq!(config.response_time, DEFAULT_TX_RESPONSE_TIME);
        assert_eq!(config.max_lifetime, MAX_TX_LIFETIME);
        assert_eq!(config.min_fee, MIN_TX_FEE);
    }

    #[test]
    fn subkey_limit_is_24_bits() {
        assert_eq!(MAX_SUBKEY_INDEX, 0x0100_0000);
    }
}
