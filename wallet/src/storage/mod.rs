//! # Storage Module
//!
//! Persistent wallet state: coins, addresses, parameter bags, and named
//! variables (the sealed seed, the nonce pool).
//!
//! ## Architecture
//!
//! ```text
//! mod.rs           storage traits and the records they hold
//! db.rs            sled implementation (WalletDb)
//! ```
//!
//! The negotiation code and the key keeper depend on the traits only. The
//! key keeper sees nothing but [`VariablesDb`]; it has no business reading
//! coins or addresses.
//!
//! ## Design Decisions
//!
//! 1. **Bincode on disk.** Compact, fast, deterministic.
//! 2. **One sled tree per record kind.** Independent keyspaces, cheap scans.
//! 3. **No caching layer.** sled already caches hot pages, and the wallet is
//!    single-writer.

pub mod db;

use serde::{Deserialize, Serialize};

use crate::transaction::parameters::TxParameters;
use crate::transaction::types::{Amount, AssetId, CoinId, Height, TxId, WalletId};

pub use db::{DbError, DbResult, WalletDb};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoinStatus {
    /// Confirmed and spendable.
    Available,
    /// Selected as an input by an unfinished transaction.
    Outgoing,
    /// Created by an unfinished transaction, not yet on chain.
    Incoming,
    Spent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub id: CoinId,
    pub status: CoinStatus,
    pub create_tx_id: Option<TxId>,
    pub spent_tx_id: Option<TxId>,
    pub confirm_height: Option<Height>,
    pub spent_height: Option<Height>,
}

impl Coin {
    pub fn new(id: CoinId, status: CoinStatus) -> Self {
        Self {
            id,
            status,
            create_tx_id: None,
            spent_tx_id: None,
            confirm_height: None,
            spent_height: None,
        }
    }

    pub fn amount(&self) -> Amount {
        self.id.amount
    }
}

/// An address book entry. Own addresses carry the index of their
/// secure-messaging key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAddress {
    pub wallet_id: WalletId,
    pub label: String,
    pub own_id: Option<u64>,
    /// Unix seconds.
    pub create_time: i64,
    /// Lifetime in seconds; zero never expires.
    pub duration: u64,
}

impl WalletAddress {
    /// Entry for somebody else's address.
    pub fn peer(wallet_id: WalletId) -> Self {
        Self {
            wallet_id,
            label: String::new(),
            own_id: None,
            create_time: chrono::Utc::now().timestamp(),
            duration: 0,
        }
    }

    pub fn is_own(&self) -> bool {
        self.own_id.is_some()
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.duration != 0 && now > self.create_time.saturating_add(self.duration as i64)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp())
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Named opaque blobs. The key keeper persists its nonce pool here.
pub trait VariablesDb: Send + Sync {
    fn set_var(&self, name: &str, value: &[u8]) -> DbResult<()>;
    fn get_var(&self, name: &str) -> DbResult<Option<Vec<u8>>>;
}

/// Everything the negotiation engine reads and writes.
pub trait WalletStorage: Send + Sync {
    /// Fresh, never-repeating index for coin and address keys.
    fn allocate_key_index(&self) -> DbResult<u64>;

    fn save_coin(&self, coin: &Coin) -> DbResult<()>;
    fn find_coin(&self, id: &CoinId) -> DbResult<Option<Coin>>;
    fn delete_coin(&self, id: &CoinId) -> DbResult<()>;
    fn coins(&self) -> DbResult<Vec<Coin>>;

    fn available_coins(&self, asset_id: AssetId) -> DbResult<Vec<Coin>> {
        Ok(self
            .coins()?
            .into_iter()
            .filter(|c| c.status == CoinStatus::Available && c.id.asset_id == asset_id)
            .collect())
    }

    fn save_address(&self, address: &WalletAddress) -> DbResult<()>;
    fn find_address(&self, id: &WalletId) -> DbResult<Option<WalletAddress>>;
    fn addresses(&self) -> DbResult<Vec<WalletAddress>>;

    fn save_tx_parameters(&self, tx_id: &TxId, params: &TxParameters) -> DbResult<()>;
    fn load_tx_parameters(&self, tx_id: &TxId) -> DbResult<Option<TxParameters>>;
    fn tx_ids(&self) -> DbResult<Vec<TxId>>;
    fn delete_tx(&self, tx_id: &TxId) -> DbResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KeyType;

    #[test]
    fn address_expiry() {
        let mut addr = WalletAddress::peer(WalletId([1u8; 32]));
        addr.create_time = 1_000;
        assert!(!addr.is_expired_at(i64::MAX), "zero duration never expires");
        addr.duration = 60;
        assert!(!addr.is_expired_at(1_060));
        assert!(addr.is_expired_at(1_061));
    }

    #[test]
    fn new_coin_has_no_history() {
        let coin = Coin::new(CoinId::new(1, KeyType::Regular, 500), CoinStatus::Available);
        assert_eq!(coin.amount(), 500);
        assert!(coin.create_tx_id.is_none() && coin.spent_tx_id.is_none());
    }
}
