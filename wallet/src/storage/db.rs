//! # WalletDb: Persistent Storage Engine
//!
//! sled-backed implementation of [`WalletStorage`] and [`VariablesDb`].
//!
//! ## Tree Layout
//!
//! | Tree            | Key                   | Value                  |
//! |-----------------|-----------------------|------------------------|
//! | `coins`         | `bincode(CoinId)`     | `bincode(Coin)`        |
//! | `addresses`     | `WalletId` (32B)      | `bincode(WalletAddress)` |
//! | `tx_parameters` | `TxId` (16B)          | `bincode(TxParameters)` |
//! | `variables`     | name (UTF-8)          | raw bytes              |
//!
//! Key indices come from sled's monotonic id generator, which never hands
//! out the same value twice, even across restarts.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};

use super::{Coin, VariablesDb, WalletAddress, WalletStorage};
use crate::transaction::parameters::TxParameters;
use crate::transaction::types::{CoinId, TxId, WalletId};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

fn encode<T: Serialize + ?Sized>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// WalletDb
// ---------------------------------------------------------------------------

/// Persistent storage for one wallet.
///
/// sled trees are thread-safe, so a `WalletDb` can be shared through
/// `Arc<WalletDb>` between the wallet and its key keeper without extra
/// locking.
#[derive(Debug, Clone)]
pub struct WalletDb {
    db: Db,
    coins: Tree,
    addresses: Tree,
    tx_parameters: Tree,
    variables: Tree,
}

impl WalletDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory database, removed when dropped. Ideal for tests.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            coins: db.open_tree("coins")?,
            addresses: db.open_tree("addresses")?,
            tx_parameters: db.open_tree("tx_parameters")?,
            variables: db.open_tree("variables")?,
            db,
        })
    }

    /// Block until every write so far is durable.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn scan<T: DeserializeOwned>(tree: &Tree) -> DbResult<Vec<T>> {
        tree.iter()
            .map(|entry| {
                let (_, value) = entry?;
                decode(&value)
            })
            .collect()
    }
}

impl VariablesDb for WalletDb {
    fn set_var(&self, name: &str, value: &[u8]) -> DbResult<()> {
        self.variables.insert(name.as_bytes(), value)?;
        self.variables.flush()?;
        Ok(())
    }

    fn get_var(&self, name: &str) -> DbResult<Option<Vec<u8>>> {
        Ok(self.variables.get(name.as_bytes())?.map(|v| v.to_vec()))
    }
}

impl WalletStorage for WalletDb {
    fn allocate_key_index(&self) -> DbResult<u64> {
        // Index 0 stays unused so a zeroed CoinId never collides with a real one.
        Ok(self.db.generate_id()? + 1)
    }

    fn save_coin(&self, coin: &Coin) -> DbResult<()> {
        self.coins.insert(encode(&coin.id)?, encode(coin)?)?;
        Ok(())
    }

    fn find_coin(&self, id: &CoinId) -> DbResult<Option<Coin>> {
        match self.coins.get(encode(id)?)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_coin(&self, id: &CoinId) -> DbResult<()> {
        self.coins.remove(encode(id)?)?;
        Ok(())
    }

    fn coins(&self) -> DbResult<Vec<Coin>> {
        Self::scan(&self.coins)
    }

    fn save_address(&self, address: &WalletAddress) -> DbResult<()> {
        self.addresses.insert(address.wallet_id.0, encode(address)?)?;
        Ok(())
    }

    fn find_address(&self, id: &WalletId) -> DbResult<Option<WalletAddress>> {
        match self.addresses.get(id.0)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn addresses(&self) -> DbResult<Vec<WalletAddress>> {
        Self::scan(&self.addresses)
    }

    fn save_tx_parameters(&self, tx_id: &TxId, params: &TxParameters) -> DbResult<()> {
        self.tx_parameters.insert(tx_id.0, encode(params)?)?;
        Ok(())
    }

    fn load_tx_parameters(&self, tx_id: &TxId) -> DbResult<Option<TxParameters>> {
        match self.tx_parameters.get(tx_id.0)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn tx_ids(&self) -> DbResult<Vec<TxId>> {
        self.tx_parameters
            .iter()
            .keys()
            .map(|key| {
                let key = key?;
                let arr: [u8; 16] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| DbError::Serialization("malformed transaction key".into()))?;
                Ok(TxId(arr))
            })
            .collect()
    }

    fn delete_tx(&self, tx_id: &TxId) -> DbResult<()> {
        self.tx_parameters.remove(tx_id.0)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
