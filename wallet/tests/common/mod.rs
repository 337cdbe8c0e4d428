//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use umbra_wallet::config::WalletConfig;
use umbra_wallet::keykeeper::{LocalKeyKeeper, PrivateKeyKeeper, ThreadedKeyKeeper};
use umbra_wallet::loopback::Simulation;
use umbra_wallet::storage::WalletDb;
use umbra_wallet::transaction::{ParameterId, SimpleTransaction, TxFailureReason, TxId, TxStatus, WalletId};

/// Height the example scenarios start at; the first mined block is 134.
pub const START_HEIGHT: u64 = 133;

pub struct Party {
    pub index: usize,
    pub address: WalletId,
    pub db: Arc<WalletDb>,
    pub seed: u8,
}

pub fn keeper(db: &Arc<WalletDb>, seed: u8, threaded: bool) -> Arc<dyn PrivateKeyKeeper> {
    let local = Arc::new(LocalKeyKeeper::from_seed(db.clone(), &[seed; 32]).unwrap());
    if threaded {
        Arc::new(ThreadedKeyKeeper::new(local).unwrap())
    } else {
        local
    }
}

pub fn party(sim: &mut Simulation, seed: u8, funds: &[u64], threaded: bool, config: WalletConfig) -> Party {
    let db = Arc::new(WalletDb::open_temporary().unwrap());
    let index = sim
        .add_wallet(db.clone(), keeper(&db, seed, threaded), config)
        .unwrap();
    let wallet = sim.wallet(index);
    let address = wallet.create_address("main").unwrap().wallet_id;
    for amount in funds {
        wallet.add_coinbase(*amount, 1).unwrap();
    }
    Party {
        index,
        address,
        db,
        seed,
    }
}

pub fn tx<'a>(sim: &'a Simulation, party: &Party, tx_id: &TxId) -> &'a SimpleTransaction {
    sim.wallet(party.index)
        .transaction(tx_id)
        .expect("transaction is known")
}

pub fn assert_failed(sim: &Simulation, party: &Party, tx_id: &TxId, reason: TxFailureReason) {
    let tx = tx(sim, party, tx_id);
    assert_eq!(tx.status(), TxStatus::Failed);
    assert_eq!(tx.failure_reason(), Some(reason));
}

pub fn proof_height(sim: &Simulation, party: &Party, tx_id: &TxId) -> Option<u64> {
    tx(sim, party, tx_id)
        .params()
        .get(ParameterId::KERNEL_PROOF_HEIGHT)
        .unwrap()
}
