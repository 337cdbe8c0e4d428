//! # Wallet
//!
//! Owns every negotiation of one wallet and routes triggers to them: user
//! requests, inbound peer bags, chain events and key-keeper replies. All
//! methods take `&mut self`; the wallet is driven from one context.
//!
//! Keeper replies come back through an internal queue. Call
//! [`Wallet::process_events`] after anything that may have completed a
//! keeper request (with a threaded keeper that is "regularly").

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::config::WalletConfig;
use crate::crypto::keys::{KeyId, KeyType};
use crate::crypto::schnorr::Signature;
use crate::gateway::{ChainEvent, ChainGateway, PeerChannel};
use crate::keykeeper::{KeeperError, KeeperResult, KeyKeeperExt, PrivateKeyKeeper, Reply};
use crate::storage::{Coin, CoinStatus, DbError, WalletAddress, WalletStorage};
use crate::transaction::builder::{KeeperCall, TxContext};
use crate::transaction::parameters::{ParameterError, ParameterId, SetTxParameter, TxParameters};
use crate::transaction::payment::PaymentProof;
use crate::transaction::simple::SimpleTransaction;
use crate::transaction::types::{
    Amount, AssetId, CoinId, Height, KernelId, NegotiationState, TxFailureReason, TxId, TxStatus, TxType, WalletId,
    NATIVE_ASSET,
};

// ---------------------------------------------------------------------------
// Events & errors
// ---------------------------------------------------------------------------

/// Work queued for the wallet by its collaborators.
#[derive(Debug)]
pub enum WalletEvent {
    KeeperReply {
        tx_id: TxId,
        call: KeeperCall,
        result: KeeperResult<Reply>,
    },
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("storage error: {0}")]
    Storage(#[from] DbError),

    #[error("key keeper error: {0}")]
    Keeper(#[from] KeeperError),

    #[error("parameter error: {0}")]
    Parameter(#[from] ParameterError),

    #[error("transaction rejected: {0}")]
    Rejected(TxFailureReason),

    #[error("unknown transaction {0}")]
    UnknownTransaction(TxId),

    #[error("transaction {0} can no longer be cancelled")]
    CannotCancel(TxId),

    #[error("address {0} does not belong to this wallet")]
    NotOwnAddress(WalletId),

    #[error("transaction {0} carries no payment confirmation")]
    NoPaymentProof(TxId),

    #[error("{peer} is not a party to transaction {tx_id}")]
    ForeignPeer { tx_id: TxId, peer: WalletId },
}

pub type WalletResult<T> = Result<T, WalletError>;

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

pub struct Wallet {
    ctx: TxContext,
    events: UnboundedReceiver<WalletEvent>,
    transactions: BTreeMap<TxId, SimpleTransaction>,
}

impl Wallet {
    /// Wire a wallet to its collaborators and resume every unfinished
    /// negotiation found in storage.
    pub fn new(
        storage: Arc<dyn WalletStorage>,
        keeper: Arc<dyn PrivateKeyKeeper>,
        gateway: Arc<dyn ChainGateway>,
        peers: Arc<dyn PeerChannel>,
        config: WalletConfig,
    ) -> WalletResult<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut wallet = Self {
            ctx: TxContext {
                storage,
                keeper,
                gateway,
                peers,
                events: tx,
                config,
            },
            events,
            transactions: BTreeMap::new(),
        };

        let mut resumed = 0usize;
        for tx_id in wallet.ctx.storage.tx_ids()? {
            let Some(params) = wallet.ctx.storage.load_tx_parameters(&tx_id)? else {
                continue;
            };
            let mut tx = SimpleTransaction::new(tx_id, params);
            if !tx.is_terminal() {
                tx.resume(&wallet.ctx);
                resumed += 1;
            }
            wallet.transactions.insert(tx_id, tx);
        }
        if resumed > 0 {
            info!(resumed, "resumed unfinished transactions");
        }
        Ok(wallet)
    }

    pub fn config(&self) -> &WalletConfig {
        &self.ctx.config
    }

    pub fn storage(&self) -> &Arc<dyn WalletStorage> {
        &self.ctx.storage
    }

    // -----------------------------------------------------------------------
    // Addresses & coins
    // -----------------------------------------------------------------------

    /// New own address backed by a fresh secure-messaging key.
    pub fn create_address(&self, label: &str) -> WalletResult<WalletAddress> {
        let idx = self.ctx.storage.allocate_key_index()?;
        let sbbs = self.ctx.keeper.sbbs_kdf()?;
        let public = sbbs
            .derive_public(&KeyId::new(idx, KeyType::Bbs))
            .map_err(KeeperError::from)?;
        let address = WalletAddress {
            wallet_id: WalletId::from(public),
            label: label.to_string(),
            own_id: Some(idx),
            create_time: chrono::Utc::now().timestamp(),
            duration: 0,
        };
        self.ctx.storage.save_address(&address)?;
        info!(address = %address.wallet_id, label, "address created");
        Ok(address)
    }

    pub fn coins(&self) -> WalletResult<Vec<Coin>> {
        Ok(self.ctx.storage.coins()?)
    }

    /// Sum of spendable coins of one asset.
    pub fn available(&self, asset_id: AssetId) -> WalletResult<Amount> {
        Ok(self
            .ctx
            .storage
            .available_coins(asset_id)?
            .iter()
            .map(Coin::amount)
            .sum())
    }

    /// Record a coin mined to this wallet. Its blinding factor comes from
    /// the key keeper like any other coin's.
    pub fn add_coinbase(&self, amount: Amount, height: Height) -> WalletResult<CoinId> {
        let idx = self.ctx.storage.allocate_key_index()?;
        let id = CoinId::new(idx, KeyType::Coinbase, amount);
        let mut coin = Coin::new(id, CoinStatus::Available);
        coin.confirm_height = Some(height);
        self.ctx.storage.save_coin(&coin)?;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Starting transactions
    // -----------------------------------------------------------------------

    /// Pay `amount` from own address `from` to `to`.
    pub fn send(&mut self, from: WalletId, to: WalletId, amount: Amount, fee: Amount) -> WalletResult<TxId> {
        let mut params = TxParameters::new();
        params.set(ParameterId::MY_ID, &from)?;
        params.set(ParameterId::PEER_ID, &to)?;
        params.set(ParameterId::AMOUNT, &amount)?;
        params.set(ParameterId::FEE, &fee)?;
        params.set(ParameterId::IS_SENDER, &true)?;
        self.start_transaction(params)
    }

    /// Re-split own coins into one output per entry of `amounts`.
    pub fn split(&mut self, from: WalletId, amounts: Vec<Amount>, fee: Amount) -> WalletResult<TxId> {
        let total = amounts
            .iter()
            .try_fold(0u64, |acc, a| acc.checked_add(*a))
            .ok_or(WalletError::Rejected(TxFailureReason::InvalidParameters))?;
        let mut params = TxParameters::new();
        params.set(ParameterId::MY_ID, &from)?;
        params.set(ParameterId::PEER_ID, &from)?;
        params.set(ParameterId::AMOUNT, &total)?;
        params.set(ParameterId::AMOUNT_LIST, &amounts)?;
        params.set(ParameterId::FEE, &fee)?;
        params.set(ParameterId::IS_SENDER, &true)?;
        self.start_transaction(params)
    }

    /// Start a negotiation from a caller-supplied bag. `MyID`, `PeerID`,
    /// `Amount` and `Fee` are required; everything else gets a default.
    pub fn start_transaction(&mut self, mut params: TxParameters) -> WalletResult<TxId> {
        self.check_and_complete(&mut params)?;

        let fee: Amount = params.require(ParameterId::FEE)?;
        if fee < self.ctx.config.min_fee {
            return Err(WalletError::Rejected(TxFailureReason::FeeIsTooSmall));
        }
        let amount: Amount = params.require(ParameterId::AMOUNT)?;
        if amount.checked_add(fee).is_none() {
            warn!(amount, fee, "amount plus fee overflows");
            return Err(WalletError::Rejected(TxFailureReason::InvalidParameters));
        }

        let tip = self.ctx.gateway.tip_height();
        if !params.contains(ParameterId::MIN_HEIGHT) {
            params.set(ParameterId::MIN_HEIGHT, &tip)?;
        }
        if !params.contains(ParameterId::LIFETIME) {
            params.set(ParameterId::LIFETIME, &self.ctx.config.default_lifetime)?;
        }
        let is_self: bool = params.get(ParameterId::IS_SELF_TX)?.unwrap_or(false);
        if !is_self && !params.contains(ParameterId::PEER_RESPONSE_HEIGHT) {
            params.set(
                ParameterId::PEER_RESPONSE_HEIGHT,
                &(tip + self.ctx.config.response_time),
            )?;
        }
        if !params.contains(ParameterId::IS_SENDER) {
            params.set(ParameterId::IS_SENDER, &true)?;
        }
        params.set(ParameterId::TRANSACTION_TYPE, &TxType::Simple)?;
        params.set(ParameterId::IS_INITIATOR, &true)?;
        params.set(ParameterId::CREATE_TIME, &chrono::Utc::now().timestamp())?;
        params.set(ParameterId::STATUS, &TxStatus::Pending)?;
        params.set(ParameterId::STATE, &NegotiationState::Initial)?;

        let tx_id = TxId::generate();
        info!(%tx_id, is_self, fee, "transaction created");
        let mut tx = SimpleTransaction::new(tx_id, params);
        tx.update(&self.ctx);
        self.transactions.insert(tx_id, tx);
        Ok(tx_id)
    }

    fn check_and_complete(&self, params: &mut TxParameters) -> WalletResult<()> {
        let my_id: WalletId = params.require(ParameterId::MY_ID)?;
        let peer_id: WalletId = params.require(ParameterId::PEER_ID)?;

        match self.ctx.storage.find_address(&my_id)? {
            Some(address) if address.is_own() => {}
            _ => return Err(WalletError::NotOwnAddress(my_id)),
        }

        let message: Option<String> = params.get(ParameterId::MESSAGE)?;
        let is_self = match self.ctx.storage.find_address(&peer_id)? {
            Some(address) if address.is_own() => {
                if address.is_expired() {
                    return Err(WalletError::Rejected(TxFailureReason::AddressExpired));
                }
                true
            }
            Some(mut address) => {
                if let Some(label) = message.filter(|m| !m.is_empty()) {
                    address.label = label;
                    self.ctx.storage.save_address(&address)?;
                }
                false
            }
            None => {
                let mut address = WalletAddress::peer(peer_id);
                address.label = message.unwrap_or_default();
                self.ctx.storage.save_address(&address)?;
                debug!(peer = %peer_id, "peer address saved");
                false
            }
        };
        params.set(ParameterId::IS_SELF_TX, &is_self)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound triggers
    // -----------------------------------------------------------------------

    /// A bag arrived for own address `to`.
    pub fn on_tx_parameters(&mut self, to: &WalletId, msg: SetTxParameter) -> WalletResult<()> {
        if let Some(tx) = self.transactions.get_mut(&msg.tx_id) {
            let peer_id: Option<WalletId> = tx.params().get(ParameterId::PEER_ID)?;
            let my_id: Option<WalletId> = tx.params().get(ParameterId::MY_ID)?;
            if peer_id != Some(msg.from) || my_id != Some(*to) {
                warn!(tx_id = %msg.tx_id, from = %msg.from, %to, "bag from outside the negotiation dropped");
                return Err(WalletError::ForeignPeer {
                    tx_id: msg.tx_id,
                    peer: msg.from,
                });
            }
            tx.on_peer_params(&self.ctx, &msg.params);
            return Ok(());
        }

        if !msg.params.contains(ParameterId::TRANSACTION_TYPE) {
            debug!(tx_id = %msg.tx_id, "bag for an unknown transaction");
            return Err(WalletError::UnknownTransaction(msg.tx_id));
        }
        if msg.params.get::<bool>(ParameterId::IS_SENDER)? != Some(false) {
            warn!(tx_id = %msg.tx_id, "invitation asks us to send");
            return Err(WalletError::Rejected(TxFailureReason::InvalidPeerData));
        }
        let address = match self.ctx.storage.find_address(to)? {
            Some(address) if address.is_own() => address,
            _ => return Err(WalletError::NotOwnAddress(*to)),
        };
        if address.is_expired() {
            warn!(tx_id = %msg.tx_id, address = %to, "invitation to an expired address");
            return Err(WalletError::Rejected(TxFailureReason::AddressExpired));
        }
        if self.ctx.storage.find_address(&msg.from)?.is_none() {
            self.ctx.storage.save_address(&WalletAddress::peer(msg.from))?;
        }

        let mut params = TxParameters::new();
        for (sub_tx, id, bytes) in msg.params.iter() {
            if !id.is_private() {
                params.set_raw(id, sub_tx, bytes.to_vec())?;
            }
        }
        params.set(ParameterId::MY_ID, to)?;
        params.set(ParameterId::PEER_ID, &msg.from)?;
        params.set(ParameterId::IS_INITIATOR, &false)?;
        params.set(ParameterId::IS_SELF_TX, &false)?;
        params.set(ParameterId::CREATE_TIME, &chrono::Utc::now().timestamp())?;
        params.set(ParameterId::STATUS, &TxStatus::Pending)?;
        params.set(ParameterId::STATE, &NegotiationState::Initial)?;

        info!(tx_id = %msg.tx_id, from = %msg.from, "invitation received");
        let mut tx = SimpleTransaction::new(msg.tx_id, params);
        tx.update(&self.ctx);
        self.transactions.insert(msg.tx_id, tx);
        Ok(())
    }

    pub fn on_chain_event(&mut self, event: ChainEvent) {
        match event.tx_id() {
            Some(tx_id) => match self.transactions.get_mut(&tx_id) {
                Some(tx) => tx.on_chain_event(&self.ctx, &event),
                None => debug!(%tx_id, "chain event for an unknown transaction"),
            },
            None => {
                for tx in self.transactions.values_mut().filter(|tx| !tx.is_terminal()) {
                    tx.on_chain_event(&self.ctx, &event);
                }
            }
        }
    }

    /// Run finished keeper handlers and feed their replies to the
    /// negotiations. Returns the number of replies processed.
    pub fn process_events(&mut self) -> usize {
        let mut processed = 0;
        loop {
            self.ctx.keeper.dispatch_completions();
            let Ok(event) = self.events.try_recv() else {
                break;
            };
            match event {
                WalletEvent::KeeperReply { tx_id, call, result } => match self.transactions.get_mut(&tx_id) {
                    Some(tx) => tx.on_keeper_reply(&self.ctx, call, result),
                    None => debug!(%tx_id, call = call.name(), "keeper reply for an unknown transaction"),
                },
            }
            processed += 1;
        }
        processed
    }

    /// Block up to `timeout` for keeper completions, then process them.
    pub fn wait_keeper(&mut self, timeout: Duration) -> usize {
        if self.ctx.keeper.outstanding() > 0 {
            self.ctx.keeper.wait_completions(timeout);
        }
        self.process_events()
    }

    pub fn is_awaiting_keeper(&self) -> bool {
        self.transactions.values().any(SimpleTransaction::is_awaiting_keeper)
    }

    // -----------------------------------------------------------------------
    // Queries & control
    // -----------------------------------------------------------------------

    pub fn cancel_tx(&mut self, tx_id: TxId) -> WalletResult<()> {
        let tx = self
            .transactions
            .get_mut(&tx_id)
            .ok_or(WalletError::UnknownTransaction(tx_id))?;
        if tx.cancel(&self.ctx) {
            info!(%tx_id, "transaction cancelled");
            Ok(())
        } else {
            Err(WalletError::CannotCancel(tx_id))
        }
    }

    pub fn transaction(&self, tx_id: &TxId) -> Option<&SimpleTransaction> {
        self.transactions.get(tx_id)
    }

    pub fn transactions(&self) -> impl Iterator<Item = &SimpleTransaction> + '_ {
        self.transactions.values()
    }

    /// Receiver-signed proof that the payment of `tx_id` went through.
    pub fn payment_proof(&self, tx_id: &TxId) -> WalletResult<PaymentProof> {
        let tx = self
            .transactions
            .get(tx_id)
            .ok_or(WalletError::UnknownTransaction(*tx_id))?;
        let params = tx.params();
        let signature: Signature = params
            .get(ParameterId::PAYMENT_CONFIRMATION)?
            .ok_or(WalletError::NoPaymentProof(*tx_id))?;
        let kernel_id: KernelId = params.require(ParameterId::KERNEL_ID)?;
        let my_id: WalletId = params.require(ParameterId::MY_ID)?;
        let peer_id: WalletId = params.require(ParameterId::PEER_ID)?;
        let is_sender: bool = params.require(ParameterId::IS_SENDER)?;
        let (sender, receiver) = if is_sender { (my_id, peer_id) } else { (peer_id, my_id) };
        Ok(PaymentProof {
            sender,
            receiver,
            amount: params.require(ParameterId::AMOUNT)?,
            asset_id: params.get(ParameterId::ASSET_ID)?.unwrap_or(NATIVE_ASSET),
            kernel_id,
            signature,
        })
    }
}
