//! Turns parameter-bag state into cryptographic artifacts and back.
//!
//! A [`TxBuilder`] is short-lived: the negotiation creates one per re-entry,
//! borrowing the transaction's bag. Every step is idempotent. A step whose
//! result is already in the bag does nothing; a step that needs the key
//! keeper fires an async call and reports `Ok(true)` ("pending"). The reply
//! comes back through the wallet's event queue, lands in the bag via
//! [`TxBuilder::apply_reply`], and the negotiation re-enters.
//!
//! Nothing here decides *when* a step runs. That is the state machine's job
//! (see [`super::simple`]).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::error::TxError;
use super::kernel::{kernel_message, KernelParameters, TxKernel};
use super::parameters::{ParameterId, SetTxParameter, TxParameters};
use super::tx::{Input, Output, Transaction};
use super::types::{
    Amount, AssetId, CoinId, Height, KernelId, NegotiationState, TxFailureReason, TxId, TxStatus, TxType,
    WalletId, NATIVE_ASSET,
};
use crate::config::{WalletConfig, TX_PROTOCOL_VERSION};
use crate::crypto::keys::KeyType;
use crate::crypto::schnorr::{challenge, verify_partial, Signature};
use crate::gateway::{ChainGateway, PeerChannel};
use crate::keykeeper::{KeeperError, KeeperResult, Method, PrivateKeyKeeper, Reply};
use crate::storage::{Coin, CoinStatus, WalletStorage};
use crate::wallet::WalletEvent;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a negotiation touches besides its own bag. Owned by the
/// wallet, shared by all of its transactions.
pub struct TxContext {
    pub storage: Arc<dyn WalletStorage>,
    pub keeper: Arc<dyn PrivateKeyKeeper>,
    pub gateway: Arc<dyn ChainGateway>,
    pub peers: Arc<dyn PeerChannel>,
    pub events: UnboundedSender<WalletEvent>,
    pub config: WalletConfig,
}

/// Identifies an in-flight keeper request of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeeperCall {
    AllocateNonce,
    InputKeys,
    Outputs,
    SenderInitial,
    SenderFinal,
    Receiver,
    Split,
}

impl KeeperCall {
    pub fn name(self) -> &'static str {
        match self {
            KeeperCall::AllocateNonce => "AllocateNonce",
            KeeperCall::InputKeys => "InputKeys",
            KeeperCall::Outputs => "Outputs",
            KeeperCall::SenderInitial => "SenderInitial",
            KeeperCall::SenderFinal => "SenderFinal",
            KeeperCall::Receiver => "Receiver",
            KeeperCall::Split => "Split",
        }
    }
}

// ---------------------------------------------------------------------------
// Coin selection
// ---------------------------------------------------------------------------

/// Pick coins worth at least `target`.
///
/// The smallest single coin that covers the target wins. Failing that,
/// coins are taken largest first until the target is reached. Ties are
/// broken by coin id, so the same candidate set always yields the same
/// selection. `None` when even all candidates together fall short.
pub fn select_coins(candidates: &[Coin], target: Amount) -> Option<Vec<Coin>> {
    if target == 0 {
        return Some(Vec::new());
    }
    let mut sorted: Vec<&Coin> = candidates.iter().collect();
    sorted.sort_by(|a, b| a.amount().cmp(&b.amount()).then_with(|| a.id.cmp(&b.id)));

    if let Some(single) = sorted.iter().find(|c| c.amount() >= target) {
        return Some(vec![(*single).clone()]);
    }

    let mut selected = Vec::new();
    let mut total: Amount = 0;
    for coin in sorted.into_iter().rev() {
        selected.push(coin.clone());
        total = total.saturating_add(coin.amount());
        if total >= target {
            return Some(selected);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// TxBuilder
// ---------------------------------------------------------------------------

pub struct TxBuilder<'a> {
    tx_id: TxId,
    params: &'a mut TxParameters,
    pending: &'a mut HashSet<KeeperCall>,
    ctx: &'a TxContext,
    amounts: Vec<Amount>,
    amount: Amount,
    fee: Amount,
    asset_id: AssetId,
}

impl<'a> TxBuilder<'a> {
    pub fn new(
        tx_id: TxId,
        params: &'a mut TxParameters,
        pending: &'a mut HashSet<KeeperCall>,
        ctx: &'a TxContext,
    ) -> Result<Self, TxError> {
        let fee = params.require(ParameterId::FEE)?;
        let amounts = match params.get::<Vec<Amount>>(ParameterId::AMOUNT_LIST)? {
            Some(list) => list,
            None => vec![params.require(ParameterId::AMOUNT)?],
        };
        let amount = amounts
            .iter()
            .try_fold(0u64, |acc, a| acc.checked_add(*a))
            .ok_or(TxError::Failed(TxFailureReason::InvalidParameters))?;
        let asset_id = params.get(ParameterId::ASSET_ID)?.unwrap_or(NATIVE_ASSET);
        Ok(Self {
            tx_id,
            params,
            pending,
            ctx,
            amounts,
            amount,
            fee,
            asset_id,
        })
    }

    // -- bag access ----------------------------------------------------------

    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn fee(&self) -> Amount {
        self.fee
    }

    pub fn asset_id(&self) -> AssetId {
        self.asset_id
    }

    pub fn get<T: DeserializeOwned>(&self, id: ParameterId) -> Result<Option<T>, TxError> {
        Ok(self.params.get(id)?)
    }

    pub fn require<T: DeserializeOwned>(&self, id: ParameterId) -> Result<T, TxError> {
        Ok(self.params.require(id)?)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, id: ParameterId, value: &T) -> Result<(), TxError> {
        Ok(self.params.set(id, value)?)
    }

    pub fn has(&self, id: ParameterId) -> bool {
        self.params.contains(id)
    }

    pub fn state(&self) -> Result<NegotiationState, TxError> {
        Ok(self.get(ParameterId::STATE)?.unwrap_or(NegotiationState::Initial))
    }

    pub fn set_state(&mut self, state: NegotiationState) -> Result<(), TxError> {
        debug!(tx_id = %self.tx_id, ?state, "negotiation state");
        self.set(ParameterId::STATE, &state)
    }

    pub fn set_status(&mut self, status: TxStatus) -> Result<(), TxError> {
        self.set(ParameterId::STATUS, &status)
    }

    pub fn min_height(&self) -> Result<Height, TxError> {
        self.require(ParameterId::MIN_HEIGHT)
    }

    fn lifetime(&self) -> Result<Height, TxError> {
        Ok(self
            .get(ParameterId::LIFETIME)?
            .unwrap_or(self.ctx.config.default_lifetime))
    }

    pub fn kernel_id(&self) -> Result<KernelId, TxError> {
        self.require(ParameterId::KERNEL_ID)
    }

    /// The peer announced a protocol version. Peers that don't are legacy
    /// and need an explicit registration notice.
    pub fn peer_is_modern(&self) -> Result<bool, TxError> {
        Ok(self.get::<u32>(ParameterId::PEER_PROTO_VERSION)?.is_some())
    }

    // -- keeper plumbing -----------------------------------------------------

    fn invoke(&mut self, call: KeeperCall, method: Method) -> Result<bool, TxError> {
        if !self.pending.insert(call) {
            return Ok(true);
        }
        let tx_id = self.tx_id;
        let events = self.ctx.events.clone();
        debug!(%tx_id, call = call.name(), "key keeper call issued");
        self.ctx.keeper.invoke_async(
            method,
            Box::new(move |result| {
                // The wallet may already be gone; nothing left to update then.
                let _ = events.send(WalletEvent::KeeperReply { tx_id, call, result });
            }),
        );
        Ok(true)
    }

    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Store a keeper reply in the bag.
    pub fn apply_reply(&mut self, call: KeeperCall, result: KeeperResult<Reply>) -> Result<(), TxError> {
        self.pending.remove(&call);
        match (call, result?) {
            (KeeperCall::AllocateNonce, Reply::NonceSlot(slot)) => self.set(ParameterId::NONCE_SLOT, &slot),
            (KeeperCall::InputKeys, Reply::PublicKeys(keys)) => {
                let inputs: Vec<Input> = keys.into_iter().map(|commitment| Input { commitment }).collect();
                self.set(ParameterId::INPUTS, &inputs)
            }
            (KeeperCall::Outputs, Reply::Outputs(outputs)) => self.set(ParameterId::OUTPUTS, &outputs),
            (KeeperCall::SenderInitial, Reply::Sender(sig)) => {
                self.set(ParameterId::PUBLIC_EXCESS, &sig.public_excess)?;
                self.set(ParameterId::PUBLIC_NONCE, &sig.public_nonce)?;
                self.set(ParameterId::OFFSET, &sig.offset)
            }
            (KeeperCall::SenderFinal, Reply::Sender(sig)) => {
                let published: Option<CompressedRistretto> = self.get(ParameterId::PUBLIC_EXCESS)?;
                if published != Some(sig.public_excess) {
                    return Err(TxFailureReason::InvalidState.into());
                }
                let (Some(partial), Some(kernel_id)) = (sig.partial_signature, sig.kernel_id) else {
                    return Err(KeeperError::UnexpectedReply(call.name()).into());
                };
                self.set(ParameterId::PARTIAL_SIGNATURE, &partial)?;
                self.set(ParameterId::KERNEL_ID, &kernel_id)
            }
            (KeeperCall::Receiver, Reply::Receiver(sig)) => {
                self.set(ParameterId::PUBLIC_EXCESS, &sig.public_excess)?;
                self.set(ParameterId::PUBLIC_NONCE, &sig.public_nonce)?;
                self.set(ParameterId::OFFSET, &sig.offset)?;
                self.set(ParameterId::PARTIAL_SIGNATURE, &sig.partial_signature)?;
                if let Some(confirmation) = &sig.payment_confirmation {
                    self.set(ParameterId::PAYMENT_CONFIRMATION, confirmation)?;
                }
                self.set(ParameterId::KERNEL_ID, &sig.kernel_id)
            }
            (KeeperCall::Split, Reply::Split(signed)) => {
                self.set(ParameterId::OFFSET, &signed.offset)?;
                self.set(ParameterId::KERNEL_ID, &signed.kernel.id())?;
                self.set(ParameterId::KERNEL, &signed.kernel)
            }
            (call, _) => Err(KeeperError::UnexpectedReply(call.name()).into()),
        }
    }

    // -- coins ---------------------------------------------------------------

    /// Coins are chosen once, on the first pass.
    pub fn has_initial_params(&self) -> bool {
        self.has(ParameterId::OUTPUT_COINS)
    }

    /// Select inputs and change (sender), create the coins being received
    /// (receiver or self), and record both lists in the bag.
    pub fn prepare_coins(&mut self, is_sender: bool, is_self: bool) -> Result<(), TxError> {
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();

        if is_sender {
            let (selected, change) = self.select_inputs()?;
            for mut coin in selected {
                coin.status = CoinStatus::Outgoing;
                coin.spent_tx_id = Some(self.tx_id);
                self.ctx.storage.save_coin(&coin)?;
                inputs.push(coin.id);
            }
            for (asset_id, amount) in change {
                outputs.push(self.new_coin(KeyType::Change, amount, asset_id)?);
            }
        }
        if is_self || !is_sender {
            for amount in self.amounts.clone() {
                outputs.push(self.new_coin(KeyType::Regular, amount, self.asset_id)?);
            }
        }

        self.set(ParameterId::INPUT_COINS, &inputs)?;
        self.set(ParameterId::OUTPUT_COINS, &outputs)
    }

    fn select_inputs(&self) -> Result<(Vec<Coin>, Vec<(AssetId, Amount)>), TxError> {
        let mut targets: BTreeMap<AssetId, Amount> = BTreeMap::new();
        for (asset_id, value) in [(self.asset_id, self.amount), (NATIVE_ASSET, self.fee)] {
            let target = targets.entry(asset_id).or_default();
            *target = target
                .checked_add(value)
                .ok_or(TxError::Failed(TxFailureReason::InvalidParameters))?;
        }

        let mut selected = Vec::new();
        let mut change = Vec::new();
        for (asset_id, target) in targets {
            let available = self.ctx.storage.available_coins(asset_id)?;
            let coins = select_coins(&available, target).ok_or(TxError::Failed(TxFailureReason::NoInputs))?;
            let total = coins.iter().fold(0u64, |acc, c| acc.saturating_add(c.amount()));
            if total > target {
                change.push((asset_id, total - target));
            }
            selected.extend(coins);
        }
        Ok((selected, change))
    }

    fn new_coin(&self, key_type: KeyType, amount: Amount, asset_id: AssetId) -> Result<CoinId, TxError> {
        let idx = self.ctx.storage.allocate_key_index()?;
        let id = CoinId::new(idx, key_type, amount).with_asset(asset_id);
        let mut coin = Coin::new(id, CoinStatus::Incoming);
        coin.create_tx_id = Some(self.tx_id);
        self.ctx.storage.save_coin(&coin)?;
        Ok(id)
    }

    /// Inputs become spent and outputs spendable at `height`.
    pub fn complete_coins(&self, height: Height) -> Result<(), TxError> {
        let inputs: Vec<CoinId> = self.get(ParameterId::INPUT_COINS)?.unwrap_or_default();
        let outputs: Vec<CoinId> = self.get(ParameterId::OUTPUT_COINS)?.unwrap_or_default();
        for id in inputs {
            if let Some(mut coin) = self.ctx.storage.find_coin(&id)? {
                coin.status = CoinStatus::Spent;
                coin.spent_height = Some(height);
                coin.spent_tx_id = Some(self.tx_id);
                self.ctx.storage.save_coin(&coin)?;
            }
        }
        for id in outputs {
            if let Some(mut coin) = self.ctx.storage.find_coin(&id)? {
                coin.status = CoinStatus::Available;
                coin.confirm_height = Some(height);
                self.ctx.storage.save_coin(&coin)?;
            }
        }
        Ok(())
    }

    // -- keeper-backed steps -------------------------------------------------

    pub fn allocate_nonce(&mut self) -> Result<bool, TxError> {
        if self.has(ParameterId::NONCE_SLOT) {
            return Ok(false);
        }
        self.invoke(KeeperCall::AllocateNonce, Method::AllocateNonceSlot)
    }

    pub fn create_inputs(&mut self) -> Result<bool, TxError> {
        if self.has(ParameterId::INPUTS) {
            return Ok(false);
        }
        let ids: Vec<CoinId> = self.require(ParameterId::INPUT_COINS)?;
        if ids.is_empty() {
            self.set(ParameterId::INPUTS, &Vec::<Input>::new())?;
            return Ok(false);
        }
        self.invoke(
            KeeperCall::InputKeys,
            Method::GeneratePublicKeys {
                ids,
                create_coin_key: true,
            },
        )
    }

    pub fn create_outputs(&mut self) -> Result<bool, TxError> {
        if self.has(ParameterId::OUTPUTS) {
            return Ok(false);
        }
        let ids: Vec<CoinId> = self.require(ParameterId::OUTPUT_COINS)?;
        if ids.is_empty() {
            self.set(ParameterId::OUTPUTS, &Vec::<Output>::new())?;
            return Ok(false);
        }
        let scheme_height = self.min_height()?;
        self.invoke(KeeperCall::Outputs, Method::GenerateOutputs { scheme_height, ids })
    }

    fn kernel_parameters(&self) -> Result<KernelParameters, TxError> {
        Ok(KernelParameters {
            fee: self.fee,
            min_height: self.min_height()?,
            max_height: self.proposed_max_height()?,
            peer_public_excess: self.get(ParameterId::PEER_PUBLIC_EXCESS)?,
            peer_public_nonce: self.get(ParameterId::PEER_PUBLIC_NONCE)?,
            my_id: self.get(ParameterId::MY_ID)?,
            peer_id: self.get(ParameterId::PEER_ID)?,
        })
    }

    pub fn sign_sender(&mut self, initial: bool) -> Result<bool, TxError> {
        let (done, call) = if initial {
            (self.has(ParameterId::PUBLIC_EXCESS), KeeperCall::SenderInitial)
        } else {
            (self.has(ParameterId::PARTIAL_SIGNATURE), KeeperCall::SenderFinal)
        };
        if done {
            return Ok(false);
        }
        let method = Method::SignSender {
            inputs: self.require(ParameterId::INPUT_COINS)?,
            outputs: self.require(ParameterId::OUTPUT_COINS)?,
            nonce_slot: self.require(ParameterId::NONCE_SLOT)?,
            kernel: self.kernel_parameters()?,
            initial,
        };
        self.invoke(call, method)
    }

    pub fn sign_receiver(&mut self) -> Result<bool, TxError> {
        if self.has(ParameterId::PARTIAL_SIGNATURE) {
            return Ok(false);
        }
        let wallet_id_key = match self.get::<WalletId>(ParameterId::MY_ID)? {
            Some(my_id) => self.ctx.storage.find_address(&my_id)?.and_then(|a| a.own_id),
            None => None,
        };
        let method = Method::SignReceiver {
            inputs: self.require(ParameterId::INPUT_COINS)?,
            outputs: self.require(ParameterId::OUTPUT_COINS)?,
            kernel: self.kernel_parameters()?,
            wallet_id_key,
        };
        self.invoke(KeeperCall::Receiver, method)
    }

    pub fn sign_split(&mut self) -> Result<bool, TxError> {
        if self.has(ParameterId::KERNEL) {
            return Ok(false);
        }
        let method = Method::SignSplit {
            inputs: self.require(ParameterId::INPUT_COINS)?,
            outputs: self.require(ParameterId::OUTPUT_COINS)?,
            kernel: self.kernel_parameters()?,
        };
        self.invoke(KeeperCall::Split, method)
    }

    // -- kernel --------------------------------------------------------------

    /// `MaxHeight` if fixed, else `MinHeight + Lifetime`; clamped to the
    /// peer's advertised maximum.
    pub fn proposed_max_height(&self) -> Result<Height, TxError> {
        let min = self.min_height()?;
        let mut max = match self.get::<Height>(ParameterId::MAX_HEIGHT)? {
            Some(max) => max,
            None => min.saturating_add(self.lifetime()?),
        };
        if let Some(peer_max) = self.get::<Height>(ParameterId::PEER_MAX_HEIGHT)? {
            max = max.min(peer_max);
        }
        Ok(max)
    }

    pub fn is_acceptable_max_height(&self, max: Height) -> Result<bool, TxError> {
        let min = self.min_height()?;
        let tip = self.ctx.gateway.tip_height();
        Ok(max >= min && max >= tip && max - min <= self.ctx.config.max_lifetime)
    }

    /// Fix the kernel's max height. `false` when the window is unusable.
    pub fn update_max_height(&mut self) -> Result<bool, TxError> {
        let max = self.proposed_max_height()?;
        if !self.is_acceptable_max_height(max)? {
            warn!(tx_id = %self.tx_id, max, tip = self.ctx.gateway.tip_height(), "unacceptable max height");
            return Ok(false);
        }
        self.set(ParameterId::MAX_HEIGHT, &max)?;
        Ok(true)
    }

    pub fn has_peer_public_excess_and_nonce(&self) -> bool {
        self.has(ParameterId::PEER_PUBLIC_EXCESS) && self.has(ParameterId::PEER_PUBLIC_NONCE)
    }

    fn peer_point(&self, id: ParameterId) -> Result<RistrettoPoint, TxError> {
        let point: CompressedRistretto = self.require(id)?;
        point
            .decompress()
            .ok_or(TxError::Failed(TxFailureReason::InvalidPeerData))
    }

    /// `(X_mine + X_peer, R_mine + R_peer)`.
    fn aggregate_commitments(&self) -> Result<(CompressedRistretto, CompressedRistretto), TxError> {
        let excess = self.peer_point(ParameterId::PUBLIC_EXCESS)? + self.peer_point(ParameterId::PEER_PUBLIC_EXCESS)?;
        let nonce = self.peer_point(ParameterId::PUBLIC_NONCE)? + self.peer_point(ParameterId::PEER_PUBLIC_NONCE)?;
        Ok((excess.compress(), nonce.compress()))
    }

    fn kernel_message(&self, total_excess: &CompressedRistretto) -> Result<[u8; 32], TxError> {
        Ok(kernel_message(
            self.fee,
            self.min_height()?,
            self.require(ParameterId::MAX_HEIGHT)?,
            total_excess,
            None,
        ))
    }

    /// `s_peer·G == R_peer + e·X_peer` for the kernel both sides signed.
    pub fn is_peer_signature_valid(&self) -> Result<bool, TxError> {
        let (total_excess, total_nonce) = self.aggregate_commitments()?;
        let message = self.kernel_message(&total_excess)?;
        let e = challenge(&total_nonce, &total_excess, &message);
        let peer_signature: Scalar = self.require(ParameterId::PEER_SIGNATURE)?;
        Ok(verify_partial(
            &peer_signature,
            &self.peer_point(ParameterId::PEER_PUBLIC_NONCE)?,
            &self.peer_point(ParameterId::PEER_PUBLIC_EXCESS)?,
            &e,
        ))
    }

    /// Combine both partial signatures into the final kernel.
    pub fn finalize_signature(&mut self) -> Result<(), TxError> {
        let (total_excess, total_nonce) = self.aggregate_commitments()?;
        let mine: Scalar = self.require(ParameterId::PARTIAL_SIGNATURE)?;
        let peer: Scalar = self.require(ParameterId::PEER_SIGNATURE)?;
        let kernel = TxKernel {
            excess: total_excess,
            fee: self.fee,
            min_height: self.min_height()?,
            max_height: self.require(ParameterId::MAX_HEIGHT)?,
            signature: Signature::aggregate(total_nonce, &[mine, peer]),
            asset_emission: None,
        };
        if !kernel.verify_signature() {
            return Err(TxFailureReason::InvalidPeerSignature.into());
        }
        if self.kernel_id()? != kernel.id() {
            return Err(TxFailureReason::InvalidState.into());
        }
        self.set(ParameterId::KERNEL, &kernel)
    }

    /// Own and peer halves joined into one normalized transaction.
    pub fn create_transaction(&self) -> Result<Transaction, TxError> {
        let mut inputs: Vec<Input> = self.require(ParameterId::INPUTS)?;
        let mut outputs: Vec<Output> = self.require(ParameterId::OUTPUTS)?;
        let mut offset: Scalar = self.require(ParameterId::OFFSET)?;
        if let Some(peer_inputs) = self.get::<Vec<Input>>(ParameterId::PEER_INPUTS)? {
            inputs.extend(peer_inputs);
        }
        if let Some(peer_outputs) = self.get::<Vec<Output>>(ParameterId::PEER_OUTPUTS)? {
            outputs.extend(peer_outputs);
        }
        if let Some(peer_offset) = self.get::<Scalar>(ParameterId::PEER_OFFSET)? {
            offset += peer_offset;
        }
        let mut tx = Transaction {
            inputs,
            outputs,
            kernels: vec![self.require(ParameterId::KERNEL)?],
            offset,
        };
        tx.normalize();
        Ok(tx)
    }

    // -- expiry --------------------------------------------------------------

    /// Past the kernel's max height, or past the response deadline while
    /// the max height is still open.
    pub fn is_expired(&self) -> Result<bool, TxError> {
        if self.has(ParameterId::KERNEL_PROOF_HEIGHT) {
            return Ok(false);
        }
        let deadline = match self.get::<Height>(ParameterId::MAX_HEIGHT)? {
            Some(max) => max,
            None => match self.get::<Height>(ParameterId::PEER_RESPONSE_HEIGHT)? {
                Some(response) => response,
                None => return Ok(false),
            },
        };
        let tip = self.ctx.gateway.tip_height();
        let unconfirmed: Height = self.get(ParameterId::KERNEL_UNCONFIRMED_HEIGHT)?.unwrap_or(0);
        Ok(tip > deadline || (unconfirmed > 0 && unconfirmed >= deadline))
    }

    // -- peer messages -------------------------------------------------------

    pub fn send_params(&self, params: TxParameters) -> Result<(), TxError> {
        send_to_peer(self.ctx, self.tx_id, &*self.params, params)
    }

    /// Sender → receiver: everything needed to sign the receiving half.
    pub fn send_invitation(&self, max_height: Height) -> Result<(), TxError> {
        let mut msg = TxParameters::new();
        msg.set(ParameterId::TRANSACTION_TYPE, &TxType::Simple)?;
        msg.set(ParameterId::AMOUNT, &self.amount())?;
        msg.set(ParameterId::FEE, &self.fee)?;
        msg.set(ParameterId::MIN_HEIGHT, &self.min_height()?)?;
        msg.set(ParameterId::LIFETIME, &self.lifetime()?)?;
        msg.set(ParameterId::PEER_MAX_HEIGHT, &max_height)?;
        msg.set(ParameterId::IS_SENDER, &false)?;
        msg.set(ParameterId::PEER_PROTO_VERSION, &TX_PROTOCOL_VERSION)?;
        msg.set(
            ParameterId::PEER_PUBLIC_EXCESS,
            &self.require::<CompressedRistretto>(ParameterId::PUBLIC_EXCESS)?,
        )?;
        msg.set(
            ParameterId::PEER_PUBLIC_NONCE,
            &self.require::<CompressedRistretto>(ParameterId::PUBLIC_NONCE)?,
        )?;
        msg.set(ParameterId::ASSET_ID, &self.asset_id)?;
        if let Some(message) = self.get::<String>(ParameterId::MESSAGE)? {
            msg.set(ParameterId::MESSAGE, &message)?;
        }
        self.send_params(msg)
    }

    /// Receiver → sender: the receiving half, signed.
    pub fn confirm_invitation(&self) -> Result<(), TxError> {
        let mut msg = TxParameters::new();
        msg.set(ParameterId::PEER_PROTO_VERSION, &TX_PROTOCOL_VERSION)?;
        msg.set(
            ParameterId::PEER_PUBLIC_EXCESS,
            &self.require::<CompressedRistretto>(ParameterId::PUBLIC_EXCESS)?,
        )?;
        msg.set(
            ParameterId::PEER_PUBLIC_NONCE,
            &self.require::<CompressedRistretto>(ParameterId::PUBLIC_NONCE)?,
        )?;
        msg.set(
            ParameterId::PEER_SIGNATURE,
            &self.require::<Scalar>(ParameterId::PARTIAL_SIGNATURE)?,
        )?;
        msg.set(ParameterId::PEER_MAX_HEIGHT, &self.require::<Height>(ParameterId::MAX_HEIGHT)?)?;
        msg.set(ParameterId::PEER_INPUTS, &self.require::<Vec<Input>>(ParameterId::INPUTS)?)?;
        msg.set(ParameterId::PEER_OUTPUTS, &self.require::<Vec<Output>>(ParameterId::OUTPUTS)?)?;
        msg.set(ParameterId::PEER_OFFSET, &self.require::<Scalar>(ParameterId::OFFSET)?)?;
        if let Some(confirmation) = self.get::<Signature>(ParameterId::PAYMENT_CONFIRMATION)? {
            msg.set(ParameterId::PAYMENT_CONFIRMATION, &confirmation)?;
        }
        self.send_params(msg)
    }
}

// ---------------------------------------------------------------------------
// Bag-only helpers
// ---------------------------------------------------------------------------

/// Send `msg` from this transaction's `MyID` to its `PeerID`.
pub fn send_to_peer(ctx: &TxContext, tx_id: TxId, own: &TxParameters, msg: TxParameters) -> Result<(), TxError> {
    let from: WalletId = own.require(ParameterId::MY_ID)?;
    let to: WalletId = own.require(ParameterId::PEER_ID)?;
    let msg = SetTxParameter {
        from,
        tx_id,
        tx_type: TxType::Simple,
        params: msg,
    };
    if ctx.peers.send_tx_params(&to, msg) {
        Ok(())
    } else {
        warn!(%tx_id, peer = %to, "peer channel rejected parameters");
        Err(TxFailureReason::FailedToSendParameters.into())
    }
}

/// Release everything a failed transaction held: selected inputs become
/// spendable again, coins it was about to create are forgotten.
pub fn rollback_coins(tx_id: TxId, params: &TxParameters, storage: &dyn WalletStorage) -> Result<(), TxError> {
    let inputs: Vec<CoinId> = params.get(ParameterId::INPUT_COINS)?.unwrap_or_default();
    let outputs: Vec<CoinId> = params.get(ParameterId::OUTPUT_COINS)?.unwrap_or_default();
    for id in inputs {
        if let Some(mut coin) = storage.find_coin(&id)? {
            if coin.status == CoinStatus::Outgoing && coin.spent_tx_id == Some(tx_id) {
                coin.status = CoinStatus::Available;
                coin.spent_tx_id = None;
                storage.save_coin(&coin)?;
            }
        }
    }
    for id in outputs {
        if let Some(coin) = storage.find_coin(&id)? {
            if coin.status == CoinStatus::Incoming && coin.create_tx_id == Some(tx_id) {
                storage.delete_coin(&id)?;
            }
        }
    }
    debug!(%tx_id, "coins rolled back");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn coin(idx: u64, amount: Amount) -> Coin {
        Coin::new(CoinId::new(idx, KeyType::Regular, amount), CoinStatus::Available)
    }

    fn amounts(coins: &[Coin]) -> Vec<Amount> {
        coins.iter().map(Coin::amount).collect()
    }

    #[test]
    fn smallest_covering_coin_wins() {
        let coins = vec![coin(1, 50), coin(2, 500), coin(3, 120), coin(4, 5_000)];
        let picked = select_coins(&coins, 100).unwrap();
        assert_eq!(amounts(&picked), vec![120]);
    }

    #[test]
    fn falls_back_to_largest_first() {
        let coins = vec![coin(1, 50), coin(2, 40), coin(3, 30), coin(4, 20)];
        let picked = select_coins(&coins, 85).unwrap();
        assert_eq!(amounts(&picked), vec![50, 40]);
    }

    #[test]
    fn unreachable_target_fails() {
        let coins = vec![coin(1, 50), coin(2, 40)];
        assert!(select_coins(&coins, 91).is_none());
        assert!(select_coins(&[], 1).is_none());
    }

    #[test]
    fn zero_target_needs_nothing() {
        assert_eq!(select_coins(&[coin(1, 10)], 0), Some(Vec::new()));
    }

    #[test]
    fn selection_is_deterministic_across_orderings() {
        let a = vec![coin(1, 30), coin(2, 30), coin(3, 30)];
        let b = vec![coin(3, 30), coin(1, 30), coin(2, 30)];
        assert_eq!(select_coins(&a, 60), select_coins(&b, 60));
    }

    #[test]
    fn rollback_releases_inputs_and_forgets_outputs() {
        let db = crate::storage::WalletDb::open_temporary().unwrap();
        let tx_id = TxId::generate();
        let mut input = coin(1, 500);
        input.status = CoinStatus::Outgoing;
        input.spent_tx_id = Some(tx_id);
        let mut output = Coin::new(CoinId::new(2, KeyType::Change, 100), CoinStatus::Incoming);
        output.create_tx_id = Some(tx_id);
        db.save_coin(&input).unwrap();
        db.save_coin(&output).unwrap();

        let mut params = TxParameters::new();
        params.set(ParameterId::INPUT_COINS, &vec![input.id]).unwrap();
        params.set(ParameterId::OUTPUT_COINS, &vec![output.id]).unwrap();
        rollback_coins(tx_id, &params, &db).unwrap();

        let restored = db.find_coin(&input.id).unwrap().unwrap();
        assert_eq!(restored.status, CoinStatus::Available);
        assert!(restored.spent_tx_id.is_none());
        assert!(db.find_coin(&output.id).unwrap().is_none());
    }

    #[test]
    fn rollback_leaves_other_transactions_alone() {
        let db = crate::storage::WalletDb::open_temporary().unwrap();
        let mut input = coin(1, 500);
        input.status = CoinStatus::Outgoing;
        input.spent_tx_id = Some(TxId::generate());
        db.save_coin(&input).unwrap();

        let mut params = TxParameters::new();
        params.set(ParameterId::INPUT_COINS, &vec![input.id]).unwrap();
        rollback_coins(TxId::generate(), &params, &db).unwrap();

        assert_eq!(db.find_coin(&input.id).unwrap().unwrap().status, CoinStatus::Outgoing);
    }

    fn context() -> TxContext {
        let db = Arc::new(crate::storage::WalletDb::open_temporary().unwrap());
        let keeper = crate::keykeeper::LocalKeyKeeper::from_seed(db.clone(), &[3u8; 32]).unwrap();
        let (events, _) = tokio::sync::mpsc::unbounded_channel();
        TxContext {
            storage: db,
            keeper: Arc::new(keeper),
            gateway: crate::loopback::LocalChain::new(10).connect(),
            peers: crate::loopback::LocalNetwork::new(),
            events,
            config: WalletConfig::default(),
        }
    }

    #[test]
    fn overflowing_amount_list_is_invalid() {
        let ctx = context();
        let mut params = TxParameters::new();
        params.set(ParameterId::FEE, &100u64).unwrap();
        params.set(ParameterId::AMOUNT_LIST, &vec![u64::MAX, 1]).unwrap();
        let mut pending = HashSet::new();
        let err = TxBuilder::new(TxId::generate(), &mut params, &mut pending, &ctx)
            .err()
            .unwrap();
        assert_eq!(err.reason(), TxFailureReason::InvalidParameters);
    }

    #[test]
    fn amount_plus_fee_overflow_selects_nothing() {
        let ctx = context();
        let mut spendable = coin(1, 5_000);
        spendable.confirm_height = Some(1);
        ctx.storage.save_coin(&spendable).unwrap();

        let mut params = TxParameters::new();
        params.set(ParameterId::FEE, &100u64).unwrap();
        params.set(ParameterId::AMOUNT, &u64::MAX).unwrap();
        let mut pending = HashSet::new();
        let mut b = TxBuilder::new(TxId::generate(), &mut params, &mut pending, &ctx).unwrap();
        assert_eq!(b.amount(), u64::MAX);
        let err = b.prepare_coins(true, false).unwrap_err();
        assert_eq!(err.reason(), TxFailureReason::InvalidParameters);
        assert_eq!(
            ctx.storage.find_coin(&spendable.id).unwrap().unwrap().status,
            CoinStatus::Available
        );
    }
}
