//! # Simple Transaction Negotiation
//!
//! Re-entrant state machine for a two-party (or self) payment. Every
//! trigger, whether a peer bag, a keeper reply, a chain event or a new tip,
//! ends in [`SimpleTransaction::update`], which walks the steps from the top
//! and stops at the first one that has to wait. Progress is whatever is in
//! the parameter bag, so a wallet restarted mid-negotiation resumes exactly
//! where it stopped.
//!
//! ```text
//!  sender                                   receiver
//!  ──────                                   ────────
//!  select coins, nonce slot
//!  inputs, outputs
//!  X_s, R_s  ──── invitation ───────────▶  select outputs
//!  [Invitation]                            inputs, outputs, sign
//!            ◀─── confirmation ──────────  X_r, R_r, s_r, offset_r
//!  sign, verify s_r, finalize kernel       [KernelConfirmation]
//!  register  [Registration]
//!  wait for proof [KernelConfirmation]     wait for proof
//!  [Completed]                             [Completed]
//! ```

use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::builder::{rollback_coins, send_to_peer, KeeperCall, TxBuilder, TxContext};
use super::error::TxError;
use super::parameters::{ParameterId, TxParameters};
use super::types::{Height, NegotiationState, RegistrationStatus, TxFailureReason, TxId, TxStatus};
use super::verification::{verify_transaction, ValidationContext};
use crate::gateway::ChainEvent;
use crate::keykeeper::{KeeperResult, Reply};

/// Parameters the peer may set once and never change.
const IMMUTABLE_PARAMETERS: [ParameterId; 6] = [
    ParameterId::TRANSACTION_TYPE,
    ParameterId::IS_SENDER,
    ParameterId::AMOUNT,
    ParameterId::FEE,
    ParameterId::MIN_HEIGHT,
    ParameterId::ASSET_ID,
];

pub struct SimpleTransaction {
    tx_id: TxId,
    params: TxParameters,
    /// Keeper requests in flight. Not persisted: after a restart the steps
    /// simply ask again.
    pending: HashSet<KeeperCall>,
}

impl SimpleTransaction {
    pub fn new(tx_id: TxId, params: TxParameters) -> Self {
        Self {
            tx_id,
            params,
            pending: HashSet::new(),
        }
    }

    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    pub fn params(&self) -> &TxParameters {
        &self.params
    }

    pub fn status(&self) -> TxStatus {
        self.flag(ParameterId::STATUS).unwrap_or(TxStatus::Pending)
    }

    pub fn state(&self) -> NegotiationState {
        self.flag(ParameterId::STATE).unwrap_or(NegotiationState::Initial)
    }

    pub fn failure_reason(&self) -> Option<TxFailureReason> {
        self.flag(ParameterId::FAILURE_REASON)
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_awaiting_keeper(&self) -> bool {
        !self.pending.is_empty()
    }

    fn is_self(&self) -> bool {
        self.flag(ParameterId::IS_SELF_TX).unwrap_or(false)
    }

    fn is_initiator(&self) -> bool {
        self.flag(ParameterId::IS_INITIATOR).unwrap_or(false)
    }

    /// Undecodable bookkeeping reads as absent; the next update then fails
    /// the transaction with `InvalidParameters`.
    fn flag<T: serde::de::DeserializeOwned>(&self, id: ParameterId) -> Option<T> {
        self.params.get(id).ok().flatten()
    }

    fn builder<'a>(&'a mut self, ctx: &'a TxContext) -> Result<TxBuilder<'a>, TxError> {
        TxBuilder::new(self.tx_id, &mut self.params, &mut self.pending, ctx)
    }

    fn save(&self, ctx: &TxContext) {
        if let Err(e) = ctx.storage.save_tx_parameters(&self.tx_id, &self.params) {
            warn!(tx_id = %self.tx_id, error = %e, "failed to persist transaction");
        }
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// Advance as far as possible and persist the result.
    pub fn update(&mut self, ctx: &TxContext) {
        if self.is_terminal() {
            return;
        }
        if let Err(e) = self.update_impl(ctx) {
            self.fail(ctx, e.reason(), e.notify_peer());
        }
        self.save(ctx);
    }

    /// Re-arm chain subscriptions that do not survive a restart.
    pub fn resume(&mut self, ctx: &TxContext) {
        if self.state() == NegotiationState::KernelConfirmation && !self.is_terminal() {
            if let Ok(Some(kernel_id)) = self.params.get(ParameterId::KERNEL_ID) {
                ctx.gateway.confirm_kernel(self.tx_id, kernel_id);
            }
        }
        self.update(ctx);
    }

    pub fn on_keeper_reply(&mut self, ctx: &TxContext, call: KeeperCall, result: KeeperResult<Reply>) {
        if self.is_terminal() {
            self.pending.remove(&call);
            debug!(tx_id = %self.tx_id, call = call.name(), "late keeper reply dropped");
            return;
        }
        let applied = self.builder(ctx).and_then(|mut b| b.apply_reply(call, result));
        match applied {
            Ok(()) => self.update(ctx),
            Err(e) => {
                self.fail(ctx, e.reason(), e.notify_peer());
                self.save(ctx);
            }
        }
    }

    /// Merge a bag received from the peer.
    pub fn on_peer_params(&mut self, ctx: &TxContext, incoming: &TxParameters) {
        if self.is_terminal() {
            debug!(tx_id = %self.tx_id, "parameters for a finished transaction ignored");
            return;
        }

        if incoming.contains(ParameterId::FAILURE_REASON) {
            let reason = incoming
                .get(ParameterId::FAILURE_REASON)
                .ok()
                .flatten()
                .unwrap_or(TxFailureReason::Unknown);
            info!(tx_id = %self.tx_id, %reason, "peer abandoned the transaction");
            self.fail(ctx, reason, false);
            self.save(ctx);
            return;
        }

        let is_initiator = self.is_initiator();
        for (sub_tx, id, bytes) in incoming.iter() {
            if id.is_private() {
                warn!(tx_id = %self.tx_id, %id, "peer tried to set a private parameter");
                continue;
            }
            if id == ParameterId::TRANSACTION_REGISTERED && is_initiator {
                continue;
            }
            if IMMUTABLE_PARAMETERS.contains(&id) {
                if let Some(existing) = self.params.get_raw(id, sub_tx) {
                    if existing != bytes {
                        warn!(tx_id = %self.tx_id, %id, "peer changed an immutable parameter");
                        self.fail(ctx, TxFailureReason::InvalidPeerData, true);
                        self.save(ctx);
                        return;
                    }
                    continue;
                }
            }
            if let Err(e) = self.params.set_raw(id, sub_tx, bytes.to_vec()) {
                warn!(tx_id = %self.tx_id, %id, error = %e, "peer parameter dropped");
            }
        }
        self.update(ctx);
    }

    pub fn on_chain_event(&mut self, ctx: &TxContext, event: &ChainEvent) {
        if self.is_terminal() {
            return;
        }
        let recorded = match *event {
            ChainEvent::Registered { status, .. } => self.on_registered(ctx, status),
            ChainEvent::KernelProof { height, .. } => {
                info!(tx_id = %self.tx_id, height, "kernel proof received");
                self.params
                    .set(ParameterId::KERNEL_PROOF_HEIGHT, &height)
                    .map_err(TxError::from)
            }
            ChainEvent::KernelUnconfirmed { height, .. } => self
                .params
                .set(ParameterId::KERNEL_UNCONFIRMED_HEIGHT, &height)
                .map_err(TxError::from),
            ChainEvent::NewTip { .. } => Ok(()),
        };
        match recorded {
            Ok(()) => self.update(ctx),
            Err(e) => {
                self.fail(ctx, e.reason(), e.notify_peer());
                self.save(ctx);
            }
        }
    }

    fn on_registered(&mut self, ctx: &TxContext, status: RegistrationStatus) -> Result<(), TxError> {
        // Only the first answer counts; later ones are about resubmissions.
        if let Some(first) = self.params.get::<RegistrationStatus>(ParameterId::TRANSACTION_REGISTERED)? {
            debug!(tx_id = %self.tx_id, ?first, ?status, "registration answer for a resubmission ignored");
            return Ok(());
        }
        info!(tx_id = %self.tx_id, ?status, "registration result");
        self.params.set(ParameterId::TRANSACTION_REGISTERED, &status)?;

        let legacy_peer = !self.params.contains(ParameterId::PEER_PROTO_VERSION);
        if status == RegistrationStatus::Ok && self.is_initiator() && !self.is_self() && legacy_peer {
            let mut msg = TxParameters::new();
            msg.set(ParameterId::TRANSACTION_REGISTERED, &status)?;
            send_to_peer(ctx, self.tx_id, &self.params, msg)?;
        }
        Ok(())
    }

    /// Cancel before the peer signed anything. `false` once it is too late.
    pub fn cancel(&mut self, ctx: &TxContext) -> bool {
        let state = self.state();
        if self.is_terminal() || !matches!(state, NegotiationState::Initial | NegotiationState::Invitation) {
            return false;
        }
        let notify = !self.is_self() && (state == NegotiationState::Invitation || !self.is_initiator());
        self.fail(ctx, TxFailureReason::Cancelled, notify);
        self.save(ctx);
        true
    }

    /// End the transaction. Never fails itself: whatever cannot be undone is
    /// logged and left for the user.
    fn fail(&mut self, ctx: &TxContext, reason: TxFailureReason, notify: bool) {
        let status = if reason == TxFailureReason::Cancelled {
            TxStatus::Cancelled
        } else {
            TxStatus::Failed
        };
        warn!(tx_id = %self.tx_id, %reason, "transaction {status}");
        self.pending.clear();

        let recorded = self
            .params
            .set(ParameterId::FAILURE_REASON, &reason)
            .and_then(|()| self.params.set(ParameterId::STATUS, &status));
        if let Err(e) = recorded {
            warn!(tx_id = %self.tx_id, error = %e, "could not record failure");
        }
        if let Err(e) = rollback_coins(self.tx_id, &self.params, ctx.storage.as_ref()) {
            warn!(tx_id = %self.tx_id, error = %e, "coin rollback failed");
        }

        if notify && !self.is_self() {
            let mut msg = TxParameters::new();
            let sent = msg
                .set(ParameterId::FAILURE_REASON, &reason)
                .map_err(TxError::from)
                .and_then(|()| send_to_peer(ctx, self.tx_id, &self.params, msg));
            if let Err(e) = sent {
                debug!(tx_id = %self.tx_id, error = %e, "peer not told about the failure");
            }
        }
    }

    // -----------------------------------------------------------------------
    // The walk
    // -----------------------------------------------------------------------

    fn update_impl(&mut self, ctx: &TxContext) -> Result<(), TxError> {
        let tx_id = self.tx_id;
        let is_self = self.is_self();
        let mut b = self.builder(ctx)?;

        if b.is_expired()? {
            return Err(TxFailureReason::TransactionExpired.into());
        }

        let is_sender: bool = b.require(ParameterId::IS_SENDER)?;
        let state = b.state()?;
        let has_kernel = if is_sender {
            b.has(ParameterId::KERNEL)
        } else {
            b.has(ParameterId::KERNEL_ID) && state != NegotiationState::Initial
        };

        if !has_kernel {
            if state == NegotiationState::Initial && !b.has_initial_params() {
                b.set_status(TxStatus::InProgress)?;
                b.prepare_coins(is_sender, is_self)?;
                info!(%tx_id, amount = b.amount(), fee = b.fee(), is_sender, "negotiation started");
            }

            let mut waiting = false;
            if is_sender && !is_self {
                waiting |= b.allocate_nonce()?;
            }
            waiting |= b.create_inputs()?;
            waiting |= b.create_outputs()?;
            if waiting {
                return Ok(());
            }

            if is_sender && !is_self && !b.has_peer_public_excess_and_nonce() {
                if state == NegotiationState::Initial {
                    if b.sign_sender(true)? {
                        return Ok(());
                    }
                    let max_height = b.proposed_max_height()?;
                    if !b.is_acceptable_max_height(max_height)? {
                        // Nothing was sent yet, so there is nobody to tell.
                        self.fail(ctx, TxFailureReason::MaxHeightIsUnacceptable, false);
                        return Ok(());
                    }
                    b.send_invitation(max_height)?;
                    b.set_state(NegotiationState::Invitation)?;
                    info!(%tx_id, max_height, "invitation sent");
                }
                return Ok(());
            }

            if !b.update_max_height()? {
                return Err(TxFailureReason::MaxHeightIsUnacceptable.into());
            }

            if is_self {
                if b.sign_split()? {
                    return Ok(());
                }
            } else if !is_sender {
                if b.sign_receiver()? {
                    return Ok(());
                }
                b.set_status(TxStatus::Registering)?;
                b.confirm_invitation()?;
                if b.peer_is_modern()? {
                    // A modern sender registers on its own; skip straight to
                    // watching for the kernel.
                    b.set(ParameterId::TRANSACTION_REGISTERED, &RegistrationStatus::Ok)?;
                    b.set_state(NegotiationState::KernelConfirmation)?;
                    ctx.gateway.confirm_kernel(tx_id, b.kernel_id()?);
                } else {
                    b.set_state(NegotiationState::InvitationConfirmation)?;
                }
                return Ok(());
            } else {
                if !b.has(ParameterId::PEER_SIGNATURE) {
                    return Ok(());
                }
                if b.sign_sender(false)? {
                    return Ok(());
                }
                if !b.is_peer_signature_valid()? {
                    return Err(TxFailureReason::InvalidPeerSignature.into());
                }
                b.finalize_signature()?;
                info!(%tx_id, kernel = %b.kernel_id()?, "kernel finalized");
            }
        }

        let registered: Option<RegistrationStatus> = b.get(ParameterId::TRANSACTION_REGISTERED)?;
        // Submitted again on every pass until the node answers; a lost answer
        // or a restart must not strand the transaction.
        let Some(registered) = registered else {
            if !is_sender {
                return Ok(());
            }
            if b.state()? == NegotiationState::Registration {
                debug!(%tx_id, "no registration answer yet, submitting again");
            }
            let tx = b.create_transaction()?;
            let height = b.min_height()?.max(ctx.gateway.tip_height() + 1);
            if let Err(e) = verify_transaction(&tx, &ValidationContext::at_height(height)) {
                warn!(%tx_id, error = %e, "assembled transaction rejected locally");
                return Err(TxFailureReason::InvalidTransaction.into());
            }
            ctx.gateway.register_tx(tx_id, &tx);
            b.set_status(TxStatus::Registering)?;
            b.set_state(NegotiationState::Registration)?;
            return Ok(());
        };

        let unconfirmed: Height = b.get(ParameterId::KERNEL_UNCONFIRMED_HEIGHT)?.unwrap_or(0);
        match registered {
            RegistrationStatus::Ok => {}
            // Possibly already mined; the proof request settles it.
            RegistrationStatus::InvalidContext if unconfirmed == 0 => {}
            _ => return Err(TxFailureReason::FailedToRegister.into()),
        }

        match b.get::<Height>(ParameterId::KERNEL_PROOF_HEIGHT)? {
            None => {
                if b.state()? != NegotiationState::KernelConfirmation {
                    b.set_state(NegotiationState::KernelConfirmation)?;
                    ctx.gateway.confirm_kernel(tx_id, b.kernel_id()?);
                }
            }
            Some(height) => {
                b.complete_coins(height)?;
                b.set_status(TxStatus::Completed)?;
                b.set_state(NegotiationState::Completed)?;
                info!(%tx_id, height, "transaction completed");
            }
        }
        Ok(())
    }
}
