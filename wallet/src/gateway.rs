//! # External Collaborators
//!
//! The two seams through which a wallet talks to the outside world: the
//! chain (registration, kernel proofs, tips) and the peer channel carrying
//! parameter bags. Both are fire-and-forget on the way out; answers come
//! back as [`ChainEvent`]s and inbound [`SetTxParameter`] messages fed to
//! [`Wallet`](crate::wallet::Wallet).

use crate::transaction::parameters::SetTxParameter;
use crate::transaction::tx::Transaction;
use crate::transaction::types::{Height, KernelId, RegistrationStatus, TxId, WalletId};

/// View of the chain a wallet needs.
pub trait ChainGateway: Send + Sync {
    fn tip_height(&self) -> Height;

    /// Submit a finished transaction. The verdict arrives later as
    /// [`ChainEvent::Registered`].
    fn register_tx(&self, tx_id: TxId, tx: &Transaction);

    /// Ask to be told when `kernel_id` makes it into a block:
    /// [`ChainEvent::KernelProof`] once it does, [`ChainEvent::KernelUnconfirmed`]
    /// for every block that does not include it.
    fn confirm_kernel(&self, tx_id: TxId, kernel_id: KernelId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEvent {
    Registered { tx_id: TxId, status: RegistrationStatus },
    KernelProof { tx_id: TxId, height: Height },
    KernelUnconfirmed { tx_id: TxId, height: Height },
    NewTip { height: Height },
}

impl ChainEvent {
    pub fn tx_id(&self) -> Option<TxId> {
        match self {
            ChainEvent::Registered { tx_id, .. }
            | ChainEvent::KernelProof { tx_id, .. }
            | ChainEvent::KernelUnconfirmed { tx_id, .. } => Some(*tx_id),
            ChainEvent::NewTip { .. } => None,
        }
    }
}

/// Outbound half of the secure-messaging channel.
pub trait PeerChannel: Send + Sync {
    /// `false` when the message could not be handed to the transport.
    fn send_tx_params(&self, to: &WalletId, msg: SetTxParameter) -> bool;
}
