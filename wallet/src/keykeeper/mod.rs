//! # Private Key Keeper
//!
//! The custodian of every secret in the wallet. Nothing outside this module
//! ever sees a blinding factor, a nonce or an address key; callers get
//! public points, finished outputs and partial signatures.
//!
//! ## One entry point, two forms
//!
//! The capability set is closed: a [`Method`] goes in, a [`Reply`] comes out.
//! Every keeper offers it in two forms:
//!
//! - [`PrivateKeyKeeper::invoke_sync`] blocks and returns the result.
//! - [`PrivateKeyKeeper::invoke_async`] returns immediately; the handler is
//!   invoked exactly once with the result.
//!
//! Each form has a default written in terms of the other, so an
//! implementation provides whichever side is natural for it:
//!
//! ```text
//! LocalKeyKeeper     implements invoke_sync   (async = call, then handler)
//! ThreadedKeyKeeper  implements both          (worker thread + completion queue)
//! hardware keeper    implements invoke_async  (sync = block on a oneshot)
//! ```
//!
//! The sync-over-async default blocks the calling thread on a oneshot
//! channel. It does not pump any event loop, so waiting can never re-enter
//! caller state.
//!
//! ## Typed helpers
//!
//! [`KeyKeeperExt`] wraps each method in a typed call and turns a reply of
//! the wrong shape into [`KeeperError::UnexpectedReply`].

pub mod local;
pub mod nonce;
pub mod threaded;

use std::sync::Arc;
use std::time::Duration;

use curve25519_dalek::ristretto::CompressedRistretto;
use curve25519_dalek::scalar::Scalar;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::crypto::keys::{Kdf, KeyError};
use crate::crypto::schnorr::Signature;
use crate::crypto::CryptoError;
use crate::transaction::kernel::{KernelParameters, TxKernel};
use crate::transaction::tx::Output;
use crate::transaction::types::{Amount, AssetId, CoinId, Height, KernelId};

pub use local::LocalKeyKeeper;
pub use threaded::ThreadedKeyKeeper;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum KeeperError {
    /// Bad coin id, unknown derivation path, value rules violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Nonce slot out of range, consumed or overwritten; wrong password.
    #[error("invalid keeper state: {0}")]
    State(String),

    #[error("cryptographic failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),

    /// The keeper was shut down before it answered.
    #[error("key keeper shut down before answering")]
    Abandoned,
}

impl From<KeyError> for KeeperError {
    fn from(e: KeyError) -> Self {
        KeeperError::InvalidArgument(e.to_string())
    }
}

pub type KeeperResult<T> = Result<T, KeeperError>;

// ---------------------------------------------------------------------------
// Requests & replies
// ---------------------------------------------------------------------------

/// Asset emission fields for [`Method::SignAssetKernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetKernelParameters {
    pub asset_id: AssetId,
    /// Positive mints, negative burns.
    pub emission: i64,
    pub min_height: Height,
    pub max_height: Height,
}

#[derive(Debug, Clone)]
pub enum Method {
    AllocateNonceSlot,
    GenerateNonce {
        slot: u64,
    },
    GeneratePublicKeys {
        ids: Vec<CoinId>,
        create_coin_key: bool,
    },
    GenerateOutputs {
        scheme_height: Height,
        ids: Vec<CoinId>,
    },
    SignSender {
        inputs: Vec<CoinId>,
        outputs: Vec<CoinId>,
        nonce_slot: u64,
        kernel: KernelParameters,
        initial: bool,
    },
    SignReceiver {
        inputs: Vec<CoinId>,
        outputs: Vec<CoinId>,
        kernel: KernelParameters,
        /// Own address key index; when present the reply carries a
        /// payment confirmation signed with it.
        wallet_id_key: Option<u64>,
    },
    SignSplit {
        inputs: Vec<CoinId>,
        outputs: Vec<CoinId>,
        kernel: KernelParameters,
    },
    GetSbbsKdf,
    GetAssetOwnerId {
        owner_idx: u64,
    },
    SignAssetKernel {
        inputs: Vec<CoinId>,
        outputs: Vec<CoinId>,
        fee: Amount,
        owner_idx: u64,
        params: AssetKernelParameters,
    },
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::AllocateNonceSlot => "AllocateNonceSlot",
            Method::GenerateNonce { .. } => "GenerateNonce",
            Method::GeneratePublicKeys { .. } => "GeneratePublicKeys",
            Method::GenerateOutputs { .. } => "GenerateOutputs",
            Method::SignSender { .. } => "SignSender",
            Method::SignReceiver { .. } => "SignReceiver",
            Method::SignSplit { .. } => "SignSplit",
            Method::GetSbbsKdf => "GetSbbsKdf",
            Method::GetAssetOwnerId { .. } => "GetAssetOwnerId",
            Method::SignAssetKernel { .. } => "SignAssetKernel",
        }
    }
}

/// Sender's contribution. The initial pass fills the public parts only; the
/// final pass adds the partial signature and the kernel id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderSignature {
    pub public_excess: CompressedRistretto,
    pub public_nonce: CompressedRistretto,
    pub offset: Scalar,
    pub partial_signature: Option<Scalar>,
    pub kernel_id: Option<KernelId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverSignature {
    pub public_excess: CompressedRistretto,
    pub public_nonce: CompressedRistretto,
    pub offset: Scalar,
    pub partial_signature: Scalar,
    pub kernel_id: KernelId,
    pub payment_confirmation: Option<Signature>,
}

/// A fully signed kernel plus the offset that balances it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedKernel {
    pub kernel: TxKernel,
    pub offset: Scalar,
}

pub enum Reply {
    NonceSlot(u64),
    Nonce(CompressedRistretto),
    PublicKeys(Vec<CompressedRistretto>),
    Outputs(Vec<Output>),
    Sender(SenderSignature),
    Receiver(ReceiverSignature),
    Split(SignedKernel),
    SbbsKdf(Arc<Kdf>),
    AssetOwnerId(CompressedRistretto),
    AssetKernel(SignedKernel),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::NonceSlot(slot) => write!(f, "NonceSlot({slot})"),
            Reply::Nonce(_) => f.write_str("Nonce"),
            Reply::PublicKeys(keys) => write!(f, "PublicKeys(len={})", keys.len()),
            Reply::Outputs(outputs) => write!(f, "Outputs(len={})", outputs.len()),
            Reply::Sender(_) => f.write_str("Sender"),
            Reply::Receiver(_) => f.write_str("Receiver"),
            Reply::Split(_) => f.write_str("Split"),
            Reply::SbbsKdf(_) => f.write_str("SbbsKdf"),
            Reply::AssetOwnerId(_) => f.write_str("AssetOwnerId"),
            Reply::AssetKernel(_) => f.write_str("AssetKernel"),
        }
    }
}

/// Completion callback. Owns whatever it needs; never borrows the caller.
pub type Handler = Box<dyn FnOnce(KeeperResult<Reply>) + Send + 'static>;

// ---------------------------------------------------------------------------
// PrivateKeyKeeper
// ---------------------------------------------------------------------------

/// Capability interface of a key keeper.
///
/// Implementations must override at least one of `invoke_sync` and
/// `invoke_async`; the defaults are defined in terms of each other.
pub trait PrivateKeyKeeper: Send + Sync {
    /// Blocking form. Defaults to `invoke_async` plus a oneshot wait.
    fn invoke_sync(&self, method: Method) -> KeeperResult<Reply> {
        let (tx, rx) = oneshot::channel();
        self.invoke_async(
            method,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        futures::executor::block_on(rx).unwrap_or(Err(KeeperError::Abandoned))
    }

    /// Callback form. Defaults to `invoke_sync` followed by the handler.
    fn invoke_async(&self, method: Method, handler: Handler) {
        handler(self.invoke_sync(method));
    }

    /// Run handlers of finished async calls on the calling thread. Returns
    /// how many ran. Keepers that complete inline have nothing to dispatch.
    fn dispatch_completions(&self) -> usize {
        0
    }

    /// Wait up to `timeout` for at least one completion, then dispatch.
    fn wait_completions(&self, _timeout: Duration) -> usize {
        self.dispatch_completions()
    }

    /// Async calls whose handlers have not run yet.
    fn outstanding(&self) -> usize {
        0
    }
}

// ---------------------------------------------------------------------------
// Typed helpers
// ---------------------------------------------------------------------------

/// Typed blocking wrappers over [`PrivateKeyKeeper::invoke_sync`].
pub trait KeyKeeperExt: PrivateKeyKeeper {
    fn allocate_nonce_slot(&self) -> KeeperResult<u64> {
        match self.invoke_sync(Method::AllocateNonceSlot)? {
            Reply::NonceSlot(slot) => Ok(slot),
            _ => Err(KeeperError::UnexpectedReply("AllocateNonceSlot")),
        }
    }

    fn generate_nonce(&self, slot: u64) -> KeeperResult<CompressedRistretto> {
        match self.invoke_sync(Method::GenerateNonce { slot })? {
            Reply::Nonce(nonce) => Ok(nonce),
            _ => Err(KeeperError::UnexpectedReply("GenerateNonce")),
        }
    }

    fn generate_public_keys(
        &self,
        ids: Vec<CoinId>,
        create_coin_key: bool,
    ) -> KeeperResult<Vec<CompressedRistretto>> {
        match self.invoke_sync(Method::GeneratePublicKeys { ids, create_coin_key })? {
            Reply::PublicKeys(keys) => Ok(keys),
            _ => Err(KeeperError::UnexpectedReply("GeneratePublicKeys")),
        }
    }

    fn generate_outputs(&self, scheme_height: Height, ids: Vec<CoinId>) -> KeeperResult<Vec<Output>> {
        match self.invoke_sync(Method::GenerateOutputs { scheme_height, ids })? {
            Reply::Outputs(outputs) => Ok(outputs),
            _ => Err(KeeperError::UnexpectedReply("GenerateOutputs")),
        }
    }

    fn sign_sender(
        &self,
        inputs: Vec<CoinId>,
        outputs: Vec<CoinId>,
        nonce_slot: u64,
        kernel: KernelParameters,
        initial: bool,
    ) -> KeeperResult<SenderSignature> {
        let method = Method::SignSender {
            inputs,
            outputs,
            nonce_slot,
            kernel,
            initial,
        };
        match self.invoke_sync(method)? {
            Reply::Sender(sig) => Ok(sig),
            _ => Err(KeeperError::UnexpectedReply("SignSender")),
        }
    }

    fn sign_receiver(
        &self,
        inputs: Vec<CoinId>,
        outputs: Vec<CoinId>,
        kernel: KernelParameters,
        wallet_id_key: Option<u64>,
    ) -> KeeperResult<ReceiverSignature> {
        let method = Method::SignReceiver {
            inputs,
            outputs,
            kernel,
            wallet_id_key,
        };
        match self.invoke_sync(method)? {
            Reply::Receiver(sig) => Ok(sig),
            _ => Err(KeeperError::UnexpectedReply("SignReceiver")),
        }
    }

    fn sign_split(
        &self,
        inputs: Vec<CoinId>,
        outputs: Vec<CoinId>,
        kernel: KernelParameters,
    ) -> KeeperResult<SignedKernel> {
        match self.invoke_sync(Method::SignSplit { inputs, outputs, kernel })? {
            Reply::Split(signed) => Ok(signed),
            _ => Err(KeeperError::UnexpectedReply("SignSplit")),
        }
    }

    fn sbbs_kdf(&self) -> KeeperResult<Arc<Kdf>> {
        match self.invoke_sync(Method::GetSbbsKdf)? {
            Reply::SbbsKdf(kdf) => Ok(kdf),
            _ => Err(KeeperError::UnexpectedReply("GetSbbsKdf")),
        }
    }

    fn asset_owner_id(&self, owner_idx: u64) -> KeeperResult<CompressedRistretto> {
        match self.invoke_sync(Method::GetAssetOwnerId { owner_idx })? {
            Reply::AssetOwnerId(owner) => Ok(owner),
            _ => Err(KeeperError::UnexpectedReply("GetAssetOwnerId")),
        }
    }

    fn sign_asset_kernel(
        &self,
        inputs: Vec<CoinId>,
        outputs: Vec<CoinId>,
        fee: Amount,
        owner_idx: u64,
        params: AssetKernelParameters,
    ) -> KeeperResult<SignedKernel> {
        let method = Method::SignAssetKernel {
            inputs,
            outputs,
            fee,
            owner_idx,
            params,
        };
        match self.invoke_sync(method)? {
            Reply::AssetKernel(signed) => Ok(signed),
            _ => Err(KeeperError::UnexpectedReply("SignAssetKernel")),
        }
    }
}

impl<T: PrivateKeyKeeper + ?Sized> KeyKeeperExt for T {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
