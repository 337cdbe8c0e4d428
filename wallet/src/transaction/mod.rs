//! # Transaction Module
//!
//! Everything between "Alice wants to pay Bob" and a kernel on chain.
//!
//! ## Architecture
//!
//! ```text
//! types.rs         Identifiers, statuses, failure reasons
//! parameters.rs    The parameter bag and its wire format
//! kernel.rs        Kernels and the message both parties sign
//! tx.rs            The assembled transaction
//! verification.rs  Balance, signature and range-proof checks
//! payment.rs       Receiver-signed payment confirmations
//! builder.rs       Bag state → keeper requests → bag state
//! simple.rs        The negotiation state machine
//! error.rs         Errors that end a negotiation
//! ```
//!
//! ## Lifecycle
//!
//! 1. **Create**: the wallet seeds a bag with amount, fee, peer and heights.
//! 2. **Negotiate**: [`SimpleTransaction`] exchanges bags with the peer and
//!    drives the key keeper through a [`TxBuilder`].
//! 3. **Register**: the sender verifies the joined transaction and hands it
//!    to the chain gateway.
//! 4. **Confirm**: both sides wait for the kernel proof, then settle coins.
//!
//! Failure is a status, not a state: a failed negotiation keeps the state it
//! failed in and records a [`TxFailureReason`].

pub mod builder;
pub mod error;
pub mod kernel;
pub mod parameters;
pub mod payment;
pub mod simple;
pub mod tx;
pub mod types;
pub mod verification;

pub use builder::{select_coins, KeeperCall, TxBuilder, TxContext};
pub use error::TxError;
pub use kernel::{AssetEmission, KernelParameters, TxKernel};
pub use parameters::{ParameterError, ParameterId, SetTxParameter, TxParameters};
pub use payment::PaymentProof;
pub use simple::SimpleTransaction;
pub use tx::{Input, Output, Transaction};
pub use types::{
    Amount, AssetId, CoinId, Height, KernelId, NegotiationState, RegistrationStatus, TxFailureReason, TxId, TxStatus,
    TxType, WalletId,
};
pub use verification::{verify_transaction, TransactionError, ValidationContext};
