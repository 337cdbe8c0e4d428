// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Umbra Wallet Core
//!
//! Signing core of a Mimblewimble-style wallet. Two parties build a
//! confidential transaction together without ever revealing their blinding
//! factors to each other: amounts hide behind Pedersen commitments, the
//! kernel carries a two-party Schnorr signature, and every secret stays
//! inside a key keeper.
//!
//! ## Architecture
//!
//! - **crypto**: Ristretto commitments, range proofs, Schnorr, hashing, KDF, sealing.
//! - **keykeeper**: The only code that touches secrets. Sync, async and threaded.
//! - **transaction**: Parameter bags, kernels, the builder and the negotiation.
//! - **storage**: Coins, addresses, bags and named variables on sled.
//! - **gateway**: Seams to the chain and the peer channel.
//! - **wallet**: Routes user requests, peer bags, chain events and keeper replies.
//! - **loopback**: In-process chain and message bus for tests and demos.
//! - **config**: Protocol constants and per-wallet tunables.
//!
//! ## Ground rules
//!
//! 1. Secrets never leave the keeper. Everything else sees public points.
//! 2. A nonce slot signs one kernel, once. The pool is persisted before the
//!    signature is released.
//! 3. Negotiation progress lives in the parameter bag. Kill the process at
//!    any point and the wallet picks up where it stopped.

pub mod config;
pub mod crypto;
pub mod gateway;
pub mod keykeeper;
pub mod loopback;
pub mod storage;
pub mod transaction;
pub mod wallet;

pub use wallet::{Wallet, WalletError, WalletEvent, WalletResult};
