// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Umbra Driver
//!
//! Entry point for the `umbra` binary. Parses CLI arguments, initializes
//! logging, and runs one scenario against the in-process chain:
//!
//! - `transfer`: two wallets negotiate a payment until it is proven
//! - `self-transfer`: one wallet splits its funds into new outputs
//! - `keeper-stress`: blocking and async owners share one threaded keeper
//!
//! Reports are printed to stdout as JSON.

mod cli;
mod logging;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};

use umbra_wallet::config::WalletConfig;
use umbra_wallet::keykeeper::{
    KeeperError, KeyKeeperExt, LocalKeyKeeper, Method, PrivateKeyKeeper, Reply, ThreadedKeyKeeper,
};
use umbra_wallet::loopback::Simulation;
use umbra_wallet::storage::{VariablesDb, WalletDb};
use umbra_wallet::transaction::types::NATIVE_ASSET;
use umbra_wallet::transaction::{KernelId, ParameterId, TxId, TxStatus, WalletId};

use cli::{Commands, SelfTransferArgs, StressArgs, TransferArgs, UmbraCli, WalletArgs};

/// Height the demo coinbase coins are mined at.
const COINBASE_HEIGHT: u64 = 1;

/// Blocks mined after registration before giving up on a proof.
const MAX_CONFIRMATION_BLOCKS: usize = 3;

/// How long the async owner waits for the keeper worker.
const KEEPER_STALL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = UmbraCli::parse();
    logging::init_logging("umbra=info,umbra_wallet=info", cli.log_format.into());

    match cli.command {
        Commands::Transfer(args) => {
            let report = tokio::task::spawn_blocking(move || transfer(args)).await??;
            print_report(&report)
        }
        Commands::SelfTransfer(args) => {
            let report = tokio::task::spawn_blocking(move || self_transfer(args)).await??;
            print_report(&report)
        }
        Commands::KeeperStress(args) => {
            let report = keeper_stress(args).await?;
            print_report(&report)
        }
    }
}

fn print_report<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Wallet plumbing
// ---------------------------------------------------------------------------

fn open_db(data_dir: Option<&Path>, name: &str) -> Result<Arc<WalletDb>> {
    let db = match data_dir {
        Some(dir) => {
            let path = dir.join(name);
            std::fs::create_dir_all(&path)
                .with_context(|| format!("failed to create wallet directory: {}", path.display()))?;
            WalletDb::open(&path).with_context(|| format!("failed to open wallet at {}", path.display()))?
        }
        None => WalletDb::open_temporary().context("failed to open temporary wallet")?,
    };
    Ok(Arc::new(db))
}

/// Unseal the wallet's master seed, creating one on first use.
fn open_keeper(db: &Arc<WalletDb>, password: &str) -> Result<Arc<LocalKeyKeeper>> {
    let vars: Arc<dyn VariablesDb> = db.clone();
    let keeper = if LocalKeyKeeper::has_seed(&*vars)? {
        LocalKeyKeeper::open(vars, password.as_bytes()).context("failed to unseal the master seed")?
    } else {
        LocalKeyKeeper::create(vars, password.as_bytes())?
    };
    Ok(Arc::new(keeper))
}

fn keeper_for(db: &Arc<WalletDb>, args: &WalletArgs) -> Result<Arc<dyn PrivateKeyKeeper>> {
    let local = open_keeper(db, &args.password)?;
    if args.threaded {
        Ok(Arc::new(ThreadedKeyKeeper::new(local)?))
    } else {
        Ok(local)
    }
}

/// Add a funded wallet to `sim`; returns its index and a fresh address.
fn funded_wallet(
    sim: &mut Simulation,
    args: &WalletArgs,
    name: &str,
    funds: u64,
) -> Result<(usize, WalletId)> {
    let db = open_db(args.data_dir.as_deref(), name)?;
    let keeper = keeper_for(&db, args)?;
    let index = sim.add_wallet(db, keeper, WalletConfig::default())?;

    let wallet = sim.wallet(index);
    let address = wallet.create_address(name)?.wallet_id;
    if funds > 0 {
        wallet.add_coinbase(funds, COINBASE_HEIGHT)?;
    }
    tracing::info!(wallet = name, %address, funds, "wallet ready");
    Ok((index, address))
}

/// Mine until the transaction settles on `index`, or give up.
fn confirm(sim: &mut Simulation, index: usize, tx_id: &TxId) -> Result<Settled> {
    sim.run_until_idle();
    for _ in 0..MAX_CONFIRMATION_BLOCKS {
        let tx = sim
            .wallet(index)
            .transaction(tx_id)
            .with_context(|| format!("transaction {tx_id} disappeared"))?;
        if tx.is_terminal() {
            break;
        }
        sim.mine(1);
    }

    let tx = sim
        .wallet(index)
        .transaction(tx_id)
        .with_context(|| format!("transaction {tx_id} disappeared"))?;
    if tx.status() != TxStatus::Completed {
        match tx.failure_reason() {
            Some(reason) => bail!("transaction {tx_id} failed: {reason}"),
            None => bail!("transaction {tx_id} did not complete (status {})", tx.status()),
        }
    }

    let kernel_id: KernelId = tx.params().require(ParameterId::KERNEL_ID)?;
    let proof_height: u64 = tx.params().require(ParameterId::KERNEL_PROOF_HEIGHT)?;
    Ok(Settled {
        tx_id: tx_id.to_string(),
        kernel_id: kernel_id.to_string(),
        proof_height,
    })
}

#[derive(Debug, Serialize)]
struct Settled {
    tx_id: String,
    kernel_id: String,
    proof_height: u64,
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct TransferReport {
    #[serde(flatten)]
    settled: Settled,
    amount: u64,
    fee: u64,
    sender_available: u64,
    receiver_available: u64,
    messages: usize,
    payment_proof: String,
}

fn transfer(args: TransferArgs) -> Result<TransferReport> {
    let funds = args
        .amount
        .checked_add(args.fee)
        .context("amount plus fee overflows")?;

    let mut sim = Simulation::new(args.wallet.start_height);
    let (sender, from) = funded_wallet(&mut sim, &args.wallet, "sender", funds)?;
    let (receiver, to) = funded_wallet(&mut sim, &args.wallet, "receiver", 0)?;

    let tx_id = sim.wallet_mut(sender).send(from, to, args.amount, args.fee)?;
    tracing::info!(%tx_id, amount = args.amount, fee = args.fee, "transfer started");
    let settled = confirm(&mut sim, sender, &tx_id)?;
    let receiver_settled = confirm(&mut sim, receiver, &tx_id)?;
    if receiver_settled.kernel_id != settled.kernel_id {
        bail!("sender and receiver disagree on the kernel");
    }

    let proof = sim.wallet(sender).payment_proof(&tx_id)?;
    if !proof.is_valid() {
        bail!("payment proof does not verify");
    }

    Ok(TransferReport {
        settled,
        amount: args.amount,
        fee: args.fee,
        sender_available: sim.wallet(sender).available(NATIVE_ASSET)?,
        receiver_available: sim.wallet(receiver).available(NATIVE_ASSET)?,
        messages: sim.network.sent_count(),
        payment_proof: proof.to_string(),
    })
}

#[derive(Debug, Serialize)]
struct SelfTransferReport {
    #[serde(flatten)]
    settled: Settled,
    outputs: Vec<u64>,
    fee: u64,
    available: u64,
    messages: usize,
}

fn self_transfer(args: SelfTransferArgs) -> Result<SelfTransferReport> {
    let funds = args
        .amounts
        .iter()
        .try_fold(args.fee, |acc, amount| acc.checked_add(*amount))
        .context("amounts plus fee overflow")?;

    let mut sim = Simulation::new(args.wallet.start_height);
    let (index, address) = funded_wallet(&mut sim, &args.wallet, "wallet", funds)?;

    let tx_id = sim
        .wallet_mut(index)
        .split(address, args.amounts.clone(), args.fee)?;
    tracing::info!(%tx_id, outputs = args.amounts.len(), "split started");
    let settled = confirm(&mut sim, index, &tx_id)?;

    Ok(SelfTransferReport {
        settled,
        outputs: args.amounts,
        fee: args.fee,
        available: sim.wallet(index).available(NATIVE_ASSET)?,
        messages: sim.network.sent_count(),
    })
}

#[derive(Debug, Serialize)]
struct StressReport {
    requested: usize,
    unique: usize,
    failed: usize,
    elapsed_ms: u128,
}

/// Blocking owners on their own threads plus one async owner on this task,
/// all sharing a single worker. Every slot must come back unique.
async fn keeper_stress(args: StressArgs) -> Result<StressReport> {
    let db = open_db(args.wallet.data_dir.as_deref(), "stress")?;
    let local = open_keeper(&db, &args.wallet.password)?;
    let notify = Arc::new(Notify::new());
    let keeper = Arc::new(ThreadedKeyKeeper::with_notifier(local, Arc::clone(&notify))?);
    let started = Instant::now();

    let blocking: Vec<_> = (0..args.sync_owners)
        .map(|_| {
            let keeper = Arc::clone(&keeper);
            let calls = args.calls;
            tokio::task::spawn_blocking(move || {
                (0..calls)
                    .map(|_| keeper.allocate_nonce_slot())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let (tx, mut rx) = mpsc::unbounded_channel();
    for _ in 0..args.calls {
        let tx = tx.clone();
        keeper.invoke_async(
            Method::AllocateNonceSlot,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
    }
    drop(tx);
    while keeper.outstanding() > 0 {
        tokio::time::timeout(KEEPER_STALL, notify.notified())
            .await
            .context("key keeper stalled")?;
        keeper.dispatch_completions();
    }

    let mut results = Vec::with_capacity(args.calls * (args.sync_owners + 1));
    while let Some(result) = rx.recv().await {
        results.push(result.and_then(|reply| match reply {
            Reply::NonceSlot(slot) => Ok(slot),
            _ => Err(KeeperError::UnexpectedReply("AllocateNonceSlot")),
        }));
    }
    for handle in blocking {
        results.extend(handle.await?);
    }

    let requested = results.len();
    let mut slots = HashSet::with_capacity(requested);
    let mut failed = 0;
    for result in results {
        match result {
            Ok(slot) => {
                if !slots.insert(slot) {
                    bail!("nonce slot {slot} was handed out twice");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "allocation failed");
                failed += 1;
            }
        }
    }

    Ok(StressReport {
        requested,
        unique: slots.len(),
        failed,
        elapsed_ms: started.elapsed().as_millis(),
    })
}
