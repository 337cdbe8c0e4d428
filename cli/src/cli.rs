//! # CLI Interface
//!
//! Command-line structure for the `umbra` binary, built with `clap` derive.
//! Every scenario runs wallets against the in-process chain and bus; nothing
//! leaves the machine.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Umbra wallet core driver.
///
/// Runs transaction negotiations between local wallets and exercises the
/// key keeper.
#[derive(Parser, Debug)]
#[command(name = "umbra", about = "Umbra wallet core driver", version, propagate_version = true)]
pub struct UmbraCli {
    /// Log output format.
    #[arg(long, global = true, value_enum, env = "UMBRA_LOG_FORMAT", default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pay from one wallet to another and mine until the kernel is proven.
    Transfer(TransferArgs),
    /// Split a wallet's funds into several outputs of its own.
    SelfTransfer(SelfTransferArgs),
    /// Hammer a threaded key keeper with nonce allocations.
    KeeperStress(StressArgs),
}

/// Storage and keeper options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct WalletArgs {
    /// Directory holding the wallet databases. A temporary store is used
    /// when omitted.
    #[arg(long, short = 'd', env = "UMBRA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Password sealing the master seed.
    #[arg(long, env = "UMBRA_PASSWORD", default_value = "umbra", hide_default_value = true)]
    pub password: String,

    /// Route key keeper calls through a worker thread.
    #[arg(long)]
    pub threaded: bool,

    /// Chain height the local node starts at.
    #[arg(long, default_value_t = 133)]
    pub start_height: u64,
}

#[derive(Args, Debug)]
pub struct TransferArgs {
    #[command(flatten)]
    pub wallet: WalletArgs,

    /// Amount delivered to the receiver.
    #[arg(long, default_value_t = 1_000_000_000)]
    pub amount: u64,

    /// Transaction fee.
    #[arg(long, default_value_t = 100)]
    pub fee: u64,
}

#[derive(Args, Debug)]
pub struct SelfTransferArgs {
    #[command(flatten)]
    pub wallet: WalletArgs,

    /// Output amounts, comma separated.
    #[arg(long, value_delimiter = ',', default_values_t = vec![300_000_000u64, 200_000_000])]
    pub amounts: Vec<u64>,

    /// Transaction fee.
    #[arg(long, default_value_t = 100)]
    pub fee: u64,
}

#[derive(Args, Debug)]
pub struct StressArgs {
    #[command(flatten)]
    pub wallet: WalletArgs,

    /// Blocking callers, each on its own thread.
    #[arg(long, default_value_t = 4)]
    pub sync_owners: usize,

    /// Allocations issued per caller. The async owner issues the same.
    #[arg(long, default_value_t = 250)]
    pub calls: usize,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}
