use std::path::PathBuf;
use structopt::StructOpt;

mod complete;
mod initiate;
mod refund;
mod resolve;
mod status;

use crate::{
    config::{File, Settings},
    ethereum::{geth, Web3Escrow},
};
use anyhow::Context;
use ethbtc::{engine::BitcoinTransactionEngine, indexer::Esplora, ledger, swap::AtomicSwapState};
use std::{sync::Arc, time::Duration};

pub use complete::{complete, Complete};
pub use initiate::{initiate, Initiate};
pub use refund::{refund, Refund};
pub use resolve::resolve;
pub use status::status;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_BUDGET: Duration = Duration::from_secs(30);

#[derive(StructOpt, Debug)]
pub struct Options {
    /// Path to configuration file
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    pub config_file: Option<PathBuf>,

    /// Which Bitcoin network to use
    #[structopt(short = "n", long = "network")]
    pub network: Option<ledger::Bitcoin>,

    /// Commands available
    #[structopt(subcommand)]
    pub cmd: Command,
}

impl Options {
    pub fn from_args() -> Self {
        StructOpt::from_args()
    }
}

#[derive(StructOpt, Debug, Clone)]
pub enum Command {
    /// Lock ether and wait for the resolver to fund the Bitcoin HTLC
    Initiate(Initiate),
    /// Fund the Bitcoin HTLC of every waiting swap, exits once all are funded
    Resolve,
    /// Claim the bitcoin and withdraw the ether with the revealed secret
    Complete(Complete),
    /// Take back the funds of a swap whose timelocks expired
    Refund(Refund),
    /// Print all known swaps
    Status,
    /// Dump the current configuration
    DumpConfig,
}

pub fn dump_config(settings: Settings) -> anyhow::Result<()> {
    let file = File::from(settings);
    let serialized = toml::to_string(&file)?;
    println!("{}", serialized);
    Ok(())
}

pub fn bitcoin_engine(settings: &Settings) -> anyhow::Result<Arc<BitcoinTransactionEngine>> {
    let indexer = Esplora::new(
        settings.bitcoin.indexer_url.clone(),
        REQUEST_TIMEOUT,
        RETRY_BUDGET,
    )
    .context("could not initialise the chain indexer client")?;

    Ok(Arc::new(BitcoinTransactionEngine::new(
        Arc::new(indexer),
        settings.bitcoin.network,
        settings.bitcoin.fee_rate,
    )))
}

pub async fn ethereum_escrow(settings: &Settings) -> anyhow::Result<Arc<Web3Escrow>> {
    let contract = settings
        .ethereum
        .escrow_contract
        .context("ethereum.escrow_contract is not configured")?;
    let key = settings
        .ethereum
        .private_key
        .context("ethereum.private_key is not configured")?;

    let client = geth::Client::new(settings.ethereum.node_url.clone(), REQUEST_TIMEOUT)?;
    let escrow = Web3Escrow::connect(
        client,
        contract,
        settings.ethereum.chain_id,
        &key,
        RETRY_BUDGET,
    )
    .await
    .context("could not connect to the ethereum escrow")?;
    tracing::info!("using escrow {} from account {}", contract, escrow.account());

    Ok(Arc::new(escrow))
}

/// The line printed for a swap in command output.
fn describe(swap: &AtomicSwapState) -> String {
    let htlc = swap
        .btc_address()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_owned());
    let btc_amount = swap
        .btc_htlc
        .as_ref()
        .map(|leg| leg.amount_sats.to_string())
        .unwrap_or_else(|| "-".to_owned());

    format!(
        "{} {} amount={} btc_amount={} btc_htlc={} timelock={} eth_timelock={}",
        swap.id, swap.status, swap.amount, btc_amount, htlc, swap.timelock, swap.eth_timelock
    )
}
