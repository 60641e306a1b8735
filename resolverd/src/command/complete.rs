use crate::{
    command::{bitcoin_engine, ethereum_escrow},
    config::Settings,
    database::Database,
};
use anyhow::Context;
use ethbtc::{
    completion::{CompleteSwap, SwapCompletionService},
    SwapId, SystemClock,
};
use std::sync::Arc;
use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone)]
pub struct Complete {
    #[structopt(long = "swap-id")]
    pub swap_id: SwapId,
    /// Where to send the bitcoin, defaults to the address given at initiation
    #[structopt(long)]
    pub address: Option<bitcoin::Address>,
}

pub async fn complete(settings: &Settings, db: &Database, args: Complete) -> anyhow::Result<()> {
    let recipient_key = settings
        .bitcoin
        .private_key
        .context("bitcoin.private_key is not configured")?;
    let state = db.load_swap(&args.swap_id)?;
    let recipient_address = match args.address {
        Some(address) => address,
        None => state
            .btc_htlc
            .as_ref()
            .and_then(|leg| leg.claim_address.clone())
            .context("no claim address known for this swap, pass --address")?,
    };

    let vault = db.load_vault()?;
    let completion = SwapCompletionService::new(
        bitcoin_engine(settings)?,
        ethereum_escrow(settings).await?,
        vault.clone(),
        Arc::new(SystemClock),
    );

    let handle = Arc::new(tokio::sync::Mutex::new(state));
    let result = completion
        .complete_swap(&handle, CompleteSwap {
            recipient_address,
            recipient_key,
        })
        .await;

    // A failed withdrawal leaves the secret public, that has to be stored.
    db.save_swap(&*handle.lock().await).await?;
    db.sync_vault(&vault).await?;

    let completed = result?;
    println!(
        "swap {} completed: bitcoin claimed in {}, ether withdrawn in {}",
        args.swap_id, completed.bitcoin_txid, completed.ethereum_tx
    );

    Ok(())
}
