use crate::{
    command::{bitcoin_engine, ethereum_escrow},
    config::Settings,
    database::Database,
};
use ethbtc::{
    completion::{BitcoinRefund, SwapCompletionService},
    engine::{p2wpkh_address, public_key},
    swap::AtomicSwapState,
    SwapId, SystemClock,
};
use std::sync::Arc;
use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone)]
pub struct Refund {
    #[structopt(long = "swap-id")]
    pub swap_id: SwapId,
}

pub async fn refund(settings: &Settings, db: &Database, args: Refund) -> anyhow::Result<()> {
    let state = db.load_swap(&args.swap_id)?;
    let bitcoin_refund = bitcoin_refund(settings, &state)?;
    if bitcoin_refund.is_none() {
        tracing::info!("resolver key does not own the bitcoin htlc, only refunding ether");
    }

    let vault = db.load_vault()?;
    let completion = SwapCompletionService::new(
        bitcoin_engine(settings)?,
        ethereum_escrow(settings).await?,
        vault.clone(),
        Arc::new(SystemClock),
    );

    let handle = Arc::new(tokio::sync::Mutex::new(state));
    let result = completion.refund_swap(&handle, bitcoin_refund).await;

    let state = handle.lock().await.clone();
    db.save_swap(&state).await?;
    db.sync_vault(&vault).await?;

    let refunded = result?;
    if let Some(txid) = refunded.bitcoin_txid {
        println!("bitcoin refunded in {}", txid);
    }
    if let Some(tx) = refunded.ethereum_tx {
        println!("ether refunded in {}", tx);
    }
    println!("swap {} is {}", state.id, state.status);

    Ok(())
}

/// Refunds the Bitcoin leg only with the key of its timelock branch.
fn bitcoin_refund(
    settings: &Settings,
    state: &AtomicSwapState,
) -> anyhow::Result<Option<BitcoinRefund>> {
    let key = match settings.resolver.private_key {
        Some(key) => key,
        None => return Ok(None),
    };
    let owns_htlc = state
        .btc_htlc
        .as_ref()
        .map(|leg| leg.params.sender_pubkey == public_key(&key))
        .unwrap_or(false);
    if !owns_htlc {
        return Ok(None);
    }

    Ok(Some(BitcoinRefund {
        sender_address: p2wpkh_address(&key, settings.bitcoin.network)?,
        sender_key: key,
    }))
}
