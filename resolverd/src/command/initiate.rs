use crate::{
    command::{describe, ethereum_escrow},
    config::Settings,
    database::Database,
};
use anyhow::Context;
use ethbtc::{
    asset::Ether,
    coordinator::{AtomicSwapCoordinator, InitiateEthToBtc},
    engine::public_key,
    swap::SwapEvent,
    Clock, SystemClock,
};
use futures::{channel::mpsc, StreamExt};
use std::sync::Arc;
use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone)]
pub struct Initiate {
    /// Ether to lock, e.g. 0.5
    #[structopt(long)]
    pub amount: Ether,
    /// Satoshis the resolver has agreed to lock in the Bitcoin HTLC
    #[structopt(long = "btc-amount")]
    pub btc_amount: u64,
    /// Seconds until the ether can be refunded
    #[structopt(long = "expires-in", default_value = "7200")]
    pub expires_in: u32,
    /// Ethereum address of the resolver, it receives the ether
    #[structopt(long)]
    pub participant: String,
    /// Where to receive the bitcoin
    #[structopt(long = "btc-address")]
    pub btc_address: String,
    /// Key of the resolver in the timelock branch, defaults to the
    /// configured resolver key
    #[structopt(long = "resolver-pubkey")]
    pub resolver_pubkey: Option<bitcoin::PublicKey>,
}

pub async fn initiate(settings: &Settings, db: &Database, args: Initiate) -> anyhow::Result<()> {
    let claim_key = settings
        .bitcoin
        .private_key
        .context("bitcoin.private_key is not configured")?;
    let resolver_pubkey = match args.resolver_pubkey {
        Some(pubkey) => pubkey,
        None => settings
            .resolver
            .private_key
            .map(|key| public_key(&key))
            .context("pass --resolver-pubkey or configure resolver.private_key")?,
    };

    let escrow = ethereum_escrow(settings).await?;
    let vault = db.load_vault()?;
    let clock = Arc::new(SystemClock);
    let coordinator = AtomicSwapCoordinator::new(
        escrow,
        vault.clone(),
        clock.clone(),
        settings.bitcoin.network,
        settings.resolver.safety_margin,
    );

    let params = InitiateEthToBtc {
        amount: args.amount,
        btc_amount: args.btc_amount,
        eth_timelock: clock.now().plus(args.expires_in),
        participant_address: args.participant,
        btc_recipient_address: args.btc_address,
        btc_recipient_pubkey: public_key(&claim_key),
        btc_sender_pubkey: resolver_pubkey,
    };

    let (sender, mut receiver) = mpsc::unbounded();
    let result = coordinator.initiate_eth_to_btc(params, &sender).await;
    drop(sender);
    while let Some(event) = receiver.next().await {
        log_event(&event);
    }

    let state = result?;
    db.save_swap(&state).await?;
    db.sync_vault(&vault).await?;

    println!("{}", describe(&state));

    Ok(())
}

fn log_event(event: &SwapEvent) {
    match event {
        SwapEvent::SecretCommitted {
            swap_id,
            secret_hash,
        } => tracing::info!(%swap_id, %secret_hash, "secret committed"),
        SwapEvent::EthereumEscrowCreated { swap_id, htlc } => tracing::info!(
            %swap_id,
            htlc_id = %htlc.htlc_id,
            tx_hash = %htlc.tx_hash,
            "ether locked in escrow"
        ),
        SwapEvent::BitcoinHtlcDerived {
            swap_id,
            address,
            timelock,
        } => tracing::info!(%swap_id, %address, %timelock, "bitcoin htlc derived"),
        SwapEvent::AwaitingBitcoinFunding { swap_id } => {
            tracing::info!(%swap_id, "waiting for the resolver to fund the bitcoin htlc")
        }
        SwapEvent::Failed { swap_id, reason } => {
            tracing::error!(%swap_id, "initiation failed: {}", reason)
        }
    }
}
