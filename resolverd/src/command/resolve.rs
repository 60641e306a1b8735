use crate::{command::bitcoin_engine, config::Settings, database::Database};
use anyhow::Context;
use ethbtc::{
    resolver::ResolverService,
    swap::{AtomicSwapState, Status},
};
use futures::{channel::mpsc, StreamExt};
use std::sync::Arc;

/// Funds the swaps waiting in the database until every one of them is funded
/// or flagged, or the process is interrupted.
///
/// The database stays locked while this runs. Swaps initiated afterwards are
/// picked up by the next `resolve`, completions and refunds run once it has
/// returned.
pub async fn resolve(settings: &Settings, db: &Database) -> anyhow::Result<()> {
    let key = settings
        .resolver
        .private_key
        .context("resolver.private_key is not configured")?;
    let engine = bitcoin_engine(settings)?;

    let waiting = db.waiting_for_funding()?;
    if waiting.is_empty() {
        tracing::info!("no swap is waiting for bitcoin funding");
        return Ok(());
    }

    let (updates, receiver) = mpsc::unbounded();
    let resolver = Arc::new(
        ResolverService::new(engine, key, settings.resolver.resolver_config())?
            .with_updates(updates),
    );
    tracing::info!(
        funder = settings.resolver.funder,
        "resolver wallet is {}",
        resolver.funder_address()
    );

    for swap in waiting {
        tracing::info!(swap_id = %swap.id, "watching swap");
        let _ = resolver.register_swap(swap);
    }
    resolver.start();

    let result = run(&resolver, db, receiver).await;
    resolver.stop().await;

    result
}

async fn run(
    resolver: &ResolverService,
    db: &Database,
    mut receiver: mpsc::UnboundedReceiver<AtomicSwapState>,
) -> anyhow::Result<()> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(state) = receiver.next() => {
                db.save_swap(&state).await?;
                if state.status != Status::AwaitingBtcFunding || state.needs_reconciliation() {
                    let _ = resolver.deregister_swap(&state.id);
                }
                if resolver.swaps().is_empty() {
                    tracing::info!("no swap left to fund");
                    return Ok(());
                }
            }
            result = &mut shutdown => {
                result.context("failed to listen for ctrl-c")?;
                tracing::info!("shutting down");
                return Ok(());
            }
        }
    }
}
