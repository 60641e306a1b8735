//! The market maker side: a background task that funds the Bitcoin leg of
//! every swap it knows about.

use crate::{
    engine::{p2wpkh_address, public_key, BitcoinTransactionEngine, Utxo},
    htlc::verify_htlc,
    swap::{AtomicSwapState, Status},
    Clock, Error, SwapId, SystemClock,
};
use bitcoin::{secp256k1::SecretKey, Address, OutPoint, Txid};
use futures::channel::mpsc;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing_futures::Instrument;

/// Exclusive access to one swap.
///
/// Whoever holds the lock is the only one allowed to spend from or to the
/// swap's HTLCs.
pub type SwapHandle = Arc<tokio::sync::Mutex<AtomicSwapState>>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolverConfig {
    /// The most this funder locks in the HTLC of a single swap.
    pub funding_amount_sats: u64,
    pub poll_interval: Duration,
    /// Only a funder sends coins to the HTLCs, everybody else just watches.
    pub funder: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            funding_amount_sats: 100_000,
            poll_interval: Duration::from_secs(10),
            funder: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResolverStatus {
    pub running: bool,
    pub active_swaps: usize,
    pub funder_address: String,
}

/// What a tick did to a swap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Progress {
    /// Somebody else holds the swap's lock.
    Busy,
    Unchanged,
    /// Funding waits for the wallet to receive coins.
    WaitingForCoins { needed: u64, available: u64 },
    /// The HTLC was funded by somebody else.
    FundingObserved,
    Funded(Txid),
    Flagged,
}

pub struct ResolverService {
    engine: Arc<BitcoinTransactionEngine>,
    clock: Arc<dyn Clock>,
    funder_key: SecretKey,
    funder_address: Address,
    config: ResolverConfig,
    swaps: RwLock<HashMap<SwapId, SwapHandle>>,
    running: AtomicBool,
    shutdown: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
    updates: Option<mpsc::UnboundedSender<AtomicSwapState>>,
}

impl fmt::Debug for ResolverService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverService")
            .field("funder_address", &self.funder_address)
            .field("config", &self.config)
            .field("running", &self.running)
            .finish()
    }
}

impl ResolverService {
    pub fn new(
        engine: Arc<BitcoinTransactionEngine>,
        funder_key: SecretKey,
        config: ResolverConfig,
    ) -> Result<Self, Error> {
        let funder_address = p2wpkh_address(&funder_key, engine.network())?;

        Ok(Self {
            engine,
            clock: Arc::new(SystemClock),
            funder_key,
            funder_address,
            config,
            swaps: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            task: Mutex::new(None),
            updates: None,
        })
    }

    /// Every swap the resolver changed is sent here after the tick that
    /// changed it.
    pub fn with_updates(self, updates: mpsc::UnboundedSender<AtomicSwapState>) -> Self {
        Self {
            updates: Some(updates),
            ..self
        }
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self { clock, ..self }
    }

    pub fn funder_address(&self) -> &Address {
        &self.funder_address
    }

    pub fn register_swap(&self, state: AtomicSwapState) -> SwapHandle {
        let id = state.id;
        let handle = Arc::new(tokio::sync::Mutex::new(state));

        self.swaps
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, Arc::clone(&handle));
        tracing::info!(swap_id = %id, "registered swap");

        handle
    }

    pub fn deregister_swap(&self, id: &SwapId) -> Option<SwapHandle> {
        self.swaps
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id)
    }

    pub fn swap(&self, id: &SwapId) -> Result<SwapHandle, Error> {
        self.swaps
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
            .ok_or(Error::UnknownSwap(*id))
    }

    pub fn swaps(&self) -> Vec<(SwapId, SwapHandle)> {
        self.swaps
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(id, handle)| (*id, Arc::clone(handle)))
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ResolverStatus {
        ResolverStatus {
            running: self.is_running(),
            active_swaps: self
                .swaps
                .read()
                .map(|swaps| swaps.len())
                .unwrap_or_default(),
            funder_address: self.funder_address.to_string(),
        }
    }

    /// Spawns the polling task. Starting a running resolver does nothing.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let resolver = Arc::clone(self);
        let poll = async move {
            let mut interval = tokio::time::interval(resolver.config.poll_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {},
                    _ = resolver.shutdown.notified() => {},
                }
                if !resolver.is_running() {
                    break;
                }

                resolver.tick().await;
            }

            tracing::info!("resolver stopped");
        };

        let handle = tokio::spawn(poll.instrument(tracing::info_span!("resolver")));
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        tracing::info!(
            funder_address = %self.funder_address,
            "resolver started, polling every {}s",
            self.config.poll_interval.as_secs()
        );
    }

    /// Stops polling after the current tick. An ongoing tick runs to
    /// completion, broadcasts are never cut short.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();

        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("resolver task ended abnormally: {}", e);
            }
        }
    }

    /// Visits every registered swap once.
    pub async fn tick(&self) -> Vec<(SwapId, Progress)> {
        let mut report = Vec::new();

        for (id, handle) in self.swaps() {
            let mut state = match handle.try_lock() {
                Ok(state) => state,
                Err(_) => {
                    tracing::debug!(swap_id = %id, "swap is busy, skipping");
                    report.push((id, Progress::Busy));
                    continue;
                }
            };

            let before = state.clone();
            let progress = match self
                .process(&mut state)
                .instrument(tracing::info_span!("swap", swap_id = %id))
                .await
            {
                Ok(progress) => progress,
                Err(e) => {
                    tracing::warn!(swap_id = %id, "will retry next tick: {}", e);
                    Progress::Unchanged
                }
            };

            if *state != before {
                if let Some(updates) = &self.updates {
                    let _ = updates.unbounded_send(state.clone());
                }
            }
            report.push((id, progress));
        }

        report
    }

    async fn process(&self, state: &mut AtomicSwapState) -> Result<Progress, Error> {
        if state.status != Status::AwaitingBtcFunding || state.needs_reconciliation() {
            return Ok(Progress::Unchanged);
        }

        let leg = match state.btc_htlc.as_ref() {
            Some(leg) => leg.clone(),
            None => {
                state.flag_for_reconciliation("swap awaits funding without a bitcoin htlc");
                return Ok(Progress::Flagged);
            }
        };

        if let Err(e) = verify_htlc(&leg.params, &leg.htlc) {
            state.flag_for_reconciliation(e.to_string());
            return Ok(Progress::Flagged);
        }

        let funding = self.engine.is_htlc_funded(&leg.htlc.address).await?;
        if let Some(utxo) = funding.covering(leg.amount_sats) {
            tracing::info!(
                txid = %utxo.outpoint.txid,
                "htlc already holds {} sat",
                utxo.value
            );
            mark_funded(state, utxo.clone())?;

            return Ok(Progress::FundingObserved);
        }
        if funding.funded {
            tracing::warn!(
                "htlc holds {} sat but no single output of the agreed {} sat",
                funding.amount,
                leg.amount_sats
            );
        }

        if !self.config.funder {
            return Ok(Progress::Unchanged);
        }
        if leg.params.sender_pubkey != public_key(&self.funder_key) {
            tracing::debug!("htlc refunds to somebody else, not funding");
            return Ok(Progress::Unchanged);
        }
        if leg.amount_sats > self.config.funding_amount_sats {
            tracing::warn!(
                "swap asks for {} sat, this funder locks at most {} sat",
                leg.amount_sats,
                self.config.funding_amount_sats
            );
            return Ok(Progress::Unchanged);
        }

        // Whichever of chain and wall clock is further along decides.
        let now = self.engine.chain_time().await?.max(self.clock.now());
        if now >= leg.params.timelock {
            tracing::warn!(
                timelock = %leg.params.timelock,
                "htlc is already refundable, not funding"
            );
            return Ok(Progress::Unchanged);
        }

        let wallet_utxos = self
            .engine
            .get_address_utxos(&self.funder_address)
            .await?;
        let raw = match self.engine.fund_htlc(
            &leg.htlc.address,
            leg.amount_sats,
            &wallet_utxos,
            &self.funder_key,
        ) {
            Ok(raw) => raw,
            Err(Error::InsufficientFunds { needed, available }) => {
                tracing::warn!(
                    funder_address = %self.funder_address,
                    "need {} sat to fund the htlc, wallet holds {} sat",
                    needed,
                    available
                );
                return Ok(Progress::WaitingForCoins { needed, available });
            }
            Err(e) => return Err(e),
        };

        let txid = match self.engine.broadcast(&raw.transaction).await {
            Ok(txid) => txid,
            Err(e @ Error::BroadcastRejected { .. }) => {
                state.flag_for_reconciliation(e.to_string());
                return Ok(Progress::Flagged);
            }
            Err(e) => {
                // The same coins produce the same transaction next tick.
                self.engine.release(&raw.transaction);
                return Err(e);
            }
        };

        let htlc_output = (0u32..)
            .zip(raw.transaction.output.iter())
            .find(|(_, output)| output.script_pubkey == leg.htlc.script_pubkey)
            .map(|(vout, output)| Utxo {
                outpoint: OutPoint::new(txid, vout),
                value: output.value,
                script_pubkey: output.script_pubkey.clone(),
            })
            .ok_or_else(|| Error::validation("funding transaction does not pay the htlc"))?;

        tracing::info!(%txid, "funded htlc with {} sat", htlc_output.value);
        mark_funded(state, htlc_output)?;

        Ok(Progress::Funded(txid))
    }
}

fn mark_funded(state: &mut AtomicSwapState, utxo: Utxo) -> Result<(), Error> {
    if let Some(leg) = state.btc_htlc.as_mut() {
        leg.funded = true;
        leg.funding_txid = Some(utxo.outpoint.txid);
        leg.funding_utxo = Some(utxo);
    }

    state.transition(Status::ParticipantFunded)
}
