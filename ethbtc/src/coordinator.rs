//! Initiation of an Ether to Bitcoin swap.
//!
//! The initiator commits to a secret, locks ether in the escrow under its
//! hash and derives the Bitcoin HTLC the counterparty has to fund. The
//! Bitcoin timelock is always the Ethereum timelock minus a
//! [`SafetyMargin`]: whoever reveals the secret on Bitcoin must have time
//! left to use it on Ethereum.

use crate::{
    asset::Ether,
    engine::DUST_LIMIT_SAT,
    escrow::EthereumEscrow,
    ethereum,
    htlc::{generate_htlc_address, BitcoinHtlc, HtlcParams},
    ledger,
    swap::{AtomicSwapState, BitcoinLeg, Status, SwapEvent},
    Clock, Error, SecretCommitment, SecretVault, SwapId, Timestamp,
};
use bitcoin::{util::address::Payload, Address, PublicKey};
use futures::channel::mpsc;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};
use tracing_futures::Instrument;

pub const MIN_SAFETY_MARGIN_SECS: u32 = 15 * 60;
pub const DEFAULT_SAFETY_MARGIN_SECS: u32 = 60 * 60;

/// Time between the Bitcoin and the Ethereum timelock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct SafetyMargin(u32);

impl SafetyMargin {
    pub fn new(secs: u32) -> Result<Self, Error> {
        if secs < MIN_SAFETY_MARGIN_SECS {
            return Err(Error::validation(format!(
                "safety margin of {}s is below the minimum of {}s",
                secs, MIN_SAFETY_MARGIN_SECS
            )));
        }

        Ok(Self(secs))
    }

    pub fn as_secs(self) -> u32 {
        self.0
    }
}

impl Default for SafetyMargin {
    fn default() -> Self {
        Self(DEFAULT_SAFETY_MARGIN_SECS)
    }
}

impl std::convert::TryFrom<u32> for SafetyMargin {
    type Error = Error;

    fn try_from(secs: u32) -> Result<Self, Self::Error> {
        Self::new(secs)
    }
}

impl From<SafetyMargin> for u32 {
    fn from(margin: SafetyMargin) -> Self {
        margin.0
    }
}

/// Parameters of a new swap as they arrive from the outside world.
#[derive(Clone, Debug, PartialEq)]
pub struct InitiateEthToBtc {
    pub amount: Ether,
    /// Satoshis the counterparty has agreed to lock in the Bitcoin HTLC.
    pub btc_amount: u64,
    pub eth_timelock: Timestamp,
    /// Ethereum address of the counterparty, the receiver of the escrow.
    pub participant_address: String,
    /// Where the initiator wants to receive the bitcoin.
    pub btc_recipient_address: String,
    /// Key of the initiator in the hashlock branch.
    pub btc_recipient_pubkey: PublicKey,
    /// Key of the counterparty in the timelock branch.
    pub btc_sender_pubkey: PublicKey,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedSwap {
    pub participant_address: ethereum::Address,
    pub btc_recipient_address: Address,
    pub btc_timelock: Timestamp,
}

/// Whether an address can receive coins on `network`.
///
/// Legacy testnet and regtest addresses share their prefixes, only bech32
/// tells them apart.
fn is_address_for_network(address: &Address, network: ledger::Bitcoin) -> bool {
    let expected = bitcoin::Network::from(network);
    if address.network == expected {
        return true;
    }

    let is_segwit = matches!(address.payload, Payload::WitnessProgram { .. });
    !is_segwit
        && network != ledger::Bitcoin::Mainnet
        && address.network != bitcoin::Network::Bitcoin
}

pub struct AtomicSwapCoordinator {
    escrow: Arc<dyn EthereumEscrow>,
    vault: SecretVault,
    clock: Arc<dyn Clock>,
    network: ledger::Bitcoin,
    safety_margin: SafetyMargin,
}

impl fmt::Debug for AtomicSwapCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicSwapCoordinator")
            .field("network", &self.network)
            .field("safety_margin", &self.safety_margin)
            .finish()
    }
}

impl AtomicSwapCoordinator {
    pub fn new(
        escrow: Arc<dyn EthereumEscrow>,
        vault: SecretVault,
        clock: Arc<dyn Clock>,
        network: ledger::Bitcoin,
        safety_margin: SafetyMargin,
    ) -> Self {
        Self {
            escrow,
            vault,
            clock,
            network,
            safety_margin,
        }
    }

    pub fn safety_margin(&self) -> SafetyMargin {
        self.safety_margin
    }

    pub fn validate_swap_params(&self, params: &InitiateEthToBtc) -> Result<ValidatedSwap, Error> {
        if params.amount.is_zero() {
            return Err(Error::validation("amount must be greater than zero"));
        }
        if params.btc_amount < DUST_LIMIT_SAT {
            return Err(Error::validation(format!(
                "bitcoin amount {} sat is below the dust limit of {} sat",
                params.btc_amount, DUST_LIMIT_SAT
            )));
        }

        let participant_address = ethereum::Address::from_str(&params.participant_address)
            .map_err(|e| {
                Error::validation(format!(
                    "invalid ethereum address {}: {}",
                    params.participant_address, e
                ))
            })?;

        let btc_recipient_address = Address::from_str(&params.btc_recipient_address)
            .map_err(|e| {
                Error::validation(format!(
                    "invalid bitcoin address {}: {}",
                    params.btc_recipient_address, e
                ))
            })?;
        if !is_address_for_network(&btc_recipient_address, self.network) {
            return Err(Error::validation(format!(
                "{} is not a {} address",
                btc_recipient_address, self.network
            )));
        }

        let now = self.clock.now();
        let earliest = now.plus(self.safety_margin.as_secs());
        if params.eth_timelock <= earliest {
            return Err(Error::validation(format!(
                "ethereum timelock {} must be later than {} (now plus the safety margin)",
                params.eth_timelock, earliest
            )));
        }

        let btc_timelock = params.eth_timelock.minus(self.safety_margin.as_secs());

        Ok(ValidatedSwap {
            participant_address,
            btc_recipient_address,
            btc_timelock,
        })
    }

    fn derive_bitcoin_htlc(
        &self,
        params: &InitiateEthToBtc,
        commitment: &SecretCommitment,
        btc_timelock: Timestamp,
    ) -> Result<(HtlcParams, BitcoinHtlc), Error> {
        let htlc_params = HtlcParams {
            secret_hash: commitment.hash(),
            recipient_pubkey: params.btc_recipient_pubkey,
            sender_pubkey: params.btc_sender_pubkey,
            timelock: btc_timelock,
            network: self.network,
        };
        let htlc = generate_htlc_address(&htlc_params)?;

        Ok((htlc_params, htlc))
    }

    /// Starts a swap and returns it waiting for the Bitcoin leg to be funded.
    ///
    /// Nothing survives a failure to lock the ether: the secret is forgotten
    /// and no state is returned.
    pub async fn initiate_eth_to_btc(
        &self,
        params: InitiateEthToBtc,
        events: &mpsc::UnboundedSender<SwapEvent>,
    ) -> Result<AtomicSwapState, Error> {
        let swap_id = SwapId::default();

        self.initiate(swap_id, params, events)
            .instrument(tracing::info_span!("initiate", %swap_id))
            .await
    }

    async fn initiate(
        &self,
        swap_id: SwapId,
        params: InitiateEthToBtc,
        events: &mpsc::UnboundedSender<SwapEvent>,
    ) -> Result<AtomicSwapState, Error> {
        let emit = |event: SwapEvent| {
            // A caller that stopped listening must not stop the swap.
            let _ = events.unbounded_send(event);
        };
        let fail = |e: Error| {
            tracing::error!("failed to initiate swap: {}", e);
            emit(SwapEvent::Failed {
                swap_id,
                reason: e.to_string(),
            });
            e
        };

        let validated = self.validate_swap_params(&params).map_err(fail)?;

        let commitment = SecretCommitment::generate();
        let (htlc_params, btc_htlc) = self
            .derive_bitcoin_htlc(&params, &commitment, validated.btc_timelock)
            .map_err(fail)?;

        self.vault.store(swap_id, commitment);
        emit(SwapEvent::SecretCommitted {
            swap_id,
            secret_hash: commitment.hash(),
        });

        let mut state = AtomicSwapState {
            id: swap_id,
            status: Status::Initiated,
            secret_hash: commitment.hash(),
            secret: None,
            timelock: validated.btc_timelock,
            eth_timelock: params.eth_timelock,
            eth_htlc: None,
            btc_htlc: None,
            amount: params.amount.clone(),
            participant_address: validated.participant_address,
            manual_reconciliation: None,
            eth_withdraw_tx: None,
            eth_refund_tx: None,
        };

        let eth_htlc = match self
            .escrow
            .create(
                validated.participant_address,
                commitment.hash(),
                params.eth_timelock,
                &params.amount,
            )
            .await
        {
            Ok(eth_htlc) => eth_htlc,
            Err(e) => {
                self.vault.discard(&swap_id);
                return Err(fail(e));
            }
        };

        tracing::info!(
            htlc_id = %eth_htlc.htlc_id,
            tx_hash = %eth_htlc.tx_hash,
            "locked {} in escrow",
            params.amount
        );
        state.eth_htlc = Some(eth_htlc);
        state.transition(Status::EthEscrowCreated)?;
        emit(SwapEvent::EthereumEscrowCreated {
            swap_id,
            htlc: eth_htlc,
        });

        let mut leg = BitcoinLeg::new(htlc_params, btc_htlc, params.btc_amount);
        leg.claim_address = Some(validated.btc_recipient_address);
        emit(SwapEvent::BitcoinHtlcDerived {
            swap_id,
            address: leg.htlc.address.clone(),
            timelock: validated.btc_timelock,
        });
        state.btc_htlc = Some(leg);

        state.transition(Status::AwaitingBtcFunding)?;
        emit(SwapEvent::AwaitingBitcoinFunding { swap_id });

        Ok(state)
    }
}
