use crate::{
    asset::Ether,
    engine::Utxo,
    escrow::EthereumHtlc,
    ethereum,
    htlc::{BitcoinHtlc, HtlcParams},
    Error, Secret, SecretHash, Timestamp,
};
use bitcoin::{Address, Txid};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwapId(Uuid);

impl SwapId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, uuid::Error> {
        Ok(SwapId(Uuid::from_slice(bytes)?))
    }
}

impl Default for SwapId {
    fn default() -> Self {
        SwapId(Uuid::new_v4())
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SwapId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SwapId(Uuid::from_str(s)?))
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    Initiated,
    EthEscrowCreated,
    AwaitingBtcFunding,
    ParticipantFunded,
    Completed,
    Refunded,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Refunded)
    }

    /// Moves along the swap lifecycle, rejecting every edge that is not part
    /// of it.
    pub fn transition(self, to: Status) -> Result<Status, Error> {
        use Status::*;

        match (self, to) {
            (Initiated, EthEscrowCreated)
            | (EthEscrowCreated, AwaitingBtcFunding)
            | (AwaitingBtcFunding, ParticipantFunded)
            | (ParticipantFunded, Completed)
            | (EthEscrowCreated, Refunded)
            | (AwaitingBtcFunding, Refunded)
            | (ParticipantFunded, Refunded) => Ok(to),
            (from, to) => Err(Error::InvalidTransition { from, to }),
        }
    }
}

/// The Bitcoin half of a swap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BitcoinLeg {
    pub params: HtlcParams,
    pub htlc: BitcoinHtlc,
    /// Satoshis the counterparty agreed to lock in a single HTLC output.
    pub amount_sats: u64,
    /// Where the claimed bitcoin go unless told otherwise.
    pub claim_address: Option<Address>,
    pub funded: bool,
    pub funding_txid: Option<Txid>,
    pub funding_utxo: Option<Utxo>,
    pub claim_txid: Option<Txid>,
    pub refund_txid: Option<Txid>,
}

impl BitcoinLeg {
    pub fn new(params: HtlcParams, htlc: BitcoinHtlc, amount_sats: u64) -> Self {
        Self {
            params,
            htlc,
            amount_sats,
            claim_address: None,
            funded: false,
            funding_txid: None,
            funding_utxo: None,
            claim_txid: None,
            refund_txid: None,
        }
    }

    pub fn funded_amount(&self) -> Option<u64> {
        self.funding_utxo.as_ref().map(|utxo| utxo.value)
    }

    pub fn is_spent(&self) -> bool {
        self.claim_txid.is_some() || self.refund_txid.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AtomicSwapState {
    pub id: SwapId,
    pub status: Status,
    pub secret_hash: SecretHash,
    /// Only set once the secret is public on the Bitcoin chain.
    pub secret: Option<Secret>,
    /// Deadline of the Bitcoin claim path.
    pub timelock: Timestamp,
    pub eth_timelock: Timestamp,
    pub eth_htlc: Option<EthereumHtlc>,
    pub btc_htlc: Option<BitcoinLeg>,
    pub amount: Ether,
    pub participant_address: ethereum::Address,
    /// Why this swap needs a human to look at it, if it does.
    pub manual_reconciliation: Option<String>,
    pub eth_withdraw_tx: Option<ethereum::Hash>,
    pub eth_refund_tx: Option<ethereum::Hash>,
}

impl AtomicSwapState {
    pub fn transition(&mut self, to: Status) -> Result<(), Error> {
        self.status = self.status.transition(to)?;

        Ok(())
    }

    pub fn is_funded(&self) -> bool {
        self.btc_htlc.as_ref().map(|leg| leg.funded).unwrap_or(false)
    }

    pub fn flag_for_reconciliation(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(swap_id = %self.id, "swap needs manual reconciliation: {}", reason);
        self.manual_reconciliation = Some(reason);
    }

    pub fn needs_reconciliation(&self) -> bool {
        self.manual_reconciliation.is_some()
    }

    pub fn btc_address(&self) -> Option<&Address> {
        self.btc_htlc.as_ref().map(|leg| &leg.htlc.address)
    }
}

/// Progress of an initiation, in the order the stages happen.
#[derive(Clone, Debug, PartialEq)]
pub enum SwapEvent {
    SecretCommitted {
        swap_id: SwapId,
        secret_hash: SecretHash,
    },
    EthereumEscrowCreated {
        swap_id: SwapId,
        htlc: EthereumHtlc,
    },
    BitcoinHtlcDerived {
        swap_id: SwapId,
        address: Address,
        timelock: Timestamp,
    },
    AwaitingBitcoinFunding {
        swap_id: SwapId,
    },
    Failed {
        swap_id: SwapId,
        reason: String,
    },
}

#[cfg(test)]
mod arbitrary {
    use super::*;
    use quickcheck::{Arbitrary, Gen};

    impl Arbitrary for SwapId {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            let mut bytes = [0u8; 16];
            for byte in &mut bytes {
                *byte = u8::arbitrary(g);
            }
            let uuid = Uuid::from_bytes(bytes);
            SwapId(uuid)
        }
    }

    impl Arbitrary for Status {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            use Status::*;

            match u8::arbitrary(g) % 6 {
                0 => Initiated,
                1 => EthEscrowCreated,
                2 => AwaitingBtcFunding,
                3 => ParticipantFunded,
                4 => Completed,
                _ => Refunded,
            }
        }
    }
}
