use crate::{
    asset::Ether,
    ethereum::{Address, Hash},
    Error, Secret, SecretHash, Timestamp,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to ether locked in the escrow contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthereumHtlc {
    pub contract_address: Address,
    pub htlc_id: Hash,
    pub tx_hash: Hash,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowStatus {
    pub funded: bool,
    pub claimed: bool,
    pub refunded: bool,
}

impl EscrowStatus {
    /// Ether is still locked and can be withdrawn or refunded.
    pub fn is_locked(&self) -> bool {
        self.funded && !self.claimed && !self.refunded
    }
}

/// The EVM escrow contract.
///
/// Implementations sign and submit transactions with a key bound at
/// construction and only return once the transaction was mined.
#[async_trait]
pub trait EthereumEscrow: Send + Sync + fmt::Debug {
    /// Locks `amount` for `receiver` under `secret_hash` until `timelock`.
    async fn create(
        &self,
        receiver: Address,
        secret_hash: SecretHash,
        timelock: Timestamp,
        amount: &Ether,
    ) -> Result<EthereumHtlc, Error>;
    async fn withdraw(&self, htlc_id: Hash, secret: Secret) -> Result<Hash, Error>;
    async fn refund(&self, htlc_id: Hash) -> Result<Hash, Error>;
    async fn status(&self, htlc_id: Hash) -> Result<EscrowStatus, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_funded_and_unspent_escrow_is_locked() {
        let funded = EscrowStatus {
            funded: true,
            ..EscrowStatus::default()
        };
        let claimed = EscrowStatus {
            claimed: true,
            ..funded
        };

        assert!(funded.is_locked());
        assert!(!claimed.is_locked());
        assert!(!EscrowStatus::default().is_locked());
    }
}
