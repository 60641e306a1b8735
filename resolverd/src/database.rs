use anyhow::{anyhow, Context};
use ethbtc::{
    swap::{AtomicSwapState, Status},
    Secret, SecretCommitment, SecretVault, SwapId,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Swap states and, on the initiating node, their secrets.
///
/// Every command of the daemon is a separate process, this is what they
/// share.
#[derive(Debug)]
pub struct Database {
    db: sled::Db,
    swaps: sled::Tree,
    secrets: sled::Tree,
}

impl Database {
    const SWAPS_TREE: &'static str = "swaps";
    const SECRETS_TREE: &'static str = "secrets";

    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let db = open(path)?;

        Ok(Database {
            swaps: db.open_tree(Self::SWAPS_TREE)?,
            secrets: db.open_tree(Self::SECRETS_TREE)?,
            db,
        })
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.db
            .flush_async()
            .await
            .map(|_| ())
            .context("Could not flush db")
    }
}

fn open(path: &Path) -> anyhow::Result<sled::Db> {
    let path = path
        .to_str()
        .ok_or_else(|| anyhow!("The path is not utf-8 valid: {:?}", path))?;

    sled::open(path).with_context(|| {
        format!(
            "Could not open the DB at {}, is another resolverd command using it?",
            path
        )
    })
}

/// Swap related functions
impl Database {
    /// Inserts or overwrites the stored state of the swap.
    pub async fn save_swap(&self, swap: &AtomicSwapState) -> anyhow::Result<()> {
        let value = serialize(swap).context("Could not serialize swap")?;

        self.swaps
            .insert(swap.id.as_bytes(), value)
            .with_context(|| format!("Could not write swap {}", swap.id))?;

        self.flush().await
    }

    pub fn load_swap(&self, swap_id: &SwapId) -> anyhow::Result<AtomicSwapState> {
        let swap = self
            .swaps
            .get(swap_id.as_bytes())?
            .ok_or_else(|| anyhow!("Swap does not exist {}", swap_id))?;

        deserialize(&swap).context("Could not deserialize swap")
    }

    pub fn all_swaps(&self) -> anyhow::Result<Vec<AtomicSwapState>> {
        self.swaps
            .iter()
            .map(|item| {
                let (_, value) = item.context("Could not retrieve data")?;
                deserialize(&value).context("Could not deserialize swap")
            })
            .collect()
    }

    /// Swaps that still need the resolver or a completion.
    pub fn active_swaps(&self) -> anyhow::Result<Vec<AtomicSwapState>> {
        Ok(self
            .all_swaps()?
            .into_iter()
            .filter(|swap| !swap.status.is_terminal())
            .collect())
    }

    /// Swaps the resolver should fund, leaving out those flagged for a human.
    pub fn waiting_for_funding(&self) -> anyhow::Result<Vec<AtomicSwapState>> {
        Ok(self
            .all_swaps()?
            .into_iter()
            .filter(|swap| {
                swap.status == Status::AwaitingBtcFunding && !swap.needs_reconciliation()
            })
            .collect())
    }
}

/// Secret related functions
impl Database {
    /// Fills a fresh vault with every stored secret.
    pub fn load_vault(&self) -> anyhow::Result<SecretVault> {
        let vault = SecretVault::new();

        for item in self.secrets.iter() {
            let (key, value) = item.context("Could not retrieve data")?;
            let swap_id = swap_id_from_key(&key)?;
            let secret = deserialize::<Secret>(&value).context("Could not deserialize secret")?;

            vault.store(swap_id, SecretCommitment::from_secret(secret));
        }

        Ok(vault)
    }

    /// Writes the vault back, forgetting secrets the vault discarded.
    pub async fn sync_vault(&self, vault: &SecretVault) -> anyhow::Result<()> {
        let known = vault.all();

        for item in self.secrets.iter() {
            let (key, _) = item.context("Could not retrieve data")?;
            let swap_id = swap_id_from_key(&key)?;
            if !known.iter().any(|(id, _)| *id == swap_id) {
                self.secrets.remove(key)?;
            }
        }

        for (swap_id, commitment) in known {
            self.secrets
                .insert(swap_id.as_bytes(), serialize(&commitment.preimage())?)?;
        }

        self.flush().await
    }
}

fn swap_id_from_key(key: &[u8]) -> anyhow::Result<SwapId> {
    SwapId::from_slice(key).context("Corrupted key in secrets tree")
}

pub fn serialize<T>(t: &T) -> anyhow::Result<Vec<u8>>
where
    T: Serialize,
{
    Ok(serde_cbor::to_vec(t)?)
}

pub fn deserialize<'a, T>(v: &'a [u8]) -> anyhow::Result<T>
where
    T: Deserialize<'a>,
{
    Ok(serde_cbor::from_slice(v)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;
    use ethbtc::{
        asset::Ether,
        engine::public_key,
        ethereum,
        htlc::{generate_htlc_address, HtlcParams},
        ledger,
        swap::BitcoinLeg,
        Timestamp,
    };
    use spectral::prelude::*;
    use tempfile::TempDir;

    fn swap(status: Status) -> AtomicSwapState {
        let secret = Secret::from([7u8; 32]);
        let alice = SecretKey::from_slice(&[1u8; 32]).unwrap();
        let bob = SecretKey::from_slice(&[2u8; 32]).unwrap();
        let params = HtlcParams {
            secret_hash: secret.hash(),
            recipient_pubkey: public_key(&alice),
            sender_pubkey: public_key(&bob),
            timelock: Timestamp::from(1_700_003_600),
            network: ledger::Bitcoin::Regtest,
        };
        let htlc = generate_htlc_address(&params).unwrap();

        AtomicSwapState {
            id: SwapId::default(),
            status,
            secret_hash: secret.hash(),
            secret: None,
            timelock: params.timelock,
            eth_timelock: Timestamp::from(1_700_007_200),
            eth_htlc: None,
            btc_htlc: Some(BitcoinLeg::new(params, htlc, 100_000)),
            amount: Ether::from_ether_str("0.01").unwrap(),
            participant_address: ethereum::Address::from([9u8; 20]),
            manual_reconciliation: None,
            eth_withdraw_tx: None,
            eth_refund_tx: None,
        }
    }

    #[tokio::test]
    async fn saved_swap_is_loaded_back() {
        let tmp_dir = TempDir::new().unwrap();
        let db = Database::new(tmp_dir.path()).unwrap();
        let swap = swap(Status::AwaitingBtcFunding);

        db.save_swap(&swap).await.unwrap();

        assert_that(&db.load_swap(&swap.id).unwrap()).is_equal_to(&swap);
    }

    #[tokio::test]
    async fn saving_again_overwrites_the_state() {
        let tmp_dir = TempDir::new().unwrap();
        let db = Database::new(tmp_dir.path()).unwrap();
        let mut swap = swap(Status::AwaitingBtcFunding);
        db.save_swap(&swap).await.unwrap();

        swap.transition(Status::ParticipantFunded).unwrap();
        db.save_swap(&swap).await.unwrap();

        assert_that(&db.all_swaps().unwrap()).is_equal_to(vec![swap]);
    }

    #[tokio::test]
    async fn finished_swaps_are_not_active() {
        let tmp_dir = TempDir::new().unwrap();
        let db = Database::new(tmp_dir.path()).unwrap();
        let active = swap(Status::ParticipantFunded);
        db.save_swap(&active).await.unwrap();
        db.save_swap(&swap(Status::Completed)).await.unwrap();

        let ids = db
            .active_swaps()
            .unwrap()
            .into_iter()
            .map(|swap| swap.id)
            .collect::<Vec<_>>();

        assert_that(&ids).is_equal_to(vec![active.id]);
    }

    #[tokio::test]
    async fn only_unflagged_swaps_awaiting_funding_are_handed_to_the_resolver() {
        let tmp_dir = TempDir::new().unwrap();
        let db = Database::new(tmp_dir.path()).unwrap();
        let waiting = swap(Status::AwaitingBtcFunding);
        let mut flagged = swap(Status::AwaitingBtcFunding);
        flagged.flag_for_reconciliation("script mismatch");
        db.save_swap(&waiting).await.unwrap();
        db.save_swap(&flagged).await.unwrap();
        db.save_swap(&swap(Status::ParticipantFunded)).await.unwrap();

        let ids = db
            .waiting_for_funding()
            .unwrap()
            .into_iter()
            .map(|swap| swap.id)
            .collect::<Vec<_>>();

        assert_that(&ids).is_equal_to(vec![waiting.id]);
    }

    #[test]
    fn unknown_swap_is_an_error() {
        let tmp_dir = TempDir::new().unwrap();
        let db = Database::new(tmp_dir.path()).unwrap();

        assert_that(&db.load_swap(&SwapId::default())).is_err();
    }

    #[tokio::test]
    async fn stored_vault_drops_discarded_secrets() {
        let tmp_dir = TempDir::new().unwrap();
        let db = Database::new(tmp_dir.path()).unwrap();
        let kept = SwapId::default();
        let discarded = SwapId::default();
        let commitment = SecretCommitment::generate();
        let vault = SecretVault::new();
        vault.store(kept, commitment);
        vault.store(discarded, SecretCommitment::generate());
        db.sync_vault(&vault).await.unwrap();

        vault.discard(&discarded);
        db.sync_vault(&vault).await.unwrap();
        let loaded = db.load_vault().unwrap();

        assert_that(&loaded.commitment(&kept)).is_equal_to(Some(commitment));
        assert_that(&loaded.commitment(&discarded)).is_none();
    }
}
