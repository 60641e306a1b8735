//! In-memory stand-ins for the Bitcoin indexer, the escrow contract and the
//! clock.

use crate::{
    asset::Ether,
    completion::SwapCompletionService,
    coordinator::{AtomicSwapCoordinator, InitiateEthToBtc, SafetyMargin},
    engine::{p2wpkh_address, public_key, BitcoinTransactionEngine, FeeRate, Utxo},
    escrow::{EscrowStatus, EthereumEscrow, EthereumHtlc},
    ethereum::{Address as EthereumAddress, Hash},
    indexer::ChainIndexer,
    ledger,
    resolver::{ResolverConfig, ResolverService},
    swap::AtomicSwapState,
    witness, Clock, Error, Secret, SecretHash, SecretVault, Timestamp,
};
use async_trait::async_trait;
use bitcoin::{
    hashes::{sha256, Hash as _},
    secp256k1::SecretKey,
    Address, OutPoint, Script, Transaction, TxOut, Txid,
};
use futures::channel::mpsc;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

pub const NOW: u32 = 1_700_000_000;

/// A deterministic key pair, different for every seed.
pub fn keypair(seed: u8) -> (SecretKey, bitcoin::PublicKey) {
    let bytes = sha256::Hash::hash(&[seed]).into_inner();
    let secret_key = SecretKey::from_slice(&bytes).expect("sha256 output is a valid key");

    (secret_key, public_key(&secret_key))
}

#[derive(Debug)]
pub struct FixedClock(AtomicU32);

impl FixedClock {
    pub fn new(now: Timestamp) -> Self {
        Self(AtomicU32::new(u32::from(now)))
    }

    pub fn set(&self, now: Timestamp) {
        self.0.store(u32::from(now), Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u32) {
        self.0.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        Timestamp::from(self.0.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Default)]
struct Chain {
    median_time_past: u32,
    utxos: Vec<Utxo>,
    transactions: HashMap<Txid, Transaction>,
    spends: HashMap<OutPoint, Txid>,
    broadcasts: Vec<Transaction>,
    reject_next: Option<String>,
    unreachable: bool,
    minted: u8,
}

/// A chain that accepts every transaction passing the script checks and
/// mines it instantly.
#[derive(Debug)]
pub struct MockIndexer {
    chain: Mutex<Chain>,
}

impl MockIndexer {
    pub fn new(median_time_past: Timestamp) -> Self {
        Self {
            chain: Mutex::new(Chain {
                median_time_past: u32::from(median_time_past),
                ..Chain::default()
            }),
        }
    }

    fn chain(&self) -> std::sync::MutexGuard<'_, Chain> {
        self.chain.lock().expect("mock chain is not poisoned")
    }

    /// Creates an output out of thin air.
    pub fn mint(&self, address: &Address, value: u64) -> Utxo {
        let mut chain = self.chain();
        chain.minted += 1;

        let utxo = Utxo {
            outpoint: OutPoint::new(Txid::from_inner([chain.minted; 32]), 0),
            value,
            script_pubkey: address.script_pubkey(),
        };
        chain.utxos.push(utxo.clone());

        utxo
    }

    pub fn set_time(&self, median_time_past: Timestamp) {
        self.chain().median_time_past = u32::from(median_time_past);
    }

    pub fn reject_next_broadcast(&self, reason: &str) {
        self.chain().reject_next = Some(reason.to_owned());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.chain().unreachable = unreachable;
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.chain().broadcasts.clone()
    }

    pub fn balance(&self, script_pubkey: &Script) -> u64 {
        self.chain()
            .utxos
            .iter()
            .filter(|utxo| &utxo.script_pubkey == script_pubkey)
            .map(|utxo| utxo.value)
            .sum()
    }
}

#[async_trait]
impl ChainIndexer for MockIndexer {
    async fn address_utxos(&self, address: &Address) -> Result<Vec<Utxo>, Error> {
        let chain = self.chain();
        if chain.unreachable {
            return Err(Error::network("indexer is unreachable"));
        }

        let script_pubkey = address.script_pubkey();

        Ok(chain
            .utxos
            .iter()
            .filter(|utxo| utxo.script_pubkey == script_pubkey)
            .cloned()
            .collect())
    }

    async fn transaction(&self, txid: Txid) -> Result<Option<Transaction>, Error> {
        Ok(self.chain().transactions.get(&txid).cloned())
    }

    async fn spending_transaction(&self, outpoint: OutPoint) -> Result<Option<Txid>, Error> {
        Ok(self.chain().spends.get(&outpoint).copied())
    }

    async fn broadcast(&self, transaction: &Transaction) -> Result<Txid, Error> {
        let mut chain = self.chain();
        if chain.unreachable {
            return Err(Error::network("indexer is unreachable"));
        }

        let txid = transaction.txid();
        let reject = |reason: &str| Error::BroadcastRejected {
            txid: txid.to_string(),
            reason: reason.to_owned(),
        };

        if let Some(reason) = chain.reject_next.take() {
            return Err(reject(&reason));
        }

        for (index, input) in transaction.input.iter().enumerate() {
            let prevout = chain
                .utxos
                .iter()
                .find(|utxo| utxo.outpoint == input.previous_output)
                .ok_or_else(|| reject("bad-txns-inputs-missingorspent"))?;
            let prevout = TxOut {
                value: prevout.value,
                script_pubkey: prevout.script_pubkey.clone(),
            };

            witness::verify_spend(
                transaction,
                index,
                &prevout,
                Timestamp::from(chain.median_time_past),
            )
            .map_err(|e| reject(&e.to_string()))?;
        }

        for input in &transaction.input {
            chain
                .utxos
                .retain(|utxo| utxo.outpoint != input.previous_output);
            chain.spends.insert(input.previous_output, txid);
        }
        for (vout, output) in (0u32..).zip(transaction.output.iter()) {
            chain.utxos.push(Utxo {
                outpoint: OutPoint::new(txid, vout),
                value: output.value,
                script_pubkey: output.script_pubkey.clone(),
            });
        }
        chain.transactions.insert(txid, transaction.clone());
        chain.broadcasts.push(transaction.clone());

        Ok(txid)
    }

    async fn median_time_past(&self) -> Result<Timestamp, Error> {
        Ok(Timestamp::from(self.chain().median_time_past))
    }
}

#[derive(Clone, Debug)]
struct Contract {
    receiver: EthereumAddress,
    secret_hash: SecretHash,
    timelock: Timestamp,
    amount: Ether,
    status: EscrowStatus,
}

#[derive(Debug, Default)]
struct Escrows {
    contracts: HashMap<Hash, Contract>,
    nonce: u8,
    fail_next_create: bool,
    fail_next_withdraw: bool,
    withdrawals: Vec<(Hash, Secret)>,
    refunds: Vec<Hash>,
}

/// An escrow contract that mines every call instantly.
///
/// With a clock it rejects refunds before the timelock like the contract
/// does.
#[derive(Debug, Default)]
pub struct MockEscrow {
    escrows: Mutex<Escrows>,
    clock: Option<Arc<dyn Clock>>,
}

impl MockEscrow {
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            escrows: Mutex::default(),
            clock: Some(clock),
        }
    }

    fn escrows(&self) -> std::sync::MutexGuard<'_, Escrows> {
        self.escrows.lock().expect("mock escrow is not poisoned")
    }

    pub fn fail_next_create(&self) {
        self.escrows().fail_next_create = true;
    }

    pub fn fail_next_withdraw(&self) {
        self.escrows().fail_next_withdraw = true;
    }

    pub fn created(&self) -> usize {
        self.escrows().contracts.len()
    }

    pub fn secret_hash_of(&self, htlc_id: Hash) -> Option<SecretHash> {
        self.escrows()
            .contracts
            .get(&htlc_id)
            .map(|contract| contract.secret_hash)
    }

    pub fn receiver_of(&self, htlc_id: Hash) -> Option<EthereumAddress> {
        self.escrows()
            .contracts
            .get(&htlc_id)
            .map(|contract| contract.receiver)
    }

    pub fn amount_of(&self, htlc_id: Hash) -> Option<Ether> {
        self.escrows()
            .contracts
            .get(&htlc_id)
            .map(|contract| contract.amount.clone())
    }

    pub fn withdrawals(&self) -> Vec<(Hash, Secret)> {
        self.escrows().withdrawals.clone()
    }

    pub fn refunds(&self) -> Vec<Hash> {
        self.escrows().refunds.clone()
    }
}

fn hash(tag: u8, nonce: u8) -> Hash {
    let mut bytes = [0u8; 32];
    bytes[0] = tag;
    bytes[31] = nonce;

    Hash::from(bytes)
}

#[async_trait]
impl EthereumEscrow for MockEscrow {
    async fn create(
        &self,
        receiver: EthereumAddress,
        secret_hash: SecretHash,
        timelock: Timestamp,
        amount: &Ether,
    ) -> Result<EthereumHtlc, Error> {
        let mut escrows = self.escrows();
        if std::mem::take(&mut escrows.fail_next_create) {
            return Err(Error::network("ethereum node is unreachable"));
        }

        escrows.nonce += 1;
        let htlc_id = hash(0xaa, escrows.nonce);
        escrows.contracts.insert(htlc_id, Contract {
            receiver,
            secret_hash,
            timelock,
            amount: amount.clone(),
            status: EscrowStatus {
                funded: true,
                ..EscrowStatus::default()
            },
        });

        Ok(EthereumHtlc {
            contract_address: EthereumAddress::from([0xee; 20]),
            htlc_id,
            tx_hash: hash(0xc0, escrows.nonce),
        })
    }

    async fn withdraw(&self, htlc_id: Hash, secret: Secret) -> Result<Hash, Error> {
        let mut escrows = self.escrows();
        if std::mem::take(&mut escrows.fail_next_withdraw) {
            return Err(Error::network("ethereum node is unreachable"));
        }

        let contract = escrows
            .contracts
            .get_mut(&htlc_id)
            .ok_or_else(|| Error::validation("no such contract"))?;
        if !contract.status.is_locked() {
            return Err(Error::validation("withdrawable: not withdrawable"));
        }
        if secret.hash() != contract.secret_hash {
            return Err(Error::validation("hashlockMatches: hashlock hash does not match"));
        }
        contract.status.claimed = true;

        escrows.withdrawals.push((htlc_id, secret));
        escrows.nonce += 1;

        Ok(hash(0xc1, escrows.nonce))
    }

    async fn refund(&self, htlc_id: Hash) -> Result<Hash, Error> {
        let now = self.clock.as_ref().map(|clock| clock.now());
        let mut escrows = self.escrows();

        let contract = escrows
            .contracts
            .get_mut(&htlc_id)
            .ok_or_else(|| Error::validation("no such contract"))?;
        if !contract.status.is_locked() {
            return Err(Error::validation("refundable: already withdrawn or refunded"));
        }
        if let Some(now) = now {
            if now < contract.timelock {
                return Err(Error::TimelockViolation {
                    now,
                    timelock: contract.timelock,
                });
            }
        }
        contract.status.refunded = true;

        escrows.refunds.push(htlc_id);
        escrows.nonce += 1;

        Ok(hash(0xc2, escrows.nonce))
    }

    async fn status(&self, htlc_id: Hash) -> Result<EscrowStatus, Error> {
        Ok(self
            .escrows()
            .contracts
            .get(&htlc_id)
            .map(|contract| contract.status)
            .unwrap_or_default())
    }
}

/// Both parties of a swap on a testnet that starts at [`NOW`].
///
/// Alice initiates and claims the bitcoin, Bob funds the Bitcoin HTLC.
#[derive(Debug)]
pub struct Fixture {
    pub clock: Arc<FixedClock>,
    pub indexer: Arc<MockIndexer>,
    pub escrow: Arc<MockEscrow>,
    pub vault: SecretVault,
    pub engine: Arc<BitcoinTransactionEngine>,
    pub coordinator: AtomicSwapCoordinator,
    pub alice: (SecretKey, bitcoin::PublicKey),
    pub bob: (SecretKey, bitcoin::PublicKey),
}

impl Fixture {
    pub fn new() -> Self {
        let clock = Arc::new(FixedClock::new(Timestamp::from(NOW)));
        let indexer = Arc::new(MockIndexer::new(Timestamp::from(NOW)));
        let escrow = Arc::new(MockEscrow::with_clock(clock.clone()));
        let vault = SecretVault::new();
        let engine = Arc::new(BitcoinTransactionEngine::new(
            indexer.clone(),
            ledger::Bitcoin::Testnet,
            FeeRate::sat_per_vbyte(2),
        ));
        let coordinator = AtomicSwapCoordinator::new(
            escrow.clone(),
            vault.clone(),
            clock.clone(),
            ledger::Bitcoin::Testnet,
            SafetyMargin::default(),
        );

        Self {
            clock,
            indexer,
            escrow,
            vault,
            engine,
            coordinator,
            alice: keypair(1),
            bob: keypair(2),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Moves the wall clock and the chain forward together.
    pub fn advance(&self, seconds: u32) {
        self.clock.advance(seconds);
        self.indexer.set_time(self.clock.now());
    }

    pub fn alice_wallet(&self) -> Address {
        p2wpkh_address(&self.alice.0, ledger::Bitcoin::Testnet).expect("valid key")
    }

    pub fn bob_wallet(&self) -> Address {
        p2wpkh_address(&self.bob.0, ledger::Bitcoin::Testnet).expect("valid key")
    }

    pub fn initiate_params(&self) -> InitiateEthToBtc {
        InitiateEthToBtc {
            amount: Ether::from_ether_str("0.01").expect("valid amount"),
            btc_amount: 1_000_000,
            eth_timelock: self.now().plus(2 * 3600),
            participant_address: "0xc5549e335b2786520f4c5d706c76c9ee69d0a028".to_owned(),
            btc_recipient_address: self.alice_wallet().to_string(),
            btc_recipient_pubkey: self.alice.1,
            btc_sender_pubkey: self.bob.1,
        }
    }

    /// A swap waiting for Bob to fund the Bitcoin HTLC.
    pub async fn initiate(&self) -> AtomicSwapState {
        let (events, _) = mpsc::unbounded();

        self.coordinator
            .initiate_eth_to_btc(self.initiate_params(), &events)
            .await
            .expect("initiation succeeds")
    }

    pub fn resolver(&self, funding_amount_sats: u64) -> Arc<ResolverService> {
        let resolver = ResolverService::new(self.engine.clone(), self.bob.0, ResolverConfig {
            funding_amount_sats,
            poll_interval: Duration::from_secs(10),
            funder: true,
        })
        .expect("valid resolver key")
        .with_clock(self.clock.clone());

        Arc::new(resolver)
    }

    /// Gives the resolver's wallet one coin of `value`.
    pub fn fund_wallet(&self, resolver: &ResolverService, value: u64) -> Utxo {
        self.indexer.mint(resolver.funder_address(), value)
    }

    pub fn completion(&self) -> SwapCompletionService {
        SwapCompletionService::new(
            self.engine.clone(),
            self.escrow.clone(),
            self.vault.clone(),
            self.clock.clone(),
        )
    }
}
