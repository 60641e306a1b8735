//! Building, signing and broadcasting the three Bitcoin transactions of a
//! swap: funding the HTLC, claiming it with the secret and refunding it after
//! the timelock.

use crate::{
    indexer::ChainIndexer,
    ledger,
    witness::{self, p2wpkh_script_code, SIGHASH_ALL},
    Error, Secret, SecretHash, Timestamp, SECP,
};
use bitcoin::{
    blockdata::script::Builder,
    consensus::encode::{deserialize, serialize_hex},
    hashes::{hash160, sha256, Hash},
    secp256k1::{PublicKey, SecretKey},
    Address, OutPoint, Script, Transaction, TxIn, TxOut, Txid,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

// https://github.com/bitcoin/bips/blob/master/bip-0125.mediawiki
// Wallets that don't want to signal replaceability should use either a
// max sequence number (0xffffffff) or a sequence number of
// (0xffffffff-1) when they also want to use locktime.
pub const SEQUENCE_ALLOW_NTIMELOCK_NO_RBF: u32 = 0xFFFF_FFFE;

/// Outputs below this value are not relayed by default policy.
pub const DUST_LIMIT_SAT: u64 = 546;

// Witness weights assume the largest DER signature (72 bytes + sighash flag).
const SIGNATURE_PUSH_WEIGHT: u64 = 1 + 73;
const P2WPKH_WITNESS_WEIGHT: u64 = 1 + SIGNATURE_PUSH_WEIGHT + 1 + 33;
const SEGWIT_MARKER_AND_FLAG_WEIGHT: u64 = 2;

/// An unspent output as reported by the chain indexer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: Script,
}

impl Utxo {
    pub fn txid(&self) -> Txid {
        self.outpoint.txid
    }

    pub fn vout(&self) -> u32 {
        self.outpoint.vout
    }

    fn as_txout(&self) -> TxOut {
        TxOut {
            value: self.value,
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

/// A signed transaction, ready to be broadcast.
#[derive(Clone, Debug, PartialEq)]
pub struct RawTx {
    pub txid: Txid,
    pub hex: String,
    pub transaction: Transaction,
}

impl From<Transaction> for RawTx {
    fn from(transaction: Transaction) -> Self {
        Self {
            txid: transaction.txid(),
            hex: serialize_hex(&transaction),
            transaction,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Funding {
    pub funded: bool,
    pub amount: u64,
    /// The largest output paying to the address.
    pub utxo: Option<Utxo>,
}

impl Funding {
    /// The output that can be claimed for `expected` satoshis, if any.
    ///
    /// A claim spends exactly one output, so several smaller ones adding up
    /// to `expected` do not count.
    pub fn covering(&self, expected: u64) -> Option<&Utxo> {
        self.utxo.as_ref().filter(|utxo| utxo.value >= expected)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeeRate(u64);

impl FeeRate {
    pub fn sat_per_vbyte(sat: u64) -> Self {
        Self(sat)
    }

    pub fn as_sat_per_vbyte(self) -> u64 {
        self.0
    }

    pub fn fee_for_weight(self, weight: u64) -> u64 {
        let vbytes = (weight + 3) / 4;
        vbytes.saturating_mul(self.0)
    }
}

impl Default for FeeRate {
    fn default() -> Self {
        Self(10)
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/vB", self.0)
    }
}

pub fn public_key(key: &SecretKey) -> bitcoin::PublicKey {
    bitcoin::PublicKey {
        compressed: true,
        key: PublicKey::from_secret_key(&*SECP, key),
    }
}

fn p2wpkh_script_pubkey(pubkey: &bitcoin::PublicKey) -> Script {
    let pubkey_hash = hash160::Hash::hash(&pubkey.to_bytes());

    Builder::new()
        .push_int(0)
        .push_slice(&pubkey_hash[..])
        .into_script()
}

/// The native segwit address the given key receives change on.
pub fn p2wpkh_address(key: &SecretKey, network: ledger::Bitcoin) -> Result<Address, Error> {
    let script = p2wpkh_script_pubkey(&public_key(key));

    Address::from_script(&script, network.into())
        .ok_or_else(|| Error::validation("cannot derive a P2WPKH address"))
}

fn sign(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    value: u64,
    key: &SecretKey,
) -> Result<Vec<u8>, Error> {
    let message = witness::sighash(tx, input_index, script_code, value)
        .map_err(|e| Error::validation(format!("cannot compute sighash: {}", e)))?;
    let signature = SECP.sign(&message, key);

    let mut serialized = signature.serialize_der().to_vec();
    serialized.push(SIGHASH_ALL);

    Ok(serialized)
}

fn push_weight(len: usize) -> u64 {
    let len = len as u64;
    let prefix = match len {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        _ => 5,
    };

    prefix + len
}

fn claim_witness_weight(witness_script: &Script) -> u64 {
    1 + SIGNATURE_PUSH_WEIGHT + push_weight(32) + push_weight(1) + push_weight(witness_script.len())
}

fn refund_witness_weight(witness_script: &Script) -> u64 {
    1 + SIGNATURE_PUSH_WEIGHT + push_weight(0) + push_weight(witness_script.len())
}

/// Recovers the secret from a transaction that claimed an HTLC.
pub fn extract_secret(transaction: &Transaction, secret_hash: &SecretHash) -> Option<Secret> {
    transaction.input.iter().find_map(|txin| {
        txin.witness.iter().find_map(|script_item| {
            if sha256::Hash::hash(script_item).into_inner() == *secret_hash.as_raw() {
                Secret::from_vec(script_item).ok()
            } else {
                None
            }
        })
    })
}

pub struct BitcoinTransactionEngine {
    indexer: Arc<dyn ChainIndexer>,
    network: ledger::Bitcoin,
    fee_rate: FeeRate,
    /// Outputs spent by transactions this engine built, with the script
    /// they pay to.
    reserved: Mutex<HashMap<OutPoint, Script>>,
}

impl fmt::Debug for BitcoinTransactionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitcoinTransactionEngine")
            .field("network", &self.network)
            .field("fee_rate", &self.fee_rate)
            .finish()
    }
}

impl BitcoinTransactionEngine {
    pub fn new(indexer: Arc<dyn ChainIndexer>, network: ledger::Bitcoin, fee_rate: FeeRate) -> Self {
        Self {
            indexer,
            network,
            fee_rate,
            reserved: Mutex::new(HashMap::new()),
        }
    }

    pub fn network(&self) -> ledger::Bitcoin {
        self.network
    }

    pub fn fee_rate(&self) -> FeeRate {
        self.fee_rate
    }

    pub fn is_reserved(&self, outpoint: &OutPoint) -> bool {
        self.reserved
            .lock()
            .map(|reserved| reserved.contains_key(outpoint))
            .unwrap_or(true)
    }

    fn reserve<'a>(&self, utxos: impl IntoIterator<Item = &'a Utxo>) -> Result<(), Error> {
        let mut reserved = self
            .reserved
            .lock()
            .map_err(|_| Error::validation("utxo reservations are poisoned"))?;

        let utxos = utxos.into_iter().collect::<Vec<_>>();
        if let Some(taken) = utxos.iter().find(|u| reserved.contains_key(&u.outpoint)) {
            return Err(Error::validation(format!(
                "{} is already spent by another transaction",
                taken.outpoint
            )));
        }
        reserved.extend(
            utxos
                .into_iter()
                .map(|utxo| (utxo.outpoint, utxo.script_pubkey.clone())),
        );

        Ok(())
    }

    /// Forgets reservations of outputs paying to `script_pubkey` that the
    /// indexer no longer lists as unspent.
    fn prune_reservations(&self, script_pubkey: &Script, unspent: &[Utxo]) {
        if let Ok(mut reserved) = self.reserved.lock() {
            reserved.retain(|outpoint, script| {
                script != script_pubkey || unspent.iter().any(|utxo| utxo.outpoint == *outpoint)
            });
        }
    }

    /// Makes the inputs of a transaction available for selection again.
    pub fn release(&self, transaction: &Transaction) {
        if let Ok(mut reserved) = self.reserved.lock() {
            for input in &transaction.input {
                reserved.remove(&input.previous_output);
            }
        }
    }

    /// Sends `amount` satoshis from the P2WPKH outputs of `sender_key` to the
    /// HTLC at `address`.
    ///
    /// Coins are selected largest first. Change below the dust limit is left
    /// to the miners.
    pub fn fund_htlc(
        &self,
        address: &Address,
        amount: u64,
        utxos: &[Utxo],
        sender_key: &SecretKey,
    ) -> Result<RawTx, Error> {
        if amount < DUST_LIMIT_SAT {
            return Err(Error::validation(format!(
                "funding amount {} sat is below the dust limit",
                amount
            )));
        }
        if address.network != bitcoin::Network::from(self.network) {
            return Err(Error::validation(format!(
                "{} is not a {} address",
                address, self.network
            )));
        }

        let sender_pubkey = public_key(sender_key);
        let own_script = p2wpkh_script_pubkey(&sender_pubkey);
        let change_address = p2wpkh_address(sender_key, self.network)?;

        let mut candidates = utxos
            .iter()
            .filter(|utxo| utxo.script_pubkey == own_script && !self.is_reserved(&utxo.outpoint))
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| b.value.cmp(&a.value));

        let available = candidates.iter().map(|utxo| utxo.value).sum::<u64>();

        let htlc_output = TxOut {
            value: amount,
            script_pubkey: address.script_pubkey(),
        };
        let change_output = TxOut {
            value: 0,
            script_pubkey: change_address.script_pubkey(),
        };

        let mut selected = Vec::new();
        let mut selected_value = 0u64;
        let mut fee_without_change = 0;

        for utxo in candidates {
            selected.push(utxo.clone());
            selected_value += utxo.value;

            let fee_with_change = self.fee_rate.fee_for_weight(self.funding_weight(
                selected.len(),
                &[htlc_output.clone(), change_output.clone()],
            ));
            fee_without_change = self
                .fee_rate
                .fee_for_weight(self.funding_weight(selected.len(), &[htlc_output.clone()]));

            let change = selected_value
                .checked_sub(amount)
                .and_then(|rest| rest.checked_sub(fee_with_change));

            match change {
                Some(change) if change >= DUST_LIMIT_SAT => {
                    let outputs = vec![
                        htlc_output,
                        TxOut {
                            value: change,
                            ..change_output
                        },
                    ];
                    return self.sign_funding(selected, outputs, sender_key, &sender_pubkey);
                }
                _ if selected_value >= amount + fee_without_change => {
                    return self.sign_funding(
                        selected,
                        vec![htlc_output],
                        sender_key,
                        &sender_pubkey,
                    );
                }
                _ => continue,
            }
        }

        if fee_without_change == 0 {
            fee_without_change = self
                .fee_rate
                .fee_for_weight(self.funding_weight(1, &[htlc_output]));
        }

        Err(Error::InsufficientFunds {
            needed: amount + fee_without_change,
            available,
        })
    }

    fn funding_weight(&self, inputs: usize, outputs: &[TxOut]) -> u64 {
        let unsigned = Transaction {
            version: 2,
            lock_time: 0,
            input: vec![
                TxIn {
                    previous_output: OutPoint::default(),
                    script_sig: Script::new(),
                    sequence: SEQUENCE_ALLOW_NTIMELOCK_NO_RBF,
                    witness: vec![],
                };
                inputs
            ],
            output: outputs.to_vec(),
        };

        unsigned.get_weight() as u64
            + SEGWIT_MARKER_AND_FLAG_WEIGHT
            + P2WPKH_WITNESS_WEIGHT * inputs as u64
    }

    fn sign_funding(
        &self,
        inputs: Vec<Utxo>,
        outputs: Vec<TxOut>,
        sender_key: &SecretKey,
        sender_pubkey: &bitcoin::PublicKey,
    ) -> Result<RawTx, Error> {
        let mut transaction = Transaction {
            version: 2,
            lock_time: 0,
            input: inputs
                .iter()
                .map(|utxo| TxIn {
                    previous_output: utxo.outpoint,
                    script_sig: Script::new(),
                    sequence: SEQUENCE_ALLOW_NTIMELOCK_NO_RBF,
                    witness: vec![],
                })
                .collect(),
            output: outputs,
        };

        let pubkey_hash = hash160::Hash::hash(&sender_pubkey.to_bytes());
        let script_code = p2wpkh_script_code(&pubkey_hash[..]);

        let witnesses = inputs
            .iter()
            .enumerate()
            .map(|(index, utxo)| {
                let signature = sign(&transaction, index, &script_code, utxo.value, sender_key)?;
                Ok(vec![signature, sender_pubkey.to_bytes()])
            })
            .collect::<Result<Vec<_>, Error>>()?;

        for (input, witness) in transaction.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }

        for (index, utxo) in inputs.iter().enumerate() {
            self.self_check(&transaction, index, utxo, Timestamp::from(0))?;
        }

        self.reserve(&inputs)?;

        Ok(transaction.into())
    }

    /// Spends the HTLC through its hashlock branch, revealing `secret`.
    pub fn claim_htlc(
        &self,
        utxo: &Utxo,
        recipient_address: &Address,
        secret: Secret,
        witness_script: &Script,
        recipient_key: &SecretKey,
    ) -> Result<RawTx, Error> {
        self.ensure_spends_script(utxo, witness_script)?;

        let witness_weight = claim_witness_weight(witness_script);
        let transaction = self.sign_htlc_spend(
            utxo,
            recipient_address,
            witness_script,
            recipient_key,
            0,
            witness_weight,
            |signature| {
                vec![
                    signature,
                    secret.as_raw_secret().to_vec(),
                    vec![1u8],
                    witness_script.to_bytes(),
                ]
            },
        )?;

        self.self_check(&transaction, 0, utxo, Timestamp::from(0))?;
        self.reserve(vec![utxo])?;

        Ok(transaction.into())
    }

    /// Spends the HTLC through its timelock branch.
    ///
    /// Refusing to build the transaction before `timelock` saves a broadcast
    /// the network would reject anyway.
    pub fn refund_htlc(
        &self,
        utxo: &Utxo,
        sender_address: &Address,
        witness_script: &Script,
        sender_key: &SecretKey,
        timelock: Timestamp,
        now: Timestamp,
    ) -> Result<RawTx, Error> {
        if now < timelock {
            return Err(Error::TimelockViolation { now, timelock });
        }

        self.ensure_spends_script(utxo, witness_script)?;

        let witness_weight = refund_witness_weight(witness_script);
        let transaction = self.sign_htlc_spend(
            utxo,
            sender_address,
            witness_script,
            sender_key,
            u32::from(timelock),
            witness_weight,
            |signature| vec![signature, vec![], witness_script.to_bytes()],
        )?;

        self.self_check(&transaction, 0, utxo, now)?;
        self.reserve(vec![utxo])?;

        Ok(transaction.into())
    }

    fn ensure_spends_script(&self, utxo: &Utxo, witness_script: &Script) -> Result<(), Error> {
        let expected = Address::p2wsh(witness_script, self.network.into()).script_pubkey();

        if expected != utxo.script_pubkey {
            return Err(Error::ScriptMismatch {
                expected: hex::encode(expected.as_bytes()),
                actual: hex::encode(utxo.script_pubkey.as_bytes()),
            });
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn sign_htlc_spend(
        &self,
        utxo: &Utxo,
        spend_to: &Address,
        witness_script: &Script,
        key: &SecretKey,
        lock_time: u32,
        witness_weight: u64,
        witness: impl FnOnce(Vec<u8>) -> Vec<Vec<u8>>,
    ) -> Result<Transaction, Error> {
        let mut transaction = Transaction {
            version: 2,
            lock_time,
            input: vec![TxIn {
                previous_output: utxo.outpoint,
                script_sig: Script::new(),
                sequence: SEQUENCE_ALLOW_NTIMELOCK_NO_RBF,
                witness: vec![],
            }],
            output: vec![TxOut {
                value: 0, // overwritten once we estimated the weight
                script_pubkey: spend_to.script_pubkey(),
            }],
        };

        let weight =
            transaction.get_weight() as u64 + SEGWIT_MARKER_AND_FLAG_WEIGHT + witness_weight;
        let fee = self.fee_rate.fee_for_weight(weight);

        transaction.output[0].value = utxo
            .value
            .checked_sub(fee)
            .filter(|value| *value >= DUST_LIMIT_SAT)
            .ok_or(Error::InsufficientFunds {
                needed: fee + DUST_LIMIT_SAT,
                available: utxo.value,
            })?;

        let signature = sign(&transaction, 0, witness_script, utxo.value, key)?;
        transaction.input[0].witness = witness(signature);

        Ok(transaction)
    }

    fn self_check(
        &self,
        transaction: &Transaction,
        index: usize,
        utxo: &Utxo,
        chain_time: Timestamp,
    ) -> Result<(), Error> {
        witness::verify_spend(transaction, index, &utxo.as_txout(), chain_time).map_err(|e| {
            Error::validation(format!(
                "signed transaction does not satisfy the script it spends: {}",
                e
            ))
        })
    }

    /// Publishes a transaction given as hex and returns its id.
    ///
    /// On rejection the inputs of the transaction become available for
    /// selection again.
    pub async fn broadcast_transaction(&self, hex: &str) -> Result<Txid, Error> {
        let bytes = hex::decode(hex.trim())
            .map_err(|e| Error::validation(format!("transaction is not hex: {}", e)))?;
        let transaction: Transaction = deserialize(&bytes)
            .map_err(|e| Error::validation(format!("malformed transaction: {}", e)))?;

        self.broadcast(&transaction).await
    }

    pub async fn broadcast(&self, transaction: &Transaction) -> Result<Txid, Error> {
        match self.indexer.broadcast(transaction).await {
            Ok(txid) => {
                tracing::info!(%txid, "broadcast transaction");
                Ok(txid)
            }
            Err(e @ Error::BroadcastRejected { .. }) => {
                let txid = transaction.txid();
                // A retried POST whose first attempt went through is
                // rejected because its inputs are now spent by itself.
                if let Ok(Some(_)) = self.indexer.transaction(txid).await {
                    tracing::info!(%txid, "transaction already known to the node");
                    return Ok(txid);
                }

                tracing::warn!(%txid, "transaction rejected: {}", e);
                self.release(transaction);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_address_utxos(&self, address: &Address) -> Result<Vec<Utxo>, Error> {
        let utxos = self.indexer.address_utxos(address).await?;
        self.prune_reservations(&address.script_pubkey(), &utxos);

        Ok(utxos)
    }

    pub async fn is_htlc_funded(&self, address: &Address) -> Result<Funding, Error> {
        let utxos = self.get_address_utxos(address).await?;

        let amount = utxos.iter().map(|utxo| utxo.value).sum::<u64>();
        let utxo = utxos.into_iter().max_by_key(|utxo| utxo.value);

        Ok(Funding {
            funded: amount > 0,
            amount,
            utxo,
        })
    }

    pub async fn spending_transaction(&self, outpoint: OutPoint) -> Result<Option<Txid>, Error> {
        self.indexer.spending_transaction(outpoint).await
    }

    pub async fn transaction(&self, txid: Txid) -> Result<Option<Transaction>, Error> {
        self.indexer.transaction(txid).await
    }

    /// The time CLTV locktimes are checked against.
    pub async fn chain_time(&self) -> Result<Timestamp, Error> {
        self.indexer.median_time_past().await
    }
}
