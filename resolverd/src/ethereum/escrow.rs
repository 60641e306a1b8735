//! The HashedTimelock escrow contract, driven over JSON-RPC with locally
//! signed transactions.

use crate::{
    ethereum::{self, geth, Address, ChainId, Hash},
    jsonrpc::{ConnectionFailed, JsonRpcError},
};
use async_trait::async_trait;
use backoff::{future::retry_notify, ExponentialBackoff};
use bitcoin::secp256k1::SecretKey;
use conquer_once::Lazy;
use ethbtc::{
    asset::Ether,
    escrow::{EscrowStatus, EthereumEscrow, EthereumHtlc},
    Error, Secret, SecretHash, Timestamp,
};
use futures::TryFutureExt;
use num::Num;
use sha3::{Digest, Keccak256};
use std::{fmt, future::Future, time::Duration};

const NEW_CONTRACT_GAS_LIMIT: u64 = 200_000;
const WITHDRAW_GAS_LIMIT: u64 = 100_000;
const REFUND_GAS_LIMIT: u64 = 100_000;

/// Words in the tuple returned by `getContract(bytes32)`.
const GET_CONTRACT_WORDS: usize = 8;

static LOG_HTLC_NEW: Lazy<Hash> = Lazy::new(|| {
    Hash::from(keccak256(
        b"LogHTLCNew(bytes32,address,address,uint256,bytes32,uint256)",
    ))
});

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&Keccak256::digest(data));

    hash
}

/// ABI encodes a call whose arguments are all static 32 byte words.
fn encode_call(signature: &str, words: &[[u8; 32]]) -> Vec<u8> {
    let mut data = keccak256(signature.as_bytes())[..4].to_vec();
    for word in words {
        data.extend_from_slice(word);
    }

    data
}

fn uint_word(value: u32) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[28..].copy_from_slice(&value.to_be_bytes());

    word
}

fn decode_status(output: &[u8]) -> Result<EscrowStatus, Error> {
    if output.len() < GET_CONTRACT_WORDS * 32 {
        return Err(Error::validation(format!(
            "getContract returned {} bytes",
            output.len()
        )));
    }

    let word = |index: usize| &output[index * 32..(index + 1) * 32];
    let is_true = |index: usize| word(index).iter().any(|byte| *byte != 0);

    Ok(EscrowStatus {
        funded: is_true(0),
        claimed: is_true(5),
        refunded: is_true(6),
    })
}

/// Only connection problems are worth retrying, everything the node
/// answered is final.
fn classify(e: anyhow::Error) -> backoff::Error<Error> {
    if e.downcast_ref::<ConnectionFailed>().is_some() {
        backoff::Error::Transient(Error::network(format!("{:#}", e)))
    } else {
        backoff::Error::Permanent(into_error(e))
    }
}

fn into_error(e: anyhow::Error) -> Error {
    if e.downcast_ref::<JsonRpcError>().is_some() {
        Error::validation(format!("{:#}", e))
    } else {
        Error::network(format!("{:#}", e))
    }
}

pub struct Web3Escrow {
    client: geth::Client,
    contract: Address,
    chain_id: ChainId,
    private_key: clarity::PrivateKey,
    account: Address,
    retry_budget: Duration,
    receipt_timeout: Duration,
}

impl fmt::Debug for Web3Escrow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Web3Escrow")
            .field("contract", &self.contract)
            .field("chain_id", &self.chain_id)
            .field("account", &self.account)
            .finish()
    }
}

impl Web3Escrow {
    /// Fails if the node is on a different chain than `chain_id`.
    pub async fn connect(
        client: geth::Client,
        contract: Address,
        chain_id: ChainId,
        key: &SecretKey,
        retry_budget: Duration,
    ) -> anyhow::Result<Self> {
        let actual = client.chain_id().await?;
        if actual != chain_id {
            anyhow::bail!("wrong chain id: expected {}, got {}", chain_id, actual);
        }

        Ok(Self {
            client,
            contract,
            chain_id,
            private_key: ethereum::private_key(key)?,
            account: ethereum::account(key)?,
            retry_budget,
            receipt_timeout: Duration::from_secs(60),
        })
    }

    pub fn account(&self) -> Address {
        self.account
    }

    async fn retry<T, F, Fut>(&self, what: &str, operation: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut operation = operation;
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.retry_budget),
            ..ExponentialBackoff::default()
        };

        retry_notify(
            backoff,
            || operation().map_err(classify),
            |e, _| tracing::warn!("failed to {}, retrying ...: {}", what, e),
        )
        .await
    }

    fn sign(&self, transaction: clarity::Transaction) -> Result<String, Error> {
        let signed_transaction = transaction.sign(
            &self.private_key,
            Some(u64::from(u32::from(self.chain_id))),
        );
        let bytes = signed_transaction
            .to_bytes()
            .map_err(|_| Error::validation("failed to serialize signed transaction to bytes"))?;

        Ok(format!("0x{}", hex::encode(bytes)))
    }

    /// Sends a transaction to the escrow contract and waits until it was
    /// mined successfully.
    async fn execute(
        &self,
        function: &str,
        value: num256::Uint256,
        data: Vec<u8>,
        gas_limit: u64,
    ) -> Result<geth::TransactionReceipt, Error> {
        let nonce = self
            .retry("fetch nonce", || {
                self.client.get_transaction_count(self.account)
            })
            .await?;
        let gas_price = self
            .retry("fetch gas price", || self.client.gas_price())
            .await?;
        let to = ethereum::to_clarity_address(self.contract).map_err(into_error)?;

        let transaction = clarity::Transaction {
            nonce: nonce.into(),
            gas_price,
            gas_limit: gas_limit.into(),
            to,
            value,
            data,
            signature: None,
        };
        let transaction_hex = self.sign(transaction)?;

        let hash = self
            .client
            .send_raw_transaction(transaction_hex)
            .await
            .map_err(into_error)?;
        tracing::info!(tx_hash = %hash, "sent {} transaction", function);

        let receipt = self.wait_until_transaction_receipt(hash).await?;
        if !receipt.is_successful() {
            return Err(Error::BroadcastRejected {
                txid: hash.to_string(),
                reason: format!("{} reverted", function),
            });
        }

        Ok(receipt)
    }

    async fn wait_until_transaction_receipt(
        &self,
        transaction_hash: Hash,
    ) -> Result<geth::TransactionReceipt, Error> {
        let start_time = std::time::Instant::now();

        loop {
            if start_time.elapsed() > self.receipt_timeout {
                return Err(Error::network(format!(
                    "failed to find transaction receipt for transaction {}",
                    transaction_hash
                )));
            }

            if let Some(receipt) = self
                .retry("fetch transaction receipt", || {
                    self.client.get_transaction_receipt(transaction_hash)
                })
                .await?
            {
                return Ok(receipt);
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// The id the contract assigned to the escrow created in `receipt`.
    fn htlc_id(&self, receipt: &geth::TransactionReceipt) -> Option<Hash> {
        receipt
            .logs
            .iter()
            .filter(|log| log.address == self.contract)
            .find(|log| log.topics.first() == Some(&*LOG_HTLC_NEW))
            .and_then(|log| log.topics.get(1))
            .copied()
    }
}

#[async_trait]
impl EthereumEscrow for Web3Escrow {
    async fn create(
        &self,
        receiver: Address,
        secret_hash: SecretHash,
        timelock: Timestamp,
        amount: &Ether,
    ) -> Result<EthereumHtlc, Error> {
        let value = num256::Uint256::from_str_radix(&amount.to_wei_dec(), 10)
            .map_err(|_| Error::validation(format!("{} is not a valid amount", amount)))?;
        let data = encode_call("newContract(address,bytes32,uint256)", &[
            *Hash::from(receiver).as_bytes(),
            secret_hash.into_raw(),
            uint_word(u32::from(timelock)),
        ]);

        let receipt = self
            .execute("newContract", value, data, NEW_CONTRACT_GAS_LIMIT)
            .await?;
        let htlc_id = self.htlc_id(&receipt).ok_or_else(|| {
            Error::validation(format!(
                "transaction {} did not emit LogHTLCNew",
                receipt.transaction_hash
            ))
        })?;

        Ok(EthereumHtlc {
            contract_address: self.contract,
            htlc_id,
            tx_hash: receipt.transaction_hash,
        })
    }

    async fn withdraw(&self, htlc_id: Hash, secret: Secret) -> Result<Hash, Error> {
        let data = encode_call("withdraw(bytes32,bytes32)", &[
            *htlc_id.as_bytes(),
            secret.into_raw_secret(),
        ]);

        let receipt = self
            .execute("withdraw", 0u64.into(), data, WITHDRAW_GAS_LIMIT)
            .await?;

        Ok(receipt.transaction_hash)
    }

    async fn refund(&self, htlc_id: Hash) -> Result<Hash, Error> {
        let data = encode_call("refund(bytes32)", &[*htlc_id.as_bytes()]);

        let receipt = self
            .execute("refund", 0u64.into(), data, REFUND_GAS_LIMIT)
            .await?;

        Ok(receipt.transaction_hash)
    }

    async fn status(&self, htlc_id: Hash) -> Result<EscrowStatus, Error> {
        let data = encode_call("getContract(bytes32)", &[*htlc_id.as_bytes()]);

        let output = self
            .retry("fetch escrow status", || self.client.call(self.contract, &data))
            .await?;

        decode_status(&output)
    }
}
