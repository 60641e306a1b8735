use crate::{
    ethereum::{parse_quantity, Address, ChainId, Hash},
    jsonrpc,
};
use anyhow::Context;
use num::Num;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone)]
pub struct Client {
    rpc_client: jsonrpc::Client,
}

impl Client {
    pub fn new(url: url::Url, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Client {
            rpc_client: jsonrpc::Client::new(url, timeout)?,
        })
    }

    pub async fn chain_id(&self) -> anyhow::Result<ChainId> {
        let chain_id = self
            .rpc_client
            .send::<Vec<()>, String>(jsonrpc::Request::new(
                "net_version",
                vec![],
                JSONRPC_VERSION.into(),
            ))
            .await
            .context("failed to fetch net version")?;
        let chain_id: u32 = chain_id.parse()?;

        Ok(ChainId::from(chain_id))
    }

    pub async fn send_raw_transaction(&self, transaction_hex: String) -> anyhow::Result<Hash> {
        let tx_hash = self
            .rpc_client
            .send(jsonrpc::Request::new(
                "eth_sendRawTransaction",
                vec![transaction_hex],
                JSONRPC_VERSION.into(),
            ))
            .await
            .context("failed to send raw transaction")?;

        Ok(tx_hash)
    }

    pub async fn get_transaction_receipt(
        &self,
        transaction_hash: Hash,
    ) -> anyhow::Result<Option<TransactionReceipt>> {
        let receipt = self
            .rpc_client
            .send(jsonrpc::Request::new(
                "eth_getTransactionReceipt",
                vec![jsonrpc::serialize(transaction_hash)?],
                JSONRPC_VERSION.into(),
            ))
            .await
            .context("failed to get transaction receipt")?;

        Ok(receipt)
    }

    /// Counts pending transactions too, so back to back calls get distinct
    /// nonces.
    pub async fn get_transaction_count(&self, account: Address) -> anyhow::Result<u64> {
        let count: String = self
            .rpc_client
            .send(jsonrpc::Request::new(
                "eth_getTransactionCount",
                vec![jsonrpc::serialize(account)?, jsonrpc::serialize("pending")?],
                JSONRPC_VERSION.into(),
            ))
            .await
            .context("failed to get transaction count")?;

        parse_quantity(&count)
    }

    pub async fn gas_price(&self) -> anyhow::Result<num256::Uint256> {
        let amount = self
            .rpc_client
            .send::<Vec<()>, String>(jsonrpc::Request::new(
                "eth_gasPrice",
                vec![],
                JSONRPC_VERSION.into(),
            ))
            .await
            .context("failed to get gas price")?;
        let amount = num256::Uint256::from_str_radix(amount.trim_start_matches("0x"), 16)?;

        Ok(amount)
    }

    /// Executes a read-only contract call against the latest block.
    pub async fn call(&self, to: Address, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let call_request = CallRequest {
            to,
            data: format!("0x{}", hex::encode(data)),
        };

        let output: String = self
            .rpc_client
            .send(jsonrpc::Request::new(
                "eth_call",
                vec![
                    jsonrpc::serialize(call_request)?,
                    jsonrpc::serialize("latest")?,
                ],
                JSONRPC_VERSION.into(),
            ))
            .await
            .context("failed to call contract")?;

        hex::decode(output.trim_start_matches("0x")).context("call returned invalid hex")
    }
}

#[derive(Debug, Serialize)]
struct CallRequest {
    to: Address,
    data: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: Hash,
    /// Absent on nodes that predate byzantium.
    #[serde(default)]
    pub status: Option<String>,
    pub logs: Vec<Log>,
}

impl TransactionReceipt {
    pub fn is_successful(&self) -> bool {
        self.status.as_deref() == Some("0x1")
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<Hash>,
    pub data: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    #[test]
    fn deserializes_receipt_with_logs() {
        let json = r#"{
            "transactionHash": "0x0101010101010101010101010101010101010101010101010101010101010101",
            "blockNumber": "0x10",
            "status": "0x1",
            "logs": [{
                "address": "0x2222222222222222222222222222222222222222",
                "topics": ["0x0303030303030303030303030303030303030303030303030303030303030303"],
                "data": "0x"
            }]
        }"#;

        let receipt = serde_json::from_str::<TransactionReceipt>(json).unwrap();

        assert!(receipt.is_successful());
        assert_that(&receipt.logs).has_length(1);
        assert_that(&receipt.logs[0].topics[0]).is_equal_to(Hash::from([3u8; 32]));
    }

    #[test]
    fn reverted_receipt_is_not_successful() {
        let json = r#"{
            "transactionHash": "0x0101010101010101010101010101010101010101010101010101010101010101",
            "status": "0x0",
            "logs": []
        }"#;

        let receipt = serde_json::from_str::<TransactionReceipt>(json).unwrap();

        assert!(!receipt.is_successful());
    }
}
