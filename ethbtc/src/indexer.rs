//! The chain indexer collaborator: an Esplora compatible REST API.

use crate::{engine::Utxo, Error, Timestamp};
use async_trait::async_trait;
use backoff::{future::retry_notify, ExponentialBackoff};
use bitcoin::{
    consensus::encode::{deserialize, serialize_hex},
    Address, OutPoint, Transaction, Txid,
};
use reqwest::{Client, StatusCode, Url};
use std::{fmt, future::Future, str::FromStr, time::Duration};

#[async_trait]
pub trait ChainIndexer: Send + Sync + fmt::Debug {
    async fn address_utxos(&self, address: &Address) -> Result<Vec<Utxo>, Error>;
    async fn transaction(&self, txid: Txid) -> Result<Option<Transaction>, Error>;
    /// The transaction spending `outpoint`, if any.
    async fn spending_transaction(&self, outpoint: OutPoint) -> Result<Option<Txid>, Error>;
    async fn broadcast(&self, transaction: &Transaction) -> Result<Txid, Error>;
    async fn median_time_past(&self) -> Result<Timestamp, Error>;
}

/// Response types of the Esplora REST API.
///
/// Nothing in here is trusted: every value is converted into a core type
/// and validated before it leaves this module.
pub mod v1 {
    use serde::Deserialize;

    #[derive(Clone, Debug, Deserialize, PartialEq)]
    pub struct Utxo {
        pub txid: String,
        pub vout: u32,
        pub value: u64,
        #[serde(default)]
        pub status: Option<TxStatus>,
    }

    #[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
    pub struct TxStatus {
        pub confirmed: bool,
        pub block_height: Option<u32>,
        pub block_time: Option<u32>,
    }

    #[derive(Clone, Debug, Deserialize, PartialEq)]
    pub struct Block {
        pub id: String,
        pub height: u32,
        pub timestamp: u32,
        pub mediantime: u32,
    }

    #[derive(Clone, Debug, Deserialize, PartialEq)]
    pub struct Outspend {
        pub spent: bool,
        pub txid: Option<String>,
        pub vin: Option<u32>,
    }
}

fn parse_txid(txid: &str) -> Result<Txid, Error> {
    Txid::from_str(txid).map_err(|e| Error::network(format!("indexer sent invalid txid: {}", e)))
}

impl v1::Utxo {
    pub fn into_utxo(self, address: &Address) -> Result<Utxo, Error> {
        Ok(Utxo {
            outpoint: OutPoint::new(parse_txid(&self.txid)?, self.vout),
            value: self.value,
            script_pubkey: address.script_pubkey(),
        })
    }
}

impl v1::Outspend {
    pub fn into_spender(self) -> Result<Option<Txid>, Error> {
        match (self.spent, self.txid) {
            (false, _) => Ok(None),
            (true, Some(txid)) => parse_txid(&txid).map(Some),
            (true, None) => Err(Error::network("indexer reports spent output without txid")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{method} request to {url} failed")]
pub struct RequestFailed {
    method: &'static str,
    url: Url,
}

#[derive(Debug, Clone)]
pub struct Esplora {
    base_url: Url,
    client: Client,
    retry_budget: Duration,
}

impl Esplora {
    pub fn new(base_url: Url, timeout: Duration, retry_budget: Duration) -> anyhow::Result<Self> {
        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            base_url,
            client: Client::builder().timeout(timeout).build()?,
            retry_budget,
        })
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(path)
            .map_err(|e| Error::validation(format!("cannot build indexer url: {}", e)))
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            max_elapsed_time: Some(self.retry_budget),
            ..ExponentialBackoff::default()
        }
    }

    /// Retries transient failures until the budget is spent.
    async fn with_retry<T, F, Fut>(&self, what: &str, operation: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, backoff::Error<Error>>>,
    {
        retry_notify(self.backoff(), operation, |e, _| {
            tracing::warn!("failed to {}, retrying ...: {}", what, e)
        })
        .await
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response, backoff::Error<Error>> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            backoff::Error::Transient(Error::network(format!(
                "{}: {}",
                RequestFailed { method: "GET", url },
                e
            )))
        })?;

        if response.status().is_server_error() {
            return Err(backoff::Error::Transient(Error::network(format!(
                "indexer responded with {}",
                response.status()
            ))));
        }

        Ok(response)
    }
}

fn permanent(e: impl fmt::Display) -> backoff::Error<Error> {
    backoff::Error::Permanent(Error::network(e))
}

#[async_trait]
impl ChainIndexer for Esplora {
    async fn address_utxos(&self, address: &Address) -> Result<Vec<Utxo>, Error> {
        let url = self.url(&format!("address/{}/utxo", address))?;

        let utxos = self
            .with_retry("fetch utxos", || {
                let url = url.clone();
                async move {
                    let response = self.get(url).await?;
                    if !response.status().is_success() {
                        return Err(permanent(format!(
                            "indexer responded with {}",
                            response.status()
                        )));
                    }

                    response
                        .json::<Vec<v1::Utxo>>()
                        .await
                        .map_err(|e| permanent(format!("failed to deserialize utxos: {}", e)))
                }
            })
            .await?;

        tracing::trace!("fetched {} utxos of {}", utxos.len(), address);

        utxos
            .into_iter()
            .map(|utxo| utxo.into_utxo(address))
            .collect()
    }

    async fn transaction(&self, txid: Txid) -> Result<Option<Transaction>, Error> {
        let url = self.url(&format!("tx/{}/hex", txid))?;

        self.with_retry("fetch transaction", || {
            let url = url.clone();
            async move {
                let response = self.get(url).await?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }

                let text = response.text().await.map_err(permanent)?;
                let bytes = hex::decode(text.trim()).map_err(permanent)?;
                let transaction = deserialize(&bytes).map_err(permanent)?;

                Ok(Some(transaction))
            }
        })
        .await
    }

    async fn spending_transaction(&self, outpoint: OutPoint) -> Result<Option<Txid>, Error> {
        let url = self.url(&format!("tx/{}/outspend/{}", outpoint.txid, outpoint.vout))?;

        let outspend = self
            .with_retry("fetch outspend", || {
                let url = url.clone();
                async move {
                    let response = self.get(url).await?;
                    if response.status() == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }

                    response
                        .json::<v1::Outspend>()
                        .await
                        .map(Some)
                        .map_err(permanent)
                }
            })
            .await?;

        match outspend {
            Some(outspend) => outspend.into_spender(),
            None => Ok(None),
        }
    }

    async fn broadcast(&self, transaction: &Transaction) -> Result<Txid, Error> {
        let url = self.url("tx")?;
        let hex = serialize_hex(transaction);
        let expected = transaction.txid();

        let txid = self
            .with_retry("broadcast transaction", || {
                let url = url.clone();
                let hex = hex.clone();
                async move {
                    let response = self
                        .client
                        .post(url.clone())
                        .body(hex)
                        .send()
                        .await
                        .map_err(|e| {
                            backoff::Error::Transient(Error::network(format!(
                                "{}: {}",
                                RequestFailed {
                                    method: "POST",
                                    url
                                },
                                e
                            )))
                        })?;

                    let status = response.status();
                    let body = response.text().await.map_err(permanent)?;

                    if status.is_server_error() {
                        return Err(backoff::Error::Transient(Error::network(format!(
                            "indexer responded with {}: {}",
                            status, body
                        ))));
                    }

                    if !status.is_success() {
                        return Err(backoff::Error::Permanent(Error::BroadcastRejected {
                            txid: expected.to_string(),
                            reason: body,
                        }));
                    }

                    parse_txid(body.trim()).map_err(backoff::Error::Permanent)
                }
            })
            .await?;

        if txid != expected {
            return Err(Error::network(format!(
                "indexer acknowledged {} but we sent {}",
                txid, expected
            )));
        }

        Ok(txid)
    }

    async fn median_time_past(&self) -> Result<Timestamp, Error> {
        let tip_url = self.url("blocks/tip/hash")?;

        let block = self
            .with_retry("fetch chain tip", || {
                let tip_url = tip_url.clone();
                async move {
                    let tip = self
                        .get(tip_url)
                        .await?
                        .text()
                        .await
                        .map_err(permanent)?;

                    let block_url = self
                        .url(&format!("block/{}", tip.trim()))
                        .map_err(backoff::Error::Permanent)?;

                    self.get(block_url)
                        .await?
                        .json::<v1::Block>()
                        .await
                        .map_err(permanent)
                }
            })
            .await?;

        Ok(Timestamp::from(block.mediantime))
    }
}
