use crate::config::Data;
use bitcoin::secp256k1::SecretKey;
use config as config_rs;
use ethbtc::{
    coordinator::SafetyMargin,
    engine::FeeRate,
    ethereum::{Address, ChainId},
    ledger,
};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{ffi::OsStr, path::Path};
use url::Url;

/// This struct aims to represent the configuration file as it appears on disk.
///
/// Most importantly, optional elements of the configuration file are
/// represented as `Option`s` here. This allows us to create a dedicated step
/// for filling in default values for absent configuration options.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct File {
    pub data: Option<Data>,
    pub logging: Option<Logging>,
    pub bitcoin: Option<Bitcoin>,
    pub ethereum: Option<Ethereum>,
    pub resolver: Option<Resolver>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Bitcoin {
    pub network: ledger::Bitcoin,
    pub fee_sat_per_vbyte: Option<FeeRate>,
    /// Claims the bitcoin of the swaps this node initiates.
    #[serde(default)]
    #[serde(with = "crate::config::serde::secret_key")]
    pub private_key: Option<SecretKey>,
    pub indexer: Option<Indexer>,
}

/// An Esplora compatible REST API.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Indexer {
    pub url: Url,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Ethereum {
    pub chain_id: ChainId,
    pub node_url: Option<Url>,
    pub escrow_contract: Option<Address>,
    pub eth_token_address: Option<Address>,
    pub wbtc_token_address: Option<Address>,
    #[serde(default)]
    #[serde(with = "crate::config::serde::secret_key")]
    pub private_key: Option<SecretKey>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Resolver {
    pub funding_amount_sats: Option<u64>,
    #[serde(default)]
    #[serde(with = "crate::config::serde::secret_key")]
    pub private_key: Option<SecretKey>,
    pub poll_interval_secs: Option<u64>,
    pub funder: Option<bool>,
    pub safety_margin_secs: Option<SafetyMargin>,
}

impl File {
    pub fn read<D>(config_file: D) -> Result<Self, config_rs::ConfigError>
    where
        D: AsRef<OsStr>,
    {
        let config_file = Path::new(&config_file);

        let mut config = config_rs::Config::new();
        config.merge(config_rs::File::from(config_file))?;
        config.try_into()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Logging {
    pub level: Option<Level>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LevelFilter> for Level {
    fn from(level: LevelFilter) -> Self {
        match level {
            LevelFilter::Off => Level::Error, // We don't support suppressing all logs.
            LevelFilter::Error => Level::Error,
            LevelFilter::Warn => Level::Warn,
            LevelFilter::Info => Level::Info,
            LevelFilter::Debug => Level::Debug,
            LevelFilter::Trace => Level::Trace,
        }
    }
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => LevelFilter::Error,
            Level::Warn => LevelFilter::Warn,
            Level::Info => LevelFilter::Info,
            Level::Debug => LevelFilter::Debug,
            Level::Trace => LevelFilter::Trace,
        }
    }
}
