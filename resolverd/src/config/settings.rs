use crate::{
    config::{file, Data, File},
    fs,
};
use anyhow::{Context, Result};
use bitcoin::secp256k1::SecretKey;
use ethbtc::{
    coordinator::SafetyMargin,
    engine::FeeRate,
    ethereum::{Address, ChainId},
    ledger,
    resolver::ResolverConfig,
};
use log::LevelFilter;
use std::time::Duration;
use url::Url;

/// The effective configuration: the file with every gap filled by a default.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub data: Data,
    pub logging: Logging,
    pub bitcoin: Bitcoin,
    pub ethereum: Ethereum,
    pub resolver: Resolver,
}

impl Settings {
    pub fn from_config_file_and_defaults(
        config_file: File,
        network: Option<ledger::Bitcoin>,
    ) -> Result<Self> {
        let File {
            data,
            logging,
            bitcoin,
            ethereum,
            resolver,
        } = config_file;

        let bitcoin = match bitcoin {
            Some(bitcoin) => Bitcoin::from_file(bitcoin, network)?,
            None => Bitcoin::default_from_network(network.unwrap_or_default()),
        };
        let ethereum = match ethereum {
            Some(ethereum) => Ethereum::from_file(ethereum),
            None => Ethereum::default_from_network(bitcoin.network),
        };

        Ok(Self {
            data: match data {
                Some(data) => data,
                None => Data {
                    dir: fs::data_dir().context("unable to determine default data path")?,
                },
            },
            logging: Logging::from(logging),
            bitcoin,
            ethereum,
            resolver: resolver.map(Resolver::from).unwrap_or_default(),
        })
    }
}

impl From<Settings> for File {
    fn from(settings: Settings) -> Self {
        let Settings {
            data,
            logging,
            bitcoin,
            ethereum,
            resolver,
        } = settings;

        File {
            data: Some(data),
            logging: Some(file::Logging {
                level: Some(logging.level.into()),
            }),
            bitcoin: Some(bitcoin.into()),
            ethereum: Some(ethereum.into()),
            resolver: Some(resolver.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Logging {
    pub level: LevelFilter,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
        }
    }
}

impl From<Option<file::Logging>> for Logging {
    fn from(logging: Option<file::Logging>) -> Self {
        match logging {
            Some(file::Logging { level: Some(level) }) => Logging {
                level: level.into(),
            },
            _ => Logging::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Bitcoin {
    pub network: ledger::Bitcoin,
    pub fee_rate: FeeRate,
    pub private_key: Option<SecretKey>,
    pub indexer_url: Url,
}

impl Bitcoin {
    pub fn default_from_network(network: ledger::Bitcoin) -> Self {
        Self {
            network,
            fee_rate: FeeRate::default(),
            private_key: None,
            indexer_url: default_indexer_url(network),
        }
    }

    fn from_file(bitcoin: file::Bitcoin, network: Option<ledger::Bitcoin>) -> Result<Self> {
        if let Some(network) = network {
            if network != bitcoin.network {
                anyhow::bail!(
                    "Bitcoin network {} from CLI argument does not match {} in config file",
                    network,
                    bitcoin.network
                );
            }
        }

        let network = bitcoin.network;

        Ok(Bitcoin {
            network,
            fee_rate: bitcoin.fee_sat_per_vbyte.unwrap_or_default(),
            private_key: bitcoin.private_key,
            indexer_url: bitcoin
                .indexer
                .map(|indexer| indexer.url)
                .unwrap_or_else(|| default_indexer_url(network)),
        })
    }
}

fn default_indexer_url(network: ledger::Bitcoin) -> Url {
    match network {
        ledger::Bitcoin::Mainnet => {
            Url::parse("https://blockstream.info/api/").expect("static string to be a valid url")
        }
        ledger::Bitcoin::Testnet => Url::parse("https://blockstream.info/testnet/api/")
            .expect("static string to be a valid url"),
        ledger::Bitcoin::Regtest => {
            Url::parse("http://localhost:3002/").expect("static string to be a valid url")
        }
    }
}

impl From<Bitcoin> for file::Bitcoin {
    fn from(bitcoin: Bitcoin) -> Self {
        file::Bitcoin {
            network: bitcoin.network,
            fee_sat_per_vbyte: Some(bitcoin.fee_rate),
            private_key: bitcoin.private_key,
            indexer: Some(file::Indexer {
                url: bitcoin.indexer_url,
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Ethereum {
    pub chain_id: ChainId,
    pub node_url: Url,
    /// No default, every deployment has its own contract.
    pub escrow_contract: Option<Address>,
    pub eth_token_address: Option<Address>,
    pub wbtc_token_address: Option<Address>,
    pub private_key: Option<SecretKey>,
}

impl Ethereum {
    fn default_from_network(network: ledger::Bitcoin) -> Self {
        let chain_id = match network {
            ledger::Bitcoin::Mainnet => ChainId::MAINNET,
            ledger::Bitcoin::Testnet => ChainId::ROPSTEN,
            ledger::Bitcoin::Regtest => ChainId::GETH_DEV,
        };

        Self {
            chain_id,
            node_url: default_node_url(),
            escrow_contract: None,
            eth_token_address: None,
            wbtc_token_address: None,
            private_key: None,
        }
    }

    fn from_file(ethereum: file::Ethereum) -> Self {
        Self {
            chain_id: ethereum.chain_id,
            node_url: ethereum.node_url.unwrap_or_else(default_node_url),
            escrow_contract: ethereum.escrow_contract,
            eth_token_address: ethereum.eth_token_address,
            wbtc_token_address: ethereum.wbtc_token_address,
            private_key: ethereum.private_key,
        }
    }
}

fn default_node_url() -> Url {
    Url::parse("http://localhost:8545").expect("static string to be a valid url")
}

impl From<Ethereum> for file::Ethereum {
    fn from(ethereum: Ethereum) -> Self {
        file::Ethereum {
            chain_id: ethereum.chain_id,
            node_url: Some(ethereum.node_url),
            escrow_contract: ethereum.escrow_contract,
            eth_token_address: ethereum.eth_token_address,
            wbtc_token_address: ethereum.wbtc_token_address,
            private_key: ethereum.private_key,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Resolver {
    pub funding_amount_sats: u64,
    pub private_key: Option<SecretKey>,
    pub poll_interval: Duration,
    pub funder: bool,
    pub safety_margin: SafetyMargin,
}

impl Resolver {
    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            funding_amount_sats: self.funding_amount_sats,
            poll_interval: self.poll_interval,
            funder: self.funder,
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        let defaults = ResolverConfig::default();

        Self {
            funding_amount_sats: defaults.funding_amount_sats,
            private_key: None,
            poll_interval: defaults.poll_interval,
            funder: defaults.funder,
            safety_margin: SafetyMargin::default(),
        }
    }
}

impl From<file::Resolver> for Resolver {
    fn from(resolver: file::Resolver) -> Self {
        let defaults = Resolver::default();

        Self {
            funding_amount_sats: resolver
                .funding_amount_sats
                .unwrap_or(defaults.funding_amount_sats),
            private_key: resolver.private_key,
            poll_interval: resolver
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            funder: resolver.funder.unwrap_or(defaults.funder),
            safety_margin: resolver.safety_margin_secs.unwrap_or(defaults.safety_margin),
        }
    }
}

impl From<Resolver> for file::Resolver {
    fn from(resolver: Resolver) -> Self {
        file::Resolver {
            funding_amount_sats: Some(resolver.funding_amount_sats),
            private_key: resolver.private_key,
            poll_interval_secs: Some(resolver.poll_interval.as_secs()),
            funder: Some(resolver.funder),
            safety_margin_secs: Some(resolver.safety_margin),
        }
    }
}
