use serde::{Deserialize, Serialize};

/// The Bitcoin network a swap's HTLC lives on.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Bitcoin {
    Mainnet,
    Testnet,
    Regtest,
}

impl Bitcoin {
    /// Human-readable part of the network's bech32 addresses.
    pub fn bech32_hrp(self) -> &'static str {
        match self {
            Bitcoin::Mainnet => "bc",
            Bitcoin::Testnet => "tb",
            Bitcoin::Regtest => "bcrt",
        }
    }
}

impl Default for Bitcoin {
    fn default() -> Self {
        Self::Regtest
    }
}

impl From<Bitcoin> for ::bitcoin::Network {
    fn from(bitcoin: Bitcoin) -> ::bitcoin::Network {
        match bitcoin {
            Bitcoin::Mainnet => ::bitcoin::Network::Bitcoin,
            Bitcoin::Testnet => ::bitcoin::Network::Testnet,
            Bitcoin::Regtest => ::bitcoin::Network::Regtest,
        }
    }
}

impl From<::bitcoin::Network> for Bitcoin {
    fn from(network: ::bitcoin::Network) -> Self {
        match network {
            ::bitcoin::Network::Bitcoin => Bitcoin::Mainnet,
            ::bitcoin::Network::Testnet => Bitcoin::Testnet,
            ::bitcoin::Network::Regtest => Bitcoin::Regtest,
        }
    }
}
