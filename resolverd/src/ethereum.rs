mod escrow;
pub mod geth;

pub use self::escrow::Web3Escrow;
pub use ethbtc::ethereum::{Address, ChainId, Hash};

use anyhow::Context;
use bitcoin::secp256k1::SecretKey;

pub fn private_key(key: &SecretKey) -> anyhow::Result<clarity::PrivateKey> {
    clarity::PrivateKey::from_slice(&key[..])
        .map_err(|_| anyhow::anyhow!("failed to create private key from byte slice"))
}

/// The account controlled by `key`.
pub fn account(key: &SecretKey) -> anyhow::Result<Address> {
    let public_key = private_key(key)?
        .to_public_key()
        .map_err(|_| anyhow::anyhow!("failed to derive account from private key"))?;

    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(public_key.as_bytes());

    Ok(Address::from(bytes))
}

pub fn to_clarity_address(address: Address) -> anyhow::Result<clarity::Address> {
    clarity::Address::from_slice(address.as_bytes())
        .map_err(|_| anyhow::anyhow!("failed to create clarity address from byte slice"))
}

/// Parses a `0x` prefixed hex quantity as returned by the node.
pub fn parse_quantity(quantity: &str) -> anyhow::Result<u64> {
    let digits = quantity
        .strip_prefix("0x")
        .with_context(|| format!("quantity {} is not 0x prefixed", quantity))?;

    u64::from_str_radix(digits, 16).with_context(|| format!("invalid quantity {}", quantity))
}
