use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt,
    fmt::{Display, Formatter, LowerHex},
    str::FromStr,
};

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum FromHexError {
    #[error("invalid hex")]
    Hex,
    #[error("expected {expected} bytes but got {got}")]
    Length { expected: usize, got: usize },
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], FromHexError> {
    let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|_| FromHexError::Hex)?;
    if bytes.len() != N {
        return Err(FromHexError::Length {
            expected: N,
            got: bytes.len(),
        });
    }

    let mut array = [0u8; N];
    array.copy_from_slice(&bytes);

    Ok(array)
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; 20]);

impl Address {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a random address for use in tests where the actual value
    /// doesn't / shouldn't matter.
    pub fn random() -> Address {
        use rand::RngCore;

        let mut buffer = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut buffer);

        Address(buffer)
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Address(bytes)
    }
}

impl From<Address> for [u8; 20] {
    fn from(s: Address) -> Self {
        s.0
    }
}

impl FromStr for Address {
    type Err = FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed(s).map(Address)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self)
    }
}

impl LowerHex for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(f, "0x")?;
        }
        for i in &self.0[..] {
            write!(f, "{:02x}", i)?;
        }
        Ok(())
    }
}

/// A 32 byte Ethereum value: transaction hashes, log topics, escrow ids.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; 32]);

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
}

impl From<Hash> for [u8; 32] {
    fn from(s: Hash) -> Self {
        s.0
    }
}

impl From<Address> for Hash {
    fn from(address: Address) -> Self {
        let mut h256 = Hash([0u8; 32]);
        h256.0[(32 - 20)..32].copy_from_slice(&address.0);
        h256
    }
}

impl Hash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for Hash {
    type Err = FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed(s).map(Hash)
    }
}

impl LowerHex for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(f, "0x")?;
        }
        for i in &self.0[..] {
            write!(f, "{:02x}", i)?;
        }
        Ok(())
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self)
    }
}

macro_rules! impl_prefixed_hex_serde {
    ($ty:ident, $expecting:literal) => {
        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&format!("{:#x}", self))
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                struct Visitor;

                impl<'vde> de::Visitor<'vde> for Visitor {
                    type Value = $ty;

                    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                        formatter.write_str($expecting)
                    }

                    fn visit_str<E>(self, v: &str) -> Result<$ty, E>
                    where
                        E: de::Error,
                    {
                        $ty::from_str(v).map_err(|_| {
                            de::Error::invalid_value(de::Unexpected::Str(v), &$expecting)
                        })
                    }
                }

                deserializer.deserialize_str(Visitor)
            }
        }
    };
}

impl_prefixed_hex_serde!(Address, "a 0x prefixed 20 byte hex string");
impl_prefixed_hex_serde!(Hash, "a 0x prefixed 32 byte hex string");

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(u32);

impl ChainId {
    pub const MAINNET: Self = ChainId(1);
    pub const ROPSTEN: Self = ChainId(3);
    pub const GOERLI: Self = ChainId(5);
    pub const GETH_DEV: Self = ChainId(1337);

    pub fn new(id: u32) -> ChainId {
        ChainId(id)
    }
}

impl From<ChainId> for u32 {
    fn from(chain_id: ChainId) -> Self {
        chain_id.0
    }
}

impl From<u32> for ChainId {
    fn from(id: u32) -> Self {
        ChainId(id)
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self.0 {
            1 => "Mainnet",
            3 => "Ropsten",
            4 => "Rinkeby",
            5 => "Goerli",
            42 => "Kovan",
            _ => "Devnet",
        };

        write!(f, "{} ({})", s, self.0)
    }
}
