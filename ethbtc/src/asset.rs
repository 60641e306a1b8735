use conquer_once::Lazy;
use num::{pow::Pow, BigUint, Integer, Num, Zero};
use serde::{
    de::{self, Deserialize, Deserializer},
    ser::{Serialize, Serializer},
};
use std::{fmt, str::FromStr};

static WEI_IN_ETHER: Lazy<BigUint> = Lazy::new(|| BigUint::from(10u8).pow(18u32));

#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("value provided overflows")]
    Overflow,
    #[error("ether quantity has more than 18 decimal places")]
    Precision,
    #[error("parsing error encountered")]
    Parse(#[from] num::bigint::ParseBigIntError),
}

/// A quantity of ether, stored in wei.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct Ether(BigUint);

impl Ether {
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    pub fn max_value() -> Self {
        Self(BigUint::from(2u8).pow(256u32) - 1u8)
    }

    pub fn from_wei<W: Into<BigUint>>(wei: W) -> Self {
        Self(wei.into())
    }

    pub fn try_from_wei_dec_str(str: &str) -> Result<Self, Error> {
        let wei = BigUint::from_str_radix(str, 10)?;
        if wei > Self::max_value().0 {
            return Err(Error::Overflow);
        }

        Ok(Self(wei))
    }

    /// Parses a decimal ether amount such as `0.01`.
    pub fn from_ether_str(str: &str) -> Result<Self, Error> {
        let (int, frac) = match str.split_once('.') {
            Some((int, frac)) => (int, frac.trim_end_matches('0')),
            None => (str, ""),
        };

        if frac.len() > 18 {
            return Err(Error::Precision);
        }

        let int = if int.is_empty() {
            BigUint::zero()
        } else {
            BigUint::from_str_radix(int, 10)?
        };
        let frac = if frac.is_empty() {
            BigUint::zero()
        } else {
            BigUint::from_str_radix(&format!("{:0<18}", frac), 10)?
        };

        let wei = int * &*WEI_IN_ETHER + frac;
        if wei > Self::max_value().0 {
            return Err(Error::Overflow);
        }

        Ok(Self(wei))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn to_wei_dec(&self) -> String {
        self.0.to_str_radix(10)
    }

    /// Big-endian, left padded to 32 bytes as used by the EVM for `uint256`.
    pub fn to_uint256_bytes(&self) -> [u8; 32] {
        let be = self.0.to_bytes_be();
        let mut buf = [0u8; 32];
        let start = 32usize.saturating_sub(be.len());
        buf[start..].copy_from_slice(&be[be.len().saturating_sub(32)..]);

        buf
    }

    pub fn from_uint256_bytes(bytes: &[u8; 32]) -> Self {
        Self(BigUint::from_bytes_be(bytes))
    }
}

impl fmt::Display for Ether {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        let (ether, rem) = self.0.div_rem(&WEI_IN_ETHER);

        if rem.is_zero() {
            write!(f, "{} ETH", ether)
        } else {
            // format number as base 10
            let rem = rem.to_str_radix(10);

            // prefix with 0 in the front until we have 18 chars
            let rem = format!("{:0>18}", rem);

            // trim unnecessary 0s from the back
            let rem = rem.trim_end_matches('0');

            write!(f, "{}.{} ETH", ether, rem)
        }
    }
}

impl FromStr for Ether {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_ether_str(s.trim_end_matches("ETH").trim())
    }
}

impl<'de> Deserialize<'de> for Ether {
    fn deserialize<D>(deserializer: D) -> Result<Self, <D as Deserializer<'de>>::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'vde> de::Visitor<'vde> for Visitor {
            type Value = Ether;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
                formatter.write_str("A string representing a wei quantity")
            }

            fn visit_str<E>(self, v: &str) -> Result<Ether, E>
            where
                E: de::Error,
            {
                Ether::try_from_wei_dec_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

impl Serialize for Ether {
    fn serialize<S>(&self, serializer: S) -> Result<<S as Serializer>::Ok, <S as Serializer>::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_wei_dec())
    }
}
