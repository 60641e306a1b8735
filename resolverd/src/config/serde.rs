use anyhow::Context;
use bitcoin::secp256k1::SecretKey;

/// Reads a 32 byte private key from hex, with or without `0x` prefix.
pub fn parse_secret_key(s: &str) -> anyhow::Result<SecretKey> {
    let bytes = hex::decode(s.trim_start_matches("0x")).context("private key is not hex")?;

    SecretKey::from_slice(&bytes).context("not a valid secp256k1 private key")
}

pub mod secret_key {
    use super::*;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SecretKey>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = Option::<String>::deserialize(deserializer)?;

        hex.map(|hex| parse_secret_key(&hex).map_err(|e| de::Error::custom(format!("{:#}", e))))
            .transpose()
    }

    pub fn serialize<S>(value: &Option<SecretKey>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(key) => serializer.serialize_str(&hex::encode(&key[..])),
            None => serializer.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use spectral::prelude::*;

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct KeyOption {
        #[serde(default)]
        #[serde(with = "crate::config::serde::secret_key")]
        pub private_key: Option<SecretKey>,
    }

    const KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    #[test]
    fn deserializes_hex_key() {
        let value: KeyOption = toml::from_str(&format!("private_key = \"0x{}\"", KEY)).unwrap();

        assert_that(&value.private_key).is_equal_to(Some(SecretKey::from_slice(&[1u8; 32]).unwrap()));
    }

    #[test]
    fn serializes_key_as_plain_hex() {
        let value = KeyOption {
            private_key: Some(SecretKey::from_slice(&[1u8; 32]).unwrap()),
        };

        let str = toml::to_string(&value).unwrap();

        assert_that(&str).is_equal_to(format!("private_key = \"{}\"\n", KEY));
    }

    #[test]
    fn absent_key_is_none() {
        let value: KeyOption = toml::from_str("").unwrap();

        assert_that(&value.private_key).is_none();
        assert_that(&toml::to_string(&value).unwrap()).is_equal_to(String::new());
    }

    #[test]
    fn rejects_short_key() {
        assert_that(&parse_secret_key("0x0101")).is_err();
        assert_that(&toml::from_str::<KeyOption>("private_key = \"zz\"")).is_err();
    }
}
